//! TOML configuration for an assembly run.
//!
//! Batch pipelines describe the whole run in one file: target tree, merge
//! policy, ordered sources, module streams for the closure check.
//!
//! ```toml
//! target_dir = "build/staging/Rocky8.5-x86_64"
//! merge_policy = "always"
//! module_streams = ["perl:5.26", "389-ds:1.4"]
//!
//! [[source]]
//! kind = "iso"
//! path = "isos/Rocky-8.5-x86_64-dvd1.iso"
//! filter_variants = true
//!
//! [[source]]
//! kind = "tarball"
//! path = "tarballs/overlay.tar.gz"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::{MergePolicy, Source};
use crate::repo::closure::ModuleStream;

/// A fully validated assembly-run configuration.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    pub target_dir: PathBuf,
    pub merge_policy: MergePolicy,
    pub sources: Vec<Source>,
    pub module_streams: Vec<ModuleStream>,
    pub include_pe_packages: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StagingToml {
    target_dir: String,
    merge_policy: Option<String>,
    module_streams: Option<Vec<String>>,
    include_pe_packages: Option<bool>,
    #[serde(default, rename = "source")]
    sources: Vec<SourceToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceToml {
    kind: String,
    path: String,
    filter_variants: Option<bool>,
}

impl StagingConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading staging config '{}'", path.display()))?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, config_path: &Path) -> Result<Self> {
        let parsed: StagingToml = toml::from_str(content)
            .with_context(|| format!("parsing staging config '{}'", config_path.display()))?;

        let merge_policy = match parsed
            .merge_policy
            .as_deref()
            .map(|p| p.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("prompt") => MergePolicy::PromptIfExists,
            Some("always") => MergePolicy::AlwaysMerge,
            Some("never") => MergePolicy::NeverMerge,
            Some(other) => bail!(
                "invalid staging config '{}': unsupported merge_policy '{}' (expected 'always', 'prompt' or 'never')",
                config_path.display(),
                other
            ),
        };

        if parsed.sources.is_empty() {
            bail!(
                "invalid staging config '{}': at least one [[source]] is required",
                config_path.display()
            );
        }

        let mut sources = Vec::new();
        for source in &parsed.sources {
            let source_path = PathBuf::from(source.path.trim());
            match source.kind.trim().to_ascii_lowercase().as_str() {
                "iso" => sources.push(Source::Iso {
                    path: source_path,
                    filter_variants: source.filter_variants.unwrap_or(false),
                }),
                "tarball" => {
                    if source.filter_variants.is_some() {
                        bail!(
                            "invalid staging config '{}': filter_variants only applies to kind='iso'",
                            config_path.display()
                        );
                    }
                    sources.push(Source::Tarball { path: source_path });
                }
                other => bail!(
                    "invalid staging config '{}': unsupported source kind '{}' (expected 'iso' or 'tarball')",
                    config_path.display(),
                    other
                ),
            }
        }

        let mut module_streams = Vec::new();
        for raw in parsed.module_streams.unwrap_or_default() {
            let stream = raw.parse::<ModuleStream>().with_context(|| {
                format!("invalid staging config '{}'", config_path.display())
            })?;
            module_streams.push(stream);
        }

        Ok(Self {
            target_dir: PathBuf::from(parsed.target_dir.trim()),
            merge_policy,
            sources,
            module_streams,
            include_pe_packages: parsed.include_pe_packages.unwrap_or(false),
        })
    }
}
