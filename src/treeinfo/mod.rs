//! Distribution tree descriptor (`.treeinfo`) reader.
//!
//! Vendor ISO trees describe themselves with an ini-style `.treeinfo` file in
//! one of two mutually exclusive dialects:
//!
//! - **productmd v1** (EL8+): a `[header]` section declares the format
//!   version; release fields live in `[release]`/`[tree]` and each variant
//!   has its own `[variant-<uid>]` section.
//! - **legacy** (EL7 and earlier, pre-productmd): no `[header]`; everything
//!   lives in `[general]`.
//!
//! The dialect is decided once at parse time and every field is resolved
//! eagerly, so a successfully constructed [`TreeInfo`] never has to re-check
//! section presence. A wrong or missing field is a hard parse error, never a
//! silent default: a defaulted arch or version string would get baked into
//! the final image name.

use ini::Ini;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Conventional descriptor file name at the root of a distribution tree.
pub const TREEINFO_FILENAME: &str = ".treeinfo";

/// Format version synthesized for legacy descriptors, which carry none.
pub const LEGACY_FORMAT_VERSION: &str = "0.pre-productmd";

#[derive(Debug, Error)]
pub enum TreeInfoError {
    #[error("treeinfo file does not exist: '{0}'")]
    NotFound(String),

    #[error("cannot read treeinfo '{origin}': {source}")]
    Io {
        origin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse treeinfo '{origin}': {reason}")]
    Malformed { origin: String, reason: String },

    #[error("unsupported productmd treeinfo version '{version}' in '{origin}'")]
    UnsupportedVersion { origin: String, version: String },
}

/// Which descriptor dialect the file was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Pre-productmd, `[general]`-based (<= EL7).
    Legacy,
    /// productmd major version 1 (EL8+).
    ProductmdV1,
}

/// One named component of a distribution tree (e.g. "BaseOS", "AppStream").
///
/// Paths are relative fragments under the tree root. Legacy descriptors have
/// no variant sections, so legacy trees always parse with an empty list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub uid: String,
    /// Where this variant's packages live, e.g. "AppStream/Packages".
    pub packages: String,
    /// Where this variant's repository metadata lives, e.g. "AppStream".
    pub repository: String,
}

/// Normalized view of one parsed tree descriptor.
#[derive(Debug, Clone)]
pub struct TreeInfo {
    pub dialect: Dialect,
    pub format_version: String,
    pub arch: String,
    pub release_short_name: String,
    pub release_version: String,
    pub variants: Vec<Variant>,
}

/// Sections normalized to plain maps with last-write-wins key semantics.
type Sections = HashMap<String, HashMap<String, String>>;

impl TreeInfo {
    /// Read and parse a descriptor file on disk.
    pub fn read(path: &Path) -> Result<Self, TreeInfoError> {
        let origin = path.display().to_string();
        if !path.is_file() {
            return Err(TreeInfoError::NotFound(origin));
        }
        let content = fs::read_to_string(path).map_err(|source| TreeInfoError::Io {
            origin: origin.clone(),
            source,
        })?;
        Self::parse(&content, &origin)
    }

    /// Parse descriptor content already in memory.
    ///
    /// `origin` names where the content came from (a path, or an ISO-internal
    /// path for content pulled out with isoinfo) and is used in errors only.
    pub fn parse(content: &str, origin: &str) -> Result<Self, TreeInfoError> {
        let ini = Ini::load_from_str(content).map_err(|e| TreeInfoError::Malformed {
            origin: origin.to_string(),
            reason: e.to_string(),
        })?;
        let sections = flatten_sections(&ini);

        if sections.contains_key("header") {
            let format_version = require_key(&sections, "header", "version", origin)?;
            let major = format_version
                .split('.')
                .next()
                .unwrap_or("")
                .parse::<u32>()
                .unwrap_or(0);
            if major != 1 {
                return Err(TreeInfoError::UnsupportedVersion {
                    origin: origin.to_string(),
                    version: format_version,
                });
            }
            Self::parse_productmd(&sections, format_version, origin)
        } else {
            if !sections.contains_key("general") {
                return Err(TreeInfoError::Malformed {
                    origin: origin.to_string(),
                    reason: "no [header] section and no [general] section; \
                             not a productmd or pre-productmd treeinfo"
                        .to_string(),
                });
            }
            Self::parse_legacy(&sections, origin)
        }
    }

    fn parse_productmd(
        sections: &Sections,
        format_version: String,
        origin: &str,
    ) -> Result<Self, TreeInfoError> {
        let arch = require_key(sections, "tree", "arch", origin)?;
        let release_version = require_key(sections, "release", "version", origin)?;
        let release_short_name = require_key(sections, "release", "short", origin)?;

        let variant_uids = require_key(sections, "tree", "variants", origin)?;
        let mut variants = Vec::new();
        for uid in variant_uids.split(',') {
            let uid = uid.trim();
            if uid.is_empty() {
                continue;
            }
            let section_name = format!("variant-{}", uid);
            if !sections.contains_key(&section_name) {
                // A silently missing variant would make the assembler fail to
                // exclude or merge that variant's package content.
                return Err(TreeInfoError::Malformed {
                    origin: origin.to_string(),
                    reason: format!(
                        "variant '{}' is listed in [tree] variants but section [{}] is missing",
                        uid, section_name
                    ),
                });
            }
            variants.push(Variant {
                uid: uid.to_string(),
                packages: require_key(sections, &section_name, "packages", origin)?,
                repository: require_key(sections, &section_name, "repository", origin)?,
            });
        }

        Ok(Self {
            dialect: Dialect::ProductmdV1,
            format_version,
            arch,
            release_short_name,
            release_version,
            variants,
        })
    }

    fn parse_legacy(sections: &Sections, origin: &str) -> Result<Self, TreeInfoError> {
        Ok(Self {
            dialect: Dialect::Legacy,
            format_version: LEGACY_FORMAT_VERSION.to_string(),
            arch: require_key(sections, "general", "arch", origin)?,
            release_short_name: require_key(sections, "general", "family", origin)?,
            release_version: require_key(sections, "general", "version", origin)?,
            variants: Vec::new(),
        })
    }

    /// Release version guaranteed to contain a `.` ("8" becomes "8.0").
    ///
    /// Image names embed this, and "SIMP-style" naming expects a
    /// major.minor form even when the vendor descriptor only carries a major.
    pub fn normalized_release_version(&self) -> String {
        if self.release_version.contains('.') {
            self.release_version.clone()
        } else {
            format!("{}.0", self.release_version)
        }
    }
}

/// Collapse the ini into plain per-section maps.
///
/// rust-ini keeps duplicate keys as a multimap; descriptor semantics are
/// last write wins, so later pairs overwrite earlier ones here.
fn flatten_sections(ini: &Ini) -> Sections {
    let mut sections: Sections = HashMap::new();
    for (name, properties) in ini.iter() {
        let Some(name) = name else {
            continue; // keys before the first section header
        };
        let entry = sections.entry(name.to_string()).or_default();
        for (key, value) in properties.iter() {
            entry.insert(key.to_string(), value.to_string());
        }
    }
    sections
}

fn require_key(
    sections: &Sections,
    section: &str,
    key: &str,
    origin: &str,
) -> Result<String, TreeInfoError> {
    sections
        .get(section)
        .and_then(|s| s.get(key))
        .map(|v| v.trim().to_string())
        .ok_or_else(|| TreeInfoError::Malformed {
            origin: origin.to_string(),
            reason: format!("missing '{}' in [{}] section", key, section),
        })
}
