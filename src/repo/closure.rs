//! Isolated dependency-closure verification via `dnf repoclosure`.
//!
//! The closure check must not see the host's package-manager configuration:
//! a host repo sharing an id with a staged repo, or simply being enabled,
//! silently corrupts the result. [`ClosurePlan`] therefore builds everything
//! inside an ephemeral root: a private `dnf.conf`, an empty `reposdir` so no
//! host repo file is ever loaded, and one `--repofrompath`/`--repoid` pair
//! per staged repository pointing at a `file://` URI.
//!
//! Module streams that must participate in resolution are enabled in
//! separate pre-step commands against the same root. Enabling an
//! already-enabled stream is not an error, so the pre-steps are safe to
//! repeat.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::TempDir;
use thiserror::Error;

use super::locate::RepoDir;
use crate::process::Cmd;

/// Base configuration file name inside the ephemeral root.
pub const DNF_CONF_FILENAME: &str = "dnf.conf";

/// Empty repository-configuration directory name inside the ephemeral root.
pub const REPOS_DIR_NAME: &str = "repos.d";

#[derive(Debug, Error)]
pub enum ClosureError {
    #[error("no repositories to verify; refusing to build an empty repoclosure")]
    NoRepos,

    #[error("duplicate repo id '{0}' across staged repositories")]
    DuplicateRepoId(String),

    #[error("invalid module stream '{0}': expected 'name:stream'")]
    InvalidModuleStream(String),

    #[error("failed to prepare isolated repoclosure root: {0}")]
    Setup(#[source] std::io::Error),

    #[error("failed to run '{command}': {detail}")]
    Tool { command: String, detail: String },

    #[error("'{command}' exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("dependency closure is incomplete: {} package(s) with unresolved requirements", .0.len())]
    Unresolved(Vec<UnresolvedPackage>),
}

/// One package the resolver could not satisfy, with the requirements it
/// found no provider for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedPackage {
    pub package: String,
    pub requirements: Vec<String>,
}

impl fmt::Display for UnresolvedPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.package, self.requirements.join(", "))
    }
}

/// A `name:stream` pair to enable before closure verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStream {
    pub name: String,
    pub stream: String,
}

impl ModuleStream {
    pub fn spec(&self) -> String {
        format!("{}:{}", self.name, self.stream)
    }
}

impl FromStr for ModuleStream {
    type Err = ClosureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, stream)) if !name.trim().is_empty() && !stream.trim().is_empty() => {
                Ok(Self {
                    name: name.trim().to_string(),
                    stream: stream.trim().to_string(),
                })
            }
            _ => Err(ClosureError::InvalidModuleStream(s.to_string())),
        }
    }
}

/// A fully prepared closure run: ephemeral root, base config, commands.
///
/// The root lives as long as the plan and is removed when the plan drops,
/// on success and failure alike.
#[derive(Debug)]
pub struct ClosurePlan {
    root: TempDir,
    conf_path: PathBuf,
    repos: Vec<RepoDir>,
    module_streams: Vec<ModuleStream>,
}

impl ClosurePlan {
    /// Validate inputs and materialize the isolated root.
    ///
    /// `include_pe` drops the `*-pe-*` exclusion pattern so enterprise
    /// packages participate in the closure.
    pub fn build(
        repos: &[RepoDir],
        module_streams: &[ModuleStream],
        include_pe: bool,
    ) -> Result<Self, ClosureError> {
        if repos.is_empty() {
            return Err(ClosureError::NoRepos);
        }
        let mut seen = std::collections::HashSet::new();
        for repo in repos {
            if !seen.insert(repo.repo_id.as_str()) {
                return Err(ClosureError::DuplicateRepoId(repo.repo_id.clone()));
            }
        }

        let root = TempDir::with_prefix("stager-repoclosure-").map_err(ClosureError::Setup)?;
        let repos_dir = root.path().join(REPOS_DIR_NAME);
        fs::create_dir(&repos_dir).map_err(ClosureError::Setup)?;
        let conf_path = root.path().join(DNF_CONF_FILENAME);
        fs::write(&conf_path, base_conf(&repos_dir, include_pe)).map_err(ClosureError::Setup)?;

        Ok(Self {
            root,
            conf_path,
            repos: repos.to_vec(),
            module_streams: module_streams.to_vec(),
        })
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    pub fn install_root(&self) -> &Path {
        self.root.path()
    }

    /// Reusable command prefix binding dnf to the isolated root. The
    /// module-enablement pre-steps build on this.
    pub fn base_command(&self) -> Vec<String> {
        vec![
            "dnf".to_string(),
            "-c".to_string(),
            self.conf_path.display().to_string(),
            "--installroot".to_string(),
            self.root.path().display().to_string(),
        ]
    }

    /// One `module enable` command per requested stream.
    ///
    /// These need elevated privilege and must run before the closure
    /// command; repeating them against an already-enabled stream is fine.
    pub fn enable_commands(&self) -> Vec<Vec<String>> {
        self.module_streams
            .iter()
            .map(|stream| {
                let mut cmd = self.base_command();
                cmd.extend([
                    "module".to_string(),
                    "enable".to_string(),
                    stream.spec(),
                    "-y".to_string(),
                ]);
                cmd
            })
            .collect()
    }

    /// The closure-verification command itself.
    pub fn closure_command(&self) -> Vec<String> {
        let mut cmd = vec![
            "dnf".to_string(),
            "-v".to_string(),
            "repoclosure".to_string(),
            "-c".to_string(),
            self.conf_path.display().to_string(),
            "--installroot".to_string(),
            self.root.path().display().to_string(),
        ];
        for repo in &self.repos {
            cmd.push("--repofrompath".to_string());
            cmd.push(format!("{},file://{}", repo.repo_id, repo.path.display()));
            cmd.push("--repoid".to_string());
            cmd.push(repo.repo_id.clone());
        }
        cmd
    }

    /// Run the module-enablement pre-steps, then the closure check.
    ///
    /// An unresolved closure is reported structurally and kept distinct
    /// from the tool itself crashing.
    pub fn run(&self) -> Result<(), ClosureError> {
        for enable in self.enable_commands() {
            run_checked(&enable)?;
        }

        let closure = self.closure_command();
        let line = closure.join(" ");
        let result = Cmd::new(&closure[0])
            .args(&closure[1..])
            .allow_fail()
            .run()
            .map_err(|source| ClosureError::Tool {
                command: line.clone(),
                detail: format!("{:#}", source),
            })?;
        if result.success() {
            return Ok(());
        }

        let unresolved = parse_unresolved(&result.stdout);
        if unresolved.is_empty() {
            Err(ClosureError::CommandFailed {
                command: line,
                status: result.status.to_string(),
            })
        } else {
            Err(ClosureError::Unresolved(unresolved))
        }
    }
}

fn run_checked(command: &[String]) -> Result<(), ClosureError> {
    let line = command.join(" ");
    let result = Cmd::new(&command[0])
        .args(&command[1..])
        .allow_fail()
        .run()
        .map_err(|source| ClosureError::Tool {
            command: line.clone(),
            detail: format!("{:#}", source),
        })?;
    if result.success() {
        Ok(())
    } else {
        Err(ClosureError::CommandFailed {
            command: line,
            status: result.status.to_string(),
        })
    }
}

/// Minimal base configuration for the isolated root.
///
/// gpgcheck stays off: this is a local integrity check over repos we just
/// staged ourselves, not a trust decision. `reposdir` points at the empty
/// directory inside the root so host repo files are never loaded.
fn base_conf(repos_dir: &Path, include_pe: bool) -> String {
    let mut conf = String::from("[main]\n");
    conf.push_str("keepcache=0\n");
    conf.push_str("exactarch=1\n");
    conf.push_str("obsoletes=1\n");
    conf.push_str("gpgcheck=0\n");
    // plugins are needed for 'dnf repoclosure'
    conf.push_str("plugins=1\n");
    conf.push_str("installonly_limit=5\n");
    conf.push_str(&format!("reposdir={}\n", repos_dir.display()));
    if !include_pe {
        conf.push_str("exclude=*-pe-*\n");
    }
    conf
}

/// Parse `dnf repoclosure` output into per-package unresolved requirements.
///
/// The format is a `package:` line followed by an `unresolved deps:` header
/// and one indented requirement per line.
fn parse_unresolved(output: &str) -> Vec<UnresolvedPackage> {
    let mut unresolved: Vec<UnresolvedPackage> = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("package:") {
            let package = rest.trim().split(" from ").next().unwrap_or("").trim();
            if !package.is_empty() {
                unresolved.push(UnresolvedPackage {
                    package: package.to_string(),
                    requirements: Vec::new(),
                });
            }
        } else if trimmed == "unresolved deps:" || trimmed.is_empty() {
            continue;
        } else if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(current) = unresolved.last_mut() {
                current.requirements.push(trimmed.to_string());
            }
        }
    }
    unresolved
}
