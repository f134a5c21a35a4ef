//! RPM repository discovery.
//!
//! A directory is a repository root iff it contains `repodata/repomd.xml`.
//! The walk is lexically sorted so repo ids come out the same on every run,
//! and an identified repository root is never descended into: its `repodata`
//! subtree (or anything else staged beneath it) must not surface as a nested
//! repository of its own.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Conventional metadata directory name inside a repository root.
pub const REPODATA_DIR: &str = "repodata";

/// Conventional manifest file name inside the metadata directory.
pub const REPOMD_FILE: &str = "repomd.xml";

/// A directory on disk proven to be a valid RPM repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoDir {
    pub path: PathBuf,
    /// Unique within one discovery run; feeds `--repoid` in the closure
    /// command. Carries a `.staged` suffix so it can never collide with a
    /// host-configured repository of the same name.
    pub repo_id: String,
}

/// Whether `dir` holds the repository-metadata marker.
///
/// Only presence is checked; the manifest contents are left to the
/// dependency resolver.
pub fn is_repo_root(dir: &Path) -> bool {
    dir.join(REPODATA_DIR).join(REPOMD_FILE).is_file()
}

/// Locate all non-hidden RPM repositories under `root`.
///
/// The root is canonicalized first, so every returned path is absolute and
/// free of `..` segments and survives a later change of working directory
/// (the paths end up in `file://` baseurls). Failing to canonicalize an
/// unopenable root is an error; unreadable entries further down are reported
/// and skipped, and discovery still succeeds.
pub fn locate_repo_dirs(root: &Path) -> Result<Vec<RepoDir>> {
    let root = fs::canonicalize(root)
        .with_context(|| format!("cannot open repository search root '{}'", root.display()))?;

    let mut found: Vec<PathBuf> = Vec::new();
    let mut walker = WalkDir::new(&root).sort_by_file_name().into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                eprintln!("  [WARN] skipping unreadable entry during repo discovery: {}", err);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        // Hidden subtrees are pruned entirely; the search root itself is
        // exempt so callers may stage under a dot-directory.
        if entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.') {
            walker.skip_current_dir();
            continue;
        }
        if is_repo_root(entry.path()) {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }

    Ok(assign_repo_ids(&root, found))
}

/// Derive a unique repo id per discovered path.
///
/// The id is the final path component plus the `.staged` suffix. When two
/// discovered repositories share a basename, both switch to their
/// root-relative path with separators flattened to `-`, which is unique by
/// construction and stable because the walk is sorted.
fn assign_repo_ids(root: &Path, paths: Vec<PathBuf>) -> Vec<RepoDir> {
    let mut basename_counts: HashMap<String, usize> = HashMap::new();
    for path in &paths {
        *basename_counts.entry(final_component(path)).or_default() += 1;
    }

    paths
        .into_iter()
        .map(|path| {
            let base = final_component(&path);
            let stem = if basename_counts[&base] > 1 {
                let rel = path.strip_prefix(root).unwrap_or(&path);
                let flattened = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("-");
                if flattened.is_empty() {
                    base
                } else {
                    flattened
                }
            } else {
                base
            };
            RepoDir {
                repo_id: format!("{}.staged", stem),
                path,
            }
        })
        .collect()
}

fn final_component(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
