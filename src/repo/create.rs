//! Repository-metadata generation for newly staged package trees.
//!
//! After an extraction introduces a new top-level directory, any package
//! content in it needs `repodata` before a resolver can use it. A directory
//! that already has `repodata` is left strictly alone: regenerating would
//! destroy metadata a generic generator cannot reproduce (modular stream
//! data in particular).

use anyhow::Result;
use std::path::Path;
use walkdir::WalkDir;

use super::locate::REPODATA_DIR;
use crate::process::Cmd;

/// Tool invoked to generate repository metadata.
pub const CREATEREPO_TOOL: &str = "createrepo_c";

/// What [`ensure_repo_metadata`] decided for one directory.
///
/// Returned explicitly so callers thread the outcome forward instead of
/// re-probing the filesystem later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoMetadataOutcome {
    /// Packages found, no metadata present: a generation run happened.
    Generated,
    /// `repodata` already present: generation skipped.
    SkippedExisting,
    /// No package file anywhere under the directory: nothing to do.
    NoPackages,
}

/// Whether any `.rpm` file exists at any depth under `dir`.
pub fn contains_rpms(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("rpm"))
        })
}

/// Generate repository metadata for `dir` if it holds packages and has none.
pub fn ensure_repo_metadata(dir: &Path) -> Result<RepoMetadataOutcome> {
    ensure_repo_metadata_with(dir, &mut run_createrepo)
}

/// Same as [`ensure_repo_metadata`] with an injectable generator, so the
/// decision logic is testable without the external tool.
pub(crate) fn ensure_repo_metadata_with(
    dir: &Path,
    generate: &mut dyn FnMut(&Path) -> Result<()>,
) -> Result<RepoMetadataOutcome> {
    if dir.join(REPODATA_DIR).is_dir() {
        return Ok(RepoMetadataOutcome::SkippedExisting);
    }
    if !contains_rpms(dir) {
        return Ok(RepoMetadataOutcome::NoPackages);
    }
    println!("  Generating repository metadata for '{}'", dir.display());
    generate(dir)?;
    Ok(RepoMetadataOutcome::Generated)
}

/// Default generator: `createrepo_c` with inherited stdio, so the operator
/// sees progress on large package trees.
pub(crate) fn run_createrepo(dir: &Path) -> Result<()> {
    Cmd::new(CREATEREPO_TOOL)
        .arg_path(dir)
        .error_msg("createrepo_c failed. Install createrepo_c.")
        .run_interactive()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_new_package_tree_triggers_exactly_one_generation() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("Packages")).unwrap();
        fs::write(temp.path().join("Packages/foo-1.0-1.noarch.rpm"), b"rpm").unwrap();

        let mut calls = 0;
        let outcome = ensure_repo_metadata_with(temp.path(), &mut |_| {
            calls += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(outcome, RepoMetadataOutcome::Generated);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_existing_repodata_triggers_zero_calls() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(REPODATA_DIR)).unwrap();
        fs::write(temp.path().join("foo-1.0-1.noarch.rpm"), b"rpm").unwrap();

        let mut calls = 0;
        let outcome = ensure_repo_metadata_with(temp.path(), &mut |_| {
            calls += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(outcome, RepoMetadataOutcome::SkippedExisting);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_dir_without_packages_is_left_alone() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("images")).unwrap();
        fs::write(temp.path().join("images/boot.iso"), b"x").unwrap();

        let mut calls = 0;
        let outcome = ensure_repo_metadata_with(temp.path(), &mut |_| {
            calls += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(outcome, RepoMetadataOutcome::NoPackages);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_contains_rpms_finds_nested_packages() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("a/b/c")).unwrap();
        assert!(!contains_rpms(temp.path()));
        fs::write(temp.path().join("a/b/c/deep-2.0-1.x86_64.rpm"), b"rpm").unwrap();
        assert!(contains_rpms(temp.path()));
    }
}
