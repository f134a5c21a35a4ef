//! Tarball overlay handling for the staging tree.
//!
//! Overlays replace, they do not file-merge: a conflicting top-level
//! directory is deleted in its entirety before extraction so stale files
//! from a previous build can never leak into the new tree.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::Archive;

/// Open an overlay archive, picking the decompressor from the extension.
///
/// Supports `.tar`, `.tar.gz`/`.tgz` and `.tar.zst`.
fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(path)
        .with_context(|| format!("opening overlay tarball '{}'", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let reader: Box<dyn Read> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Box::new(GzDecoder::new(file))
    } else if name.ends_with(".tar.zst") {
        Box::new(
            zstd::stream::Decoder::new(file)
                .with_context(|| format!("initializing zstd decoder for '{}'", path.display()))?,
        )
    } else if name.ends_with(".tar") {
        Box::new(file)
    } else {
        bail!(
            "unsupported overlay archive '{}': expected .tar, .tar.gz, .tgz or .tar.zst",
            path.display()
        );
    };
    Ok(Archive::new(reader))
}

/// First path component of a tar entry, with any leading `./` stripped.
fn top_component(entry_path: &Path) -> Option<String> {
    entry_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .find(|part| part != ".")
}

/// Top-level names an overlay would introduce, without extracting anything.
pub(crate) fn archive_top_level(path: &Path) -> Result<BTreeSet<String>> {
    let mut archive = open_archive(path)?;
    let mut names = BTreeSet::new();
    for entry in archive
        .entries()
        .with_context(|| format!("reading overlay tarball '{}'", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("reading overlay tarball '{}'", path.display()))?;
        let entry_path = entry.path().with_context(|| {
            format!("reading entry path in overlay tarball '{}'", path.display())
        })?;
        if let Some(top) = top_component(&entry_path) {
            names.insert(top);
        }
    }
    Ok(names)
}

/// Delete conflicting top-level directories, then extract the whole overlay.
///
/// Returns the top-level names the overlay introduced. The caller has
/// already decided the conflicts may be replaced.
pub(crate) fn extract_overlay(
    path: &Path,
    target: &Path,
    conflicts: &BTreeSet<String>,
) -> Result<Vec<String>> {
    for name in conflicts {
        let victim = target.join(name);
        if victim.is_dir() {
            println!("  Replacing existing '{}'", victim.display());
            fs::remove_dir_all(&victim).with_context(|| {
                format!(
                    "removing conflicting staged directory '{}' before overlay extraction",
                    victim.display()
                )
            })?;
        } else if victim.exists() {
            fs::remove_file(&victim).with_context(|| {
                format!(
                    "removing conflicting staged file '{}' before overlay extraction",
                    victim.display()
                )
            })?;
        }
    }

    let top_level = archive_top_level(path)?;
    let mut archive = open_archive(path)?;
    archive
        .unpack(target)
        .with_context(|| {
            format!(
                "extracting overlay tarball '{}' into '{}'",
                path.display(),
                target.display()
            )
        })?;
    Ok(top_level.into_iter().collect())
}

/// Build a `.tar.gz` overlay from a directory. Test support for round-trip
/// checks; also handy for snapshotting a staged tree.
pub fn pack_overlay(source_dir: &Path, output: &Path) -> Result<PathBuf> {
    let out = File::create(output)
        .with_context(|| format!("creating overlay tarball '{}'", output.display()))?;
    let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let dir_name = source_dir
        .file_name()
        .with_context(|| format!("overlay source '{}' has no name", source_dir.display()))?;
    builder
        .append_dir_all(dir_name, source_dir)
        .with_context(|| format!("archiving '{}'", source_dir.display()))?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .with_context(|| format!("finalizing overlay tarball '{}'", output.display()))?;
    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_overlay(temp: &TempDir, top: &str, files: &[(&str, &str)]) -> PathBuf {
        let src = temp.path().join("src").join(top);
        for (rel, content) in files {
            let path = src.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let tarball = temp.path().join(format!("{}.tar.gz", top));
        pack_overlay(&src, &tarball).unwrap();
        tarball
    }

    #[test]
    fn test_archive_top_level_lists_directories() {
        let temp = TempDir::new().unwrap();
        let tarball = make_overlay(&temp, "noarch", &[("Packages/a.rpm", "a")]);
        let tops = archive_top_level(&tarball).unwrap();
        assert_eq!(tops.into_iter().collect::<Vec<_>>(), vec!["noarch"]);
    }

    #[test]
    fn test_extract_into_empty_target() {
        let temp = TempDir::new().unwrap();
        let tarball = make_overlay(&temp, "noarch", &[("Packages/a.rpm", "a")]);
        let target = temp.path().join("staging");
        fs::create_dir_all(&target).unwrap();

        let tops = extract_overlay(&tarball, &target, &BTreeSet::new()).unwrap();
        assert_eq!(tops, vec!["noarch"]);
        assert_eq!(
            fs::read_to_string(target.join("noarch/Packages/a.rpm")).unwrap(),
            "a"
        );
    }

    #[test]
    fn test_replace_semantics_drop_stale_files() {
        let temp = TempDir::new().unwrap();
        let tarball = make_overlay(&temp, "noarch", &[("Packages/new.rpm", "new")]);
        let target = temp.path().join("staging");
        // Stale file from a previous build under the same top-level name.
        fs::create_dir_all(target.join("noarch/Packages")).unwrap();
        fs::write(target.join("noarch/Packages/stale.rpm"), "old").unwrap();

        let conflicts: BTreeSet<String> = ["noarch".to_string()].into_iter().collect();
        extract_overlay(&tarball, &target, &conflicts).unwrap();

        assert!(target.join("noarch/Packages/new.rpm").is_file());
        assert!(!target.join("noarch/Packages/stale.rpm").exists());
    }

    #[test]
    fn test_unsupported_archive_extension_is_rejected() {
        let temp = TempDir::new().unwrap();
        let bogus = temp.path().join("overlay.zip");
        fs::write(&bogus, "zip").unwrap();
        assert!(archive_top_level(&bogus).is_err());
    }
}
