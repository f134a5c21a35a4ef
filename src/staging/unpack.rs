//! ISO unpacking into the staging tree.
//!
//! Extraction goes through `isoinfo` one entry at a time, which keeps the
//! whole flow unprivileged (no loop mounts). The manifest of entries to
//! extract is computed completely (directory entries dropped, excluded
//! variants filtered) before the first file write, so a crash mid-extraction
//! never leaves a half-applied manifest computation.
//!
//! Completeness of a previous unpack is decided by a marker file recording
//! the manifest digest, not by file presence: a file that exists may still
//! be truncated from a run that was killed mid-write.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::process::Cmd;
use crate::treeinfo::{TreeInfo, Variant, TREEINFO_FILENAME};

/// Marker written at the staging root after a complete extraction pass.
pub const UNPACK_MARKER_FILENAME: &str = ".unpack-complete.json";

/// Result of one ISO unpack, threaded back to the assembler explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackOutcome {
    /// Extraction ran; `entries` is the manifest size.
    Extracted { entries: usize },
    /// A marker with a matching manifest digest was found; nothing done.
    AlreadyComplete,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnpackMarker {
    source: String,
    entry_count: usize,
    manifest_sha256: String,
}

/// Validate that `path` really is an ISO image, via `file --keep-going`.
pub(crate) fn validate_iso(path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("ISO image does not exist: '{}'", path.display());
    }
    let result = Cmd::new("file")
        .arg("--keep-going")
        .arg_path(path)
        .error_msg("file(1) failed. Install file.")
        .run()?;
    let description = result.stdout.split(':').skip(1).collect::<String>();
    if !description.contains("ISO") {
        bail!("'{}' is not a valid ISO image", path.display());
    }
    Ok(())
}

/// Full table of contents of the ISO (files and directories), via
/// `isoinfo -Rf`.
pub(crate) fn read_iso_toc(iso: &Path) -> Result<Vec<String>> {
    let result = Cmd::new("isoinfo")
        .args(["-Rf", "-i"])
        .arg_path(iso)
        .error_msg("isoinfo failed to list the ISO. Install genisoimage.")
        .run()?;
    Ok(result
        .stdout
        .lines()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

/// Read and parse the tree descriptor embedded in the ISO, if the TOC
/// names one. Parsing also validates the dialect is supported, before any
/// file is written to the staging tree.
pub(crate) fn read_iso_treeinfo(iso: &Path, toc: &[String]) -> Result<Option<TreeInfo>> {
    let iso_entry = format!("/{}", TREEINFO_FILENAME);
    if !toc.iter().any(|entry| entry == &iso_entry) {
        return Ok(None);
    }
    let result = Cmd::new("isoinfo")
        .args(["-R", "-x", &iso_entry, "-i"])
        .arg_path(iso)
        .error_msg("isoinfo failed to extract the tree descriptor")
        .run()?;
    let origin = format!("{}:{}", iso.display(), iso_entry);
    let info = TreeInfo::parse(&result.stdout, &origin)
        .with_context(|| format!("validating tree descriptor from '{}'", iso.display()))?;
    Ok(Some(info))
}

/// Per-entry file sizes from the ISO directory records, via `isoinfo -l`,
/// keyed by absolute entry path.
pub(crate) fn read_iso_sizes(iso: &Path) -> Result<HashMap<String, u64>> {
    let result = Cmd::new("isoinfo")
        .args(["-l", "-R", "-i"])
        .arg_path(iso)
        .error_msg("isoinfo failed to list entry sizes. Install genisoimage.")
        .run()?;
    Ok(parse_iso_listing(&result.stdout))
}

/// Parse `isoinfo -l` output. Directory headers switch the current path;
/// plain-file rows carry the size in the fifth column, with the entry name
/// after the extent bracket.
fn parse_iso_listing(listing: &str) -> HashMap<String, u64> {
    let mut sizes = HashMap::new();
    let mut current_dir = String::from("/");
    for line in listing.lines() {
        if let Some(dir) = line.strip_prefix("Directory listing of ") {
            current_dir = dir.trim().to_string();
            if !current_dir.ends_with('/') {
                current_dir.push('/');
            }
            continue;
        }
        if !line.starts_with('-') {
            continue;
        }
        let Some((head, tail)) = line.split_once(']') else {
            continue;
        };
        let name = tail.trim();
        if name.is_empty() || name == "." || name == ".." {
            continue;
        }
        let Some(size) = head.split_whitespace().nth(4).and_then(|f| f.parse().ok()) else {
            continue;
        };
        sizes.insert(format!("{}{}", current_dir, name), size);
    }
    sizes
}

/// Whether an entry must be fetched: missing entirely, or present with a
/// length that disagrees with the ISO directory record (a leftover from a
/// run killed mid-write). An entry the listing yielded no size for is
/// trusted on presence alone.
fn needs_fetch(target: &Path, expected: Option<u64>) -> bool {
    let Ok(meta) = fs::metadata(target) else {
        return true;
    };
    match expected {
        Some(size) => meta.len() != size,
        None => false,
    }
}

/// Reduce the TOC to the manifest of entries to extract.
///
/// Drops every entry under an excluded variant's packages or repository
/// path, then drops directory entries (an entry that is the parent of
/// another entry is a directory and gets created implicitly).
pub(crate) fn extraction_manifest(toc: &[String], excluded: &[Variant]) -> Vec<String> {
    let mut entries: Vec<String> = toc
        .iter()
        .filter(|entry| {
            !excluded.iter().any(|variant| {
                let packages = format!("/{}", variant.packages);
                let repository = format!("/{}", variant.repository);
                entry.starts_with(&packages) || entry.starts_with(&repository)
            })
        })
        .cloned()
        .collect();

    let parents: std::collections::HashSet<String> = entries
        .iter()
        .filter_map(|entry| {
            Path::new(entry)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
        })
        .collect();
    entries.retain(|entry| !parents.contains(entry));
    entries
}

fn manifest_digest(entries: &[String]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Unpack `iso` into `out_dir`.
///
/// When `filter_variants` is set and the ISO carries a tree descriptor,
/// every variant's package/repository subtree is excluded from the manifest
/// before anything is written (never extract-then-delete). An entry already
/// present at the destination is re-fetched only when its length disagrees
/// with the ISO directory record, so a partial file from an interrupted run
/// is repaired rather than trusted.
pub(crate) fn unpack_iso(
    iso: &Path,
    out_dir: &Path,
    filter_variants: bool,
) -> Result<UnpackOutcome> {
    validate_iso(iso)?;
    let toc = read_iso_toc(iso)?;
    let sizes = read_iso_sizes(iso)?;
    let treeinfo = read_iso_treeinfo(iso, &toc)?;

    let excluded: Vec<Variant> = match (&treeinfo, filter_variants) {
        (Some(info), true) => {
            for variant in &info.variants {
                println!(
                    "  Filtering out variant '{}' ({})",
                    variant.uid, variant.packages
                );
            }
            info.variants.clone()
        }
        _ => Vec::new(),
    };

    let manifest = extraction_manifest(&toc, &excluded);
    let digest = manifest_digest(&manifest);

    let marker_path = out_dir.join(UNPACK_MARKER_FILENAME);
    if let Some(marker) = read_marker(&marker_path)? {
        if marker.manifest_sha256 == digest {
            println!(
                "  '{}' already fully unpacked into '{}', skipping",
                iso.display(),
                out_dir.display()
            );
            return Ok(UnpackOutcome::AlreadyComplete);
        }
        // Stale marker from a different manifest; drop it so a crash during
        // this pass cannot masquerade as complete.
        fs::remove_file(&marker_path)
            .with_context(|| format!("removing stale unpack marker '{}'", marker_path.display()))?;
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating staging directory '{}'", out_dir.display()))?;

    println!("  Unpacking {} entries from '{}'", manifest.len(), iso.display());
    for entry in &manifest {
        let relative = entry.trim_start_matches('/');
        let target = out_dir.join(relative);
        if !needs_fetch(&target, sizes.get(entry.as_str()).copied()) {
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory '{}'", parent.display()))?;
        }
        Cmd::new("isoinfo")
            .args(["-R", "-x", entry, "-i"])
            .arg_path(iso)
            .error_msg("isoinfo failed to extract an entry")
            .run_to_file(&target)?;
    }

    write_marker(
        &marker_path,
        &UnpackMarker {
            source: iso.display().to_string(),
            entry_count: manifest.len(),
            manifest_sha256: digest,
        },
    )?;

    Ok(UnpackOutcome::Extracted {
        entries: manifest.len(),
    })
}

fn read_marker(path: &Path) -> Result<Option<UnpackMarker>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path)
        .with_context(|| format!("reading unpack marker '{}'", path.display()))?;
    match serde_json::from_slice(&bytes) {
        Ok(marker) => Ok(Some(marker)),
        // An unreadable marker means the previous run is unverifiable;
        // treat as absent and re-extract.
        Err(_) => Ok(None),
    }
}

fn write_marker(path: &Path, marker: &UnpackMarker) -> Result<()> {
    let json = serde_json::to_vec_pretty(marker).context("serializing unpack marker")?;
    fs::write(path, json)
        .with_context(|| format!("writing unpack marker '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::treeinfo::Variant;

    fn toc() -> Vec<String> {
        vec![
            "/.treeinfo".to_string(),
            "/AppStream".to_string(),
            "/AppStream/Packages".to_string(),
            "/AppStream/Packages/aardvark-1.rpm".to_string(),
            "/BaseOS".to_string(),
            "/BaseOS/Packages".to_string(),
            "/BaseOS/Packages/basesystem-11.rpm".to_string(),
            "/EFI".to_string(),
            "/EFI/BOOT".to_string(),
            "/EFI/BOOT/BOOTX64.EFI".to_string(),
            "/isolinux".to_string(),
            "/isolinux/isolinux.bin".to_string(),
        ]
    }

    fn appstream() -> Variant {
        Variant {
            uid: "AppStream".to_string(),
            packages: "AppStream/Packages".to_string(),
            repository: "AppStream".to_string(),
        }
    }

    #[test]
    fn test_manifest_drops_directory_entries() {
        let manifest = extraction_manifest(&toc(), &[]);
        assert!(manifest.contains(&"/BaseOS/Packages/basesystem-11.rpm".to_string()));
        assert!(manifest.contains(&"/.treeinfo".to_string()));
        assert!(!manifest.contains(&"/BaseOS".to_string()));
        assert!(!manifest.contains(&"/BaseOS/Packages".to_string()));
        assert!(!manifest.contains(&"/EFI/BOOT".to_string()));
    }

    #[test]
    fn test_manifest_excludes_variant_subtrees() {
        let manifest = extraction_manifest(&toc(), &[appstream()]);
        assert!(!manifest
            .iter()
            .any(|entry| entry.starts_with("/AppStream")));
        assert!(manifest.contains(&"/BaseOS/Packages/basesystem-11.rpm".to_string()));
        assert!(manifest.contains(&"/EFI/BOOT/BOOTX64.EFI".to_string()));
    }

    #[test]
    fn test_manifest_excludes_repository_path_too() {
        let variant = Variant {
            uid: "Minimal".to_string(),
            packages: "Minimal/Packages".to_string(),
            repository: "Minimal".to_string(),
        };
        let toc = vec![
            "/Minimal".to_string(),
            "/Minimal/repodata/repomd.xml".to_string(),
            "/images/install.img".to_string(),
        ];
        let manifest = extraction_manifest(&toc, &[variant]);
        assert_eq!(manifest, vec!["/images/install.img".to_string()]);
    }

    #[test]
    fn test_manifest_digest_is_order_sensitive_and_stable() {
        let a = vec!["/x".to_string(), "/y".to_string()];
        let b = vec!["/y".to_string(), "/x".to_string()];
        assert_eq!(manifest_digest(&a), manifest_digest(&a));
        assert_ne!(manifest_digest(&a), manifest_digest(&b));
    }

    #[test]
    fn test_parse_iso_listing_maps_entry_paths_to_sizes() {
        let listing = "\
Directory listing of /
d---------   0    0    0            2048 Aug 30 2026 [     29 02]  .
d---------   0    0    0            2048 Aug 30 2026 [     29 02]  ..
----------   0    0    0             412 Aug 30 2026 [     30 00]  .treeinfo

Directory listing of /BaseOS/Packages/
d---------   0    0    0            2048 Aug 30 2026 [     31 02]  .
d---------   0    0    0            2048 Aug 30 2026 [     29 02]  ..
----------   0    0    0           91337 Aug 30 2026 [     32 00]  basesystem-11.rpm
";
        let sizes = parse_iso_listing(listing);
        assert_eq!(sizes.get("/.treeinfo"), Some(&412));
        assert_eq!(
            sizes.get("/BaseOS/Packages/basesystem-11.rpm"),
            Some(&91337)
        );
        assert_eq!(sizes.len(), 2);
    }

    #[test]
    fn test_needs_fetch_on_missing_or_short_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("pkg.rpm");
        assert!(needs_fetch(&file, Some(4)));

        fs::write(&file, "full").unwrap();
        assert!(!needs_fetch(&file, Some(4)));
        // Truncated leftover from an interrupted extraction.
        assert!(needs_fetch(&file, Some(91337)));
        // No size on record: presence wins.
        assert!(!needs_fetch(&file, None));
    }

    #[test]
    fn test_marker_roundtrip() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join(UNPACK_MARKER_FILENAME);
        let marker = UnpackMarker {
            source: "/isos/test.iso".to_string(),
            entry_count: 3,
            manifest_sha256: "abc".to_string(),
        };
        write_marker(&path, &marker).unwrap();
        let read = read_marker(&path).unwrap().unwrap();
        assert_eq!(read.entry_count, 3);
        assert_eq!(read.manifest_sha256, "abc");
    }

    #[test]
    fn test_unreadable_marker_treated_as_absent() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join(UNPACK_MARKER_FILENAME);
        fs::write(&path, "not json").unwrap();
        assert!(read_marker(&path).unwrap().is_none());
    }

    #[test]
    fn test_validate_iso_rejects_missing_file() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(validate_iso(&temp.path().join("nope.iso")).is_err());
    }
}
