//! Staging-tree assembly.
//!
//! The assembler is the top-level orchestrator: it applies an ordered list
//! of content sources (ISO unpacks, tarball overlays) to one target
//! directory, consults the tree descriptor for variant exclusions, and
//! makes sure newly staged package trees end up with repository metadata.
//!
//! Everything runs strictly sequentially. Skipped sources are an outcome,
//! not an error: the run continues and the report says what was skipped and
//! why. A partial tree left behind by a hard failure is never deleted
//! automatically; re-running is cheap and the operator may want to inspect
//! it first.

pub mod config;
mod overlay;
mod unpack;

pub use config::StagingConfig;
pub use overlay::pack_overlay;
pub use unpack::{UnpackOutcome, UNPACK_MARKER_FILENAME};

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::repo::closure::{ClosurePlan, ModuleStream};
use crate::repo::create::{ensure_repo_metadata_with, run_createrepo, RepoMetadataOutcome};
use crate::repo::locate::locate_repo_dirs;
use crate::treeinfo::{TreeInfo, TREEINFO_FILENAME};

/// How to treat a source whose content collides with the existing tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Merge without asking (replace semantics for conflicts).
    AlwaysMerge,
    /// Ask the configured decision provider once per conflicting source.
    PromptIfExists,
    /// Skip any conflicting source.
    NeverMerge,
}

/// Capability to confirm a merge. Injected so batch pipelines never block
/// on a terminal; interactive use gets [`ConsoleDecision`].
pub trait MergeDecision {
    fn confirm_merge(&mut self, target: &Path) -> Result<bool>;
}

/// Asks on stdin. Empty input means yes.
pub struct ConsoleDecision;

impl MergeDecision for ConsoleDecision {
    fn confirm_merge(&mut self, target: &Path) -> Result<bool> {
        print!(
            "Directory '{}' already has conflicting content. Merge? [Yn] ",
            target.display()
        );
        std::io::stdout().flush().context("flushing prompt")?;
        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("reading merge confirmation")?;
        let answer = answer.trim();
        Ok(answer.is_empty() || answer.to_ascii_lowercase().starts_with('y'))
    }
}

/// One content source, applied in caller order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Iso {
        path: PathBuf,
        /// Exclude every descriptor variant's package/repository subtree
        /// from the extraction (a filtered base-OS tree).
        filter_variants: bool,
    },
    Tarball {
        path: PathBuf,
    },
}

impl Source {
    pub fn path(&self) -> &Path {
        match self {
            Source::Iso { path, .. } => path,
            Source::Tarball { path } => path,
        }
    }
}

/// Why a source was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Policy is [`MergePolicy::NeverMerge`] and the source conflicts.
    PolicyNeverMerge,
    /// The decision provider declined the merge.
    MergeDeclined,
    /// A completion marker showed this exact extraction already happened.
    AlreadyComplete,
}

/// A source the run applied, with what it introduced.
#[derive(Debug, Clone)]
pub struct AppliedSource {
    pub path: PathBuf,
    /// Top-level directory names this source introduced (or replaced).
    pub new_top_level: Vec<String>,
    /// Metadata-generation outcome per introduced top-level directory.
    pub repo_outcomes: Vec<(String, RepoMetadataOutcome)>,
}

/// Outcome of one assembly run, threaded back to the caller explicitly
/// rather than via ambient state.
#[derive(Debug, Clone, Default)]
pub struct AssemblyReport {
    pub applied: Vec<AppliedSource>,
    pub skipped: Vec<(PathBuf, SkipReason)>,
}

/// Assembles one staging tree. Single writer: two assemblers against the
/// same target are out of contract.
pub struct StagingAssembler {
    target: PathBuf,
    policy: MergePolicy,
    decision: Box<dyn MergeDecision>,
    generator: Box<dyn FnMut(&Path) -> Result<()>>,
}

impl StagingAssembler {
    pub fn new(target: &Path, policy: MergePolicy) -> Self {
        Self {
            target: target.to_path_buf(),
            policy,
            decision: Box::new(ConsoleDecision),
            generator: Box::new(run_createrepo),
        }
    }

    /// Replace the interactive confirmation with an injected provider.
    pub fn with_decision(mut self, decision: Box<dyn MergeDecision>) -> Self {
        self.decision = decision;
        self
    }

    /// Replace the repository-metadata generator (createrepo_c by default).
    pub fn with_metadata_generator(
        mut self,
        generator: Box<dyn FnMut(&Path) -> Result<()>>,
    ) -> Self {
        self.generator = generator;
        self
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Validate that a directory is a staged distribution tree: it exists
    /// and carries a readable descriptor in a supported dialect.
    pub fn validate_tree(dir: &Path) -> Result<TreeInfo> {
        if !dir.is_dir() {
            anyhow::bail!("no directory found at '{}'", dir.display());
        }
        let treeinfo_path = dir.join(TREEINFO_FILENAME);
        let info = TreeInfo::read(&treeinfo_path).with_context(|| {
            format!(
                "'{}' does not look like an unpacked distribution tree",
                dir.display()
            )
        })?;
        Ok(info)
    }

    /// Apply `sources` in order. Conflict skips are recorded, not fatal;
    /// tool failures abort the run with the failing command.
    pub fn assemble(&mut self, sources: &[Source]) -> Result<AssemblyReport> {
        fs::create_dir_all(&self.target).with_context(|| {
            format!("creating staging directory '{}'", self.target.display())
        })?;

        let mut report = AssemblyReport::default();
        for source in sources {
            match source {
                Source::Iso {
                    path,
                    filter_variants,
                } => self.apply_iso(path, *filter_variants, &mut report)?,
                Source::Tarball { path } => self.apply_tarball(path, &mut report)?,
            }
        }
        Ok(report)
    }

    /// Discover every staged repository and verify the combined set is
    /// dependency-complete, in isolation from the host configuration.
    pub fn verify_closure(
        &self,
        module_streams: &[ModuleStream],
        include_pe: bool,
    ) -> Result<()> {
        let repos = locate_repo_dirs(&self.target)?;
        let plan = ClosurePlan::build(&repos, module_streams, include_pe)
            .context("building repoclosure plan for the staged tree")?;
        plan.run()
            .with_context(|| format!("repoclosure failed for '{}'", self.target.display()))?;
        Ok(())
    }

    fn apply_iso(
        &mut self,
        iso: &Path,
        filter_variants: bool,
        report: &mut AssemblyReport,
    ) -> Result<()> {
        let populated = dir_is_populated(&self.target)?;
        if populated && !self.confirm(report, iso)? {
            return Ok(());
        }

        let before = top_level_names(&self.target)?;
        println!("Unpacking '{}' into '{}'", iso.display(), self.target.display());
        let outcome = unpack::unpack_iso(iso, &self.target, filter_variants)?;
        if outcome == UnpackOutcome::AlreadyComplete {
            report
                .skipped
                .push((iso.to_path_buf(), SkipReason::AlreadyComplete));
            return Ok(());
        }
        let after = top_level_names(&self.target)?;

        let new_top_level: Vec<String> = after.difference(&before).cloned().collect();
        let repo_outcomes = self.generate_metadata(&new_top_level)?;
        report.applied.push(AppliedSource {
            path: iso.to_path_buf(),
            new_top_level,
            repo_outcomes,
        });
        Ok(())
    }

    fn apply_tarball(&mut self, tarball: &Path, report: &mut AssemblyReport) -> Result<()> {
        let existing = top_level_names(&self.target)?;
        let incoming = overlay::archive_top_level(tarball)?;
        let conflicts: BTreeSet<String> =
            incoming.intersection(&existing).cloned().collect();

        if !conflicts.is_empty() && !self.confirm(report, tarball)? {
            return Ok(());
        }

        println!(
            "Overlaying '{}' onto '{}'",
            tarball.display(),
            self.target.display()
        );
        let new_top_level = overlay::extract_overlay(tarball, &self.target, &conflicts)?;
        let repo_outcomes = self.generate_metadata(&new_top_level)?;
        report.applied.push(AppliedSource {
            path: tarball.to_path_buf(),
            new_top_level,
            repo_outcomes,
        });
        Ok(())
    }

    /// Resolve the merge policy for one conflicting source. `false` means
    /// the source was skipped and recorded.
    fn confirm(&mut self, report: &mut AssemblyReport, source: &Path) -> Result<bool> {
        match self.policy {
            MergePolicy::AlwaysMerge => Ok(true),
            MergePolicy::NeverMerge => {
                println!("Skipping '{}': merge policy is never-merge", source.display());
                report
                    .skipped
                    .push((source.to_path_buf(), SkipReason::PolicyNeverMerge));
                Ok(false)
            }
            MergePolicy::PromptIfExists => {
                if self.decision.confirm_merge(&self.target)? {
                    Ok(true)
                } else {
                    println!("Skipping '{}': merge declined", source.display());
                    report
                        .skipped
                        .push((source.to_path_buf(), SkipReason::MergeDeclined));
                    Ok(false)
                }
            }
        }
    }

    fn generate_metadata(
        &mut self,
        top_level: &[String],
    ) -> Result<Vec<(String, RepoMetadataOutcome)>> {
        let mut outcomes = Vec::new();
        for name in top_level {
            let dir = self.target.join(name);
            if !dir.is_dir() {
                continue;
            }
            let outcome = ensure_repo_metadata_with(&dir, self.generator.as_mut())
                .with_context(|| format!("generating repository metadata in '{}'", dir.display()))?;
            outcomes.push((name.clone(), outcome));
        }
        Ok(outcomes)
    }
}

fn dir_is_populated(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("reading staging directory '{}'", dir.display()))?;
    Ok(entries.next().is_some())
}

fn top_level_names(dir: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    if !dir.exists() {
        return Ok(names);
    }
    for entry in fs::read_dir(dir)
        .with_context(|| format!("reading staging directory '{}'", dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating staging directory '{}'", dir.display()))?;
        names.insert(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Scripted stand-in for the interactive prompt.
    struct ScriptedDecision {
        answers: Vec<bool>,
        asked: usize,
    }

    impl ScriptedDecision {
        fn new(answers: Vec<bool>) -> Self {
            Self { answers, asked: 0 }
        }
    }

    impl MergeDecision for ScriptedDecision {
        fn confirm_merge(&mut self, _target: &Path) -> Result<bool> {
            let answer = self.answers.get(self.asked).copied().unwrap_or(false);
            self.asked += 1;
            Ok(answer)
        }
    }

    /// Generator stand-in that never shells out to createrepo_c.
    fn no_metadata() -> Box<dyn FnMut(&Path) -> Result<()>> {
        Box::new(|_| Ok(()))
    }

    fn make_tarball(temp: &TempDir, top: &str, files: &[(&str, &str)]) -> PathBuf {
        let src = temp.path().join("overlay-src").join(top);
        for (rel, content) in files {
            let path = src.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let tarball = temp.path().join(format!("{}.tar.gz", top));
        pack_overlay(&src, &tarball).unwrap();
        tarball
    }

    fn tree_snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(dir)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned();
                files.push((rel, fs::read(entry.path()).unwrap()));
            }
        }
        files
    }

    #[test]
    fn test_overlay_into_empty_tree() {
        let temp = TempDir::new().unwrap();
        let tarball = make_tarball(&temp, "noarch", &[("Packages/a-1.rpm", "a")]);
        let target = temp.path().join("staging");

        let mut assembler = StagingAssembler::new(&target, MergePolicy::AlwaysMerge)
            .with_metadata_generator(no_metadata());
        let report = assembler
            .assemble(&[Source::Tarball { path: tarball }])
            .unwrap();

        assert_eq!(report.applied.len(), 1);
        assert!(report.skipped.is_empty());
        assert_eq!(report.applied[0].new_top_level, vec!["noarch"]);
        assert!(target.join("noarch/Packages/a-1.rpm").is_file());
    }

    #[test]
    fn test_repeat_merge_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let tarball = make_tarball(
            &temp,
            "noarch",
            &[("Packages/a-1.rpm", "a"), ("Packages/b-2.rpm", "b")],
        );
        let target = temp.path().join("staging");

        let mut assembler = StagingAssembler::new(&target, MergePolicy::AlwaysMerge)
            .with_metadata_generator(no_metadata());
        assembler
            .assemble(&[Source::Tarball {
                path: tarball.clone(),
            }])
            .unwrap();
        let first = tree_snapshot(&target);

        assembler
            .assemble(&[Source::Tarball { path: tarball }])
            .unwrap();
        let second = tree_snapshot(&target);

        assert_eq!(first, second);
    }

    #[test]
    fn test_never_merge_skips_conflicting_source() {
        let temp = TempDir::new().unwrap();
        let tarball = make_tarball(&temp, "noarch", &[("Packages/new.rpm", "new")]);
        let target = temp.path().join("staging");
        fs::create_dir_all(target.join("noarch")).unwrap();
        fs::write(target.join("noarch/keep.rpm"), "keep").unwrap();

        let mut assembler = StagingAssembler::new(&target, MergePolicy::NeverMerge);
        let report = assembler
            .assemble(&[Source::Tarball { path: tarball.clone() }])
            .unwrap();

        assert!(report.applied.is_empty());
        assert_eq!(
            report.skipped,
            vec![(tarball, SkipReason::PolicyNeverMerge)]
        );
        // The conflicting directory is untouched.
        assert!(target.join("noarch/keep.rpm").is_file());
        assert!(!target.join("noarch/Packages/new.rpm").exists());
    }

    #[test]
    fn test_declined_prompt_skips_and_continues() {
        let temp = TempDir::new().unwrap();
        let conflicting = make_tarball(&temp, "noarch", &[("x.rpm", "x")]);
        let fresh = make_tarball(&temp, "SIMP", &[("y.rpm", "y")]);
        let target = temp.path().join("staging");
        fs::create_dir_all(target.join("noarch")).unwrap();

        let mut assembler = StagingAssembler::new(&target, MergePolicy::PromptIfExists)
            .with_decision(Box::new(ScriptedDecision::new(vec![false])))
            .with_metadata_generator(no_metadata());
        let report = assembler
            .assemble(&[
                Source::Tarball {
                    path: conflicting.clone(),
                },
                Source::Tarball { path: fresh },
            ])
            .unwrap();

        // First source declined, second (non-conflicting) applied without
        // consulting the provider again.
        assert_eq!(report.skipped, vec![(conflicting, SkipReason::MergeDeclined)]);
        assert_eq!(report.applied.len(), 1);
        assert!(target.join("SIMP/y.rpm").is_file());
    }

    #[test]
    fn test_confirmed_prompt_replaces_conflict() {
        let temp = TempDir::new().unwrap();
        let tarball = make_tarball(&temp, "noarch", &[("new.rpm", "new")]);
        let target = temp.path().join("staging");
        fs::create_dir_all(target.join("noarch")).unwrap();
        fs::write(target.join("noarch/stale.rpm"), "stale").unwrap();

        let mut assembler = StagingAssembler::new(&target, MergePolicy::PromptIfExists)
            .with_decision(Box::new(ScriptedDecision::new(vec![true])))
            .with_metadata_generator(no_metadata());
        let report = assembler
            .assemble(&[Source::Tarball { path: tarball }])
            .unwrap();

        assert_eq!(report.applied.len(), 1);
        assert!(target.join("noarch/new.rpm").is_file());
        assert!(!target.join("noarch/stale.rpm").exists());
    }

    #[test]
    fn test_new_package_tree_gets_repo_metadata_outcome() {
        let temp = TempDir::new().unwrap();
        // A tree that already carries repodata must be skipped, not
        // regenerated.
        let tarball = make_tarball(
            &temp,
            "SIMP",
            &[
                ("noarch/pkg-1.rpm", "pkg"),
                ("repodata/repomd.xml", "<repomd/>"),
            ],
        );
        let target = temp.path().join("staging");

        let mut assembler = StagingAssembler::new(&target, MergePolicy::AlwaysMerge)
            .with_metadata_generator(no_metadata());
        let report = assembler
            .assemble(&[Source::Tarball { path: tarball }])
            .unwrap();

        assert_eq!(
            report.applied[0].repo_outcomes,
            vec![("SIMP".to_string(), RepoMetadataOutcome::SkippedExisting)]
        );
    }

    #[test]
    fn test_fresh_rpm_tree_invokes_generator_once() {
        use std::cell::Cell;
        use std::rc::Rc;

        let temp = TempDir::new().unwrap();
        let tarball = make_tarball(&temp, "noarch", &[("Packages/a-1.rpm", "a")]);
        let target = temp.path().join("staging");

        let calls = Rc::new(Cell::new(0usize));
        let counter = Rc::clone(&calls);
        let mut assembler = StagingAssembler::new(&target, MergePolicy::AlwaysMerge)
            .with_metadata_generator(Box::new(move |_dir| {
                counter.set(counter.get() + 1);
                Ok(())
            }));
        let report = assembler
            .assemble(&[Source::Tarball { path: tarball }])
            .unwrap();

        assert_eq!(calls.get(), 1);
        assert_eq!(
            report.applied[0].repo_outcomes,
            vec![("noarch".to_string(), RepoMetadataOutcome::Generated)]
        );
    }

    #[test]
    fn test_validate_tree_requires_descriptor() {
        let temp = TempDir::new().unwrap();
        let err = StagingAssembler::validate_tree(temp.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("distribution tree"));

        fs::write(
            temp.path().join(TREEINFO_FILENAME),
            "[general]\nfamily = CentOS\nversion = 7\narch = x86_64\n",
        )
        .unwrap();
        let info = StagingAssembler::validate_tree(temp.path()).unwrap();
        assert_eq!(info.release_short_name, "CentOS");
    }

    #[test]
    fn test_validate_tree_rejects_missing_directory() {
        let temp = TempDir::new().unwrap();
        assert!(StagingAssembler::validate_tree(&temp.path().join("nope")).is_err());
    }
}
