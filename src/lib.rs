//! Staging-tree assembly for RPM-based distribution ISO builds.
//!
//! This crate covers the steps that decide *what goes into* a staged
//! distribution tree and *whether it is dependency-complete*, leaving
//! package building, signing and the final image mastering to external
//! tools:
//!
//! - **Treeinfo reading** - Dual-dialect `.treeinfo` parsing (pre-productmd
//!   and productmd v1) with a normalized view of release, arch and variants
//! - **Repository discovery** - Deterministic location of RPM repositories
//!   at any depth under a staged tree
//! - **Closure verification** - Isolated `dnf repoclosure` plans that never
//!   consult the host's own repository configuration
//! - **Staging assembly** - Merging ISO unpacks and tarball overlays into a
//!   re-runnable staging directory, with variant exclusion and repository
//!   metadata generation
//!
//! # Architecture
//!
//! ```text
//! StagingAssembler
//!     │
//!     ├── treeinfo::TreeInfo ──── variant layout, exclusions
//!     ├── staging::unpack ─────── isoinfo-driven ISO extraction
//!     ├── staging::overlay ────── tarball replace-semantics merge
//!     ├── repo::create ────────── createrepo_c for new package trees
//!     └── repo::locate ──┐
//!                        └── repo::closure::ClosurePlan ── dnf repoclosure
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use distro_stager::staging::{MergePolicy, Source, StagingAssembler};
//! use std::path::Path;
//!
//! let mut assembler = StagingAssembler::new(
//!     Path::new("build/staging/Rocky8.5-x86_64"),
//!     MergePolicy::AlwaysMerge,
//! );
//! let report = assembler.assemble(&[
//!     Source::Iso {
//!         path: "isos/Rocky-8.5-x86_64-dvd1.iso".into(),
//!         filter_variants: false,
//!     },
//!     Source::Tarball {
//!         path: "tarballs/overlay.tar.gz".into(),
//!     },
//! ])?;
//! assembler.verify_closure(&[], false)?;
//! ```

pub mod preflight;
pub mod process;
pub mod repo;
pub mod staging;
pub mod treeinfo;

pub use repo::{locate_repo_dirs, ClosurePlan, ModuleStream, RepoDir};
pub use staging::{AssemblyReport, MergePolicy, Source, StagingAssembler, StagingConfig};
pub use treeinfo::{Dialect, TreeInfo, TreeInfoError, Variant};
