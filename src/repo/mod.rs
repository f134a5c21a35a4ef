//! RPM repository handling: discovery, metadata generation, and isolated
//! dependency-closure verification.

pub mod closure;
pub mod create;
pub mod locate;

pub use closure::{ClosureError, ClosurePlan, ModuleStream};
pub use create::{ensure_repo_metadata, RepoMetadataOutcome};
pub use locate::{locate_repo_dirs, RepoDir};
