//! Config and submodule lifecycle for nest.
//!
//! A forest is a set of live repository roots, each exposed at a global path.
//! The top root lives at `""`; child roots appear wherever a tree holds a
//! commit-mode entry. Children are materialized lazily, the first time a
//! walk crosses into them, from the `.gitmodules` metadata of their parent.
//!
//! - [`Gitmodules`] -- round-trip stable codec for `.gitmodules` text
//! - [`RootTable`] -- live roots keyed by global path, with owner lookup
//! - [`SubmoduleLifecycle`] -- opens roots through the repository factory

pub mod error;
pub mod gitmodules;
pub mod lifecycle;
pub mod roots;

pub use error::{ModuleError, ModuleResult};
pub use gitmodules::{apply_edits, Gitmodules, ModuleEdit, Submodule, GITMODULES};
pub use lifecycle::SubmoduleLifecycle;
pub use roots::{is_path_prefix, RepoRoot, RootTable};
