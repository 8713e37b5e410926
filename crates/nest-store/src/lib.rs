//! Repository handle contract for nest.
//!
//! The core never performs storage or network I/O itself. Each repository
//! root is reached through a [`RepoHandle`]: load and save objects by hash,
//! read and update named refs, and build trees from mutation lists. Handles
//! are produced by a [`RepoFactory`], and per-root bookmarks ([`RepoConfig`])
//! are persisted through a [`ConfigStore`].
//!
//! # Backends
//!
//! - [`InMemoryRepo`] / [`InMemoryFactory`] -- framed objects in a `HashMap`
//! - [`InMemoryConfigStore`] -- per-root configs in a `BTreeMap`
//!
//! # Caching
//!
//! [`ObjectCache`] maps hashes to immutable objects shared across every root.
//! Entries are never edited or evicted; a changed object has a new hash.

pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod names;
pub mod traits;

pub use cache::ObjectCache;
pub use config::RepoConfig;
pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryConfigStore, InMemoryFactory, InMemoryRepo};
pub use names::validate_ref_name;
pub use traits::{ConfigStore, RepoFactory, RepoHandle, TreeMutation};
