//! Mutation batching and commit propagation for nest.
//!
//! A [`Forest`] is the context object for one mutable view over a set of
//! nested repositories: it owns the object cache, the live-root table, the
//! resolver, and the single write lock.
//!
//! # Writes
//!
//! [`Forest::write`] enqueues a path mutation and returns a [`WriteTicket`].
//! Every write issued before the scheduled flush runs joins the same batch.
//! A flush partitions the batch by owning root, builds new trees for the
//! innermost roots first, wraps changed trees in synthetic commits, and
//! folds each child's new commit into its parent until the top root has a
//! new hash. One [`RootChanged`] event is published per batch.
//!
//! # Reads
//!
//! Reads issued while a batch is open or flushing wait for it, so they only
//! ever observe fully applied batches.

pub mod batch;
pub mod config;
pub mod error;
pub mod event;
pub mod forest;

pub use batch::{Entry, WriteTicket};
pub use config::{ForestConfig, Identity};
pub use error::{EngineError, EngineResult};
pub use event::{EventStream, RootChanged};
pub use forest::Forest;
