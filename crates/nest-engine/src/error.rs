use std::sync::Arc;

use nest_modules::ModuleError;
use nest_resolve::ResolveError;
use nest_store::StoreError;

/// Errors from the forest engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The path cannot be written.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// The path does not name a live repository root.
    #[error("not a repository root: {0:?}")]
    NotARoot(String),

    /// The batch this write belonged to failed. Every writer in the batch
    /// receives the same cause.
    #[error("batch failed: {0}")]
    BatchFailed(Arc<EngineError>),

    /// The flush task went away before answering.
    #[error("write was dropped before its batch completed")]
    Closed,

    /// A leaf task panicked or was cancelled.
    #[error("leaf task failed: {0}")]
    Task(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// The underlying cause, looking through `BatchFailed`.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            Self::BatchFailed(inner) => inner.root_cause(),
            other => other,
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
