use nest_store::StoreError;

/// Errors from submodule metadata and root materialization.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// A child root cannot be materialized from its parent's metadata.
    #[error("missing submodule config for {path}: {reason}")]
    MissingSubmoduleConfig { path: String, reason: String },

    /// `.gitmodules` text could not be parsed.
    #[error("malformed .gitmodules at line {line}: {reason}")]
    MalformedGitmodules { line: usize, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for module operations.
pub type ModuleResult<T> = Result<T, ModuleError>;
