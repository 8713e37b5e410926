use nest_modules::ModuleError;
use nest_store::StoreError;

/// Errors from path resolution and rule evaluation.
///
/// A path that does not exist is not an error: resolution returns `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A rule blob failed to parse, or its generator rejected the arguments.
    #[error("malformed rule {rule_path}: {reason}")]
    MalformedRule { rule_path: String, reason: String },

    /// A rule names a generator nobody registered.
    #[error("rule {rule_path} uses unknown generator {name:?}")]
    UnknownGenerator { rule_path: String, name: String },

    /// Symlink redirects and rule fallbacks exceeded the configured bound.
    #[error("too many redirects resolving {path} (limit {limit})")]
    TooManyRedirects { path: String, limit: usize },

    /// No top root is attached.
    #[error("no root attached")]
    NoRoot,

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for resolution.
pub type ResolveResult<T> = Result<T, ResolveError>;
