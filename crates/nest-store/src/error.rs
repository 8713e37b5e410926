use nest_codec::CodecError;
use nest_types::{ObjectId, ObjectKind};

/// Errors from repository handles and the object cache.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A referenced object is not obtainable from the owning store.
    #[error("missing object: {0}")]
    MissingObject(ObjectId),

    /// A referenced tree is not obtainable from the owning store.
    #[error("missing tree: {0}")]
    MissingTree(ObjectId),

    /// A referenced commit is not obtainable from the owning store.
    #[error("missing commit: {0}")]
    MissingCommit(ObjectId),

    /// The object exists but has a different kind than the reference implies.
    #[error("object {id} is a {actual}, expected a {expected}")]
    WrongKind {
        id: ObjectId,
        expected: ObjectKind,
        actual: ObjectKind,
    },

    /// Stored bytes hash to a different identity than they were filed under.
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch {
        expected: ObjectId,
        computed: ObjectId,
    },

    /// A store reported a different identity for an object than the codec.
    #[error("repository mismatch: store returned {returned}, object hashes to {computed}")]
    RepoMismatch {
        returned: ObjectId,
        computed: ObjectId,
    },

    /// The ref name is not acceptable.
    #[error("invalid ref name: {name}: {reason}")]
    InvalidRefName { name: String, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Failure reported by a backend collaborator.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
