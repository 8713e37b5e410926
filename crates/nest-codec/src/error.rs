use nest_types::{ObjectId, TypeError};

/// Errors from encoding, decoding, and normalizing objects.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value or bytes do not describe a valid object of the given kind.
    #[error("malformed {kind}: {reason}")]
    MalformedObject { kind: String, reason: String },

    /// Bytes hashed to a different identity than the one they were filed under.
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch {
        expected: ObjectId,
        computed: ObjectId,
    },

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl CodecError {
    pub(crate) fn malformed(kind: impl ToString, reason: impl Into<String>) -> Self {
        Self::MalformedObject {
            kind: kind.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
