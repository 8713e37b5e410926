use nest_types::{ObjectId, ObjectKind, OBJECT_ID_LEN};
use sha1::{Digest, Sha1};

use crate::error::{CodecError, CodecResult};

/// Kind-framed SHA-1 content hasher.
///
/// Each hasher carries the object kind that is written into the frame header
/// before the body (`"<kind> <len>\0"`). The header keeps a blob and a tree
/// with identical bodies from colliding.
pub struct ContentHasher {
    kind: ObjectKind,
}

impl ContentHasher {
    /// Hasher for blob objects.
    pub const BLOB: Self = Self {
        kind: ObjectKind::Blob,
    };
    /// Hasher for tree objects.
    pub const TREE: Self = Self {
        kind: ObjectKind::Tree,
    };
    /// Hasher for commit objects.
    pub const COMMIT: Self = Self {
        kind: ObjectKind::Commit,
    };
    /// Hasher for annotated tag objects.
    pub const TAG: Self = Self {
        kind: ObjectKind::Tag,
    };

    /// The hasher for a given kind.
    pub const fn for_kind(kind: ObjectKind) -> Self {
        Self { kind }
    }

    /// Frame header for a body of `len` bytes.
    pub fn header(&self, len: usize) -> String {
        format!("{} {}\0", self.kind.as_str(), len)
    }

    /// Header followed by the body: the exact bytes that get hashed.
    pub fn frame(&self, body: &[u8]) -> Vec<u8> {
        let header = self.header(body.len());
        let mut framed = Vec::with_capacity(header.len() + body.len());
        framed.extend_from_slice(header.as_bytes());
        framed.extend_from_slice(body);
        framed
    }

    /// Hash a body.
    pub fn hash(&self, body: &[u8]) -> ObjectId {
        let mut hasher = Sha1::new();
        hasher.update(self.header(body.len()).as_bytes());
        hasher.update(body);
        let digest = hasher.finalize();
        let mut id = [0u8; OBJECT_ID_LEN];
        id.copy_from_slice(&digest);
        ObjectId::from_hash(id)
    }

    /// Verify that a body produces the expected object ID.
    pub fn verify(&self, body: &[u8], expected: &ObjectId) -> CodecResult<()> {
        let computed = self.hash(body);
        if computed != *expected {
            return Err(CodecError::HashMismatch {
                expected: *expected,
                computed,
            });
        }
        Ok(())
    }

    /// The kind written into the header.
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }
}

/// Content address of `body` interpreted as an object of `kind`.
pub fn hash(kind: ObjectKind, body: &[u8]) -> ObjectId {
    ContentHasher::for_kind(kind).hash(body)
}

/// Split framed bytes into kind and body, checking the declared length.
pub fn split_frame(framed: &[u8]) -> CodecResult<(ObjectKind, &[u8])> {
    let space = framed
        .iter()
        .position(|b| *b == b' ')
        .ok_or_else(|| CodecError::malformed("object", "missing kind in header"))?;
    let nul = framed
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| CodecError::malformed("object", "missing NUL after header"))?;
    if nul < space {
        return Err(CodecError::malformed("object", "NUL before kind separator"));
    }

    let kind_str = std::str::from_utf8(&framed[..space])
        .map_err(|_| CodecError::malformed("object", "kind is not UTF-8"))?;
    let kind: ObjectKind = kind_str.parse()?;

    let len: usize = std::str::from_utf8(&framed[space + 1..nul])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| CodecError::malformed(kind, "invalid length in header"))?;

    let body = &framed[nul + 1..];
    if body.len() != len {
        return Err(CodecError::malformed(
            kind,
            format!("header declares {len} bytes, body has {}", body.len()),
        ));
    }
    Ok((kind, body))
}
