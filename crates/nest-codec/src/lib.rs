//! Object codec for nest.
//!
//! Gives every object its identity. An object is encoded into a canonical
//! body, framed as `"<kind> <byte-length>\0<body>"`, and the SHA-1 digest of
//! the framed bytes is its [`ObjectId`]. The codec is pure: no I/O, no
//! caching, no knowledge of repositories.
//!
//! # Object Types
//!
//! - [`Blob`] -- opaque bytes
//! - [`Tree`] -- entries sorted with the path-aware comparator ([`tree_order`])
//! - [`Commit`] -- tree, parents, author/committer, message
//! - [`Tag`] -- annotated tag (read-only use)
//!
//! # Operations
//!
//! - [`normalize`] -- validate a loosely-typed JSON value and fill defaults
//! - [`encode`] / [`decode`] -- canonical body bytes
//! - [`hash`] -- content address of a body of a given kind

pub mod error;
pub mod hasher;
pub mod normalize;
pub mod object;
pub mod person;

pub use error::{CodecError, CodecResult};
pub use hasher::{hash, ContentHasher};
pub use normalize::normalize;
pub use object::{
    decode, decode_framed, encode, tree_order, validate_entry_name, Blob, Commit, Object, Tag,
    Tree, TreeEntry,
};
pub use person::Person;

pub use nest_types::{EntryMode, ObjectId, ObjectKind};
