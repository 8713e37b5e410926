//! Foundation types for nest.
//!
//! Every other nest crate depends on `nest-types`. The types here carry no
//! behaviour beyond parsing and formatting; encoding and hashing live in
//! `nest-codec`.
//!
//! # Key Types
//!
//! - [`ObjectId`]: 160-bit content address of an object
//! - [`ObjectKind`]: blob, tree, commit, or annotated tag
//! - [`EntryMode`]: the closed set of tree entry modes

pub mod error;
pub mod mode;
pub mod object;

pub use error::TypeError;
pub use mode::{EntryMode, ObjectKind};
pub use object::{ObjectId, OBJECT_ID_LEN};
