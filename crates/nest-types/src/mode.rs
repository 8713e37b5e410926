use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// The kind of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// Opaque byte content.
    Blob,
    /// Directory listing: ordered entries mapping names to object references.
    Tree,
    /// Snapshot of a tree plus history metadata.
    Commit,
    /// Annotated tag pointing at another object.
    Tag,
}

impl ObjectKind {
    /// The name used in the framed encoding header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            other => Err(TypeError::UnknownKind(other.to_string())),
        }
    }
}

/// Mode of a tree entry.
///
/// A closed set: every entry is exactly one of these, so callers match on the
/// variant instead of masking mode bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryMode {
    /// Subtree / directory (0o40000).
    Tree,
    /// Normal file (0o100644).
    Regular,
    /// Executable file (0o100755).
    Executable,
    /// Symbolic link; the blob holds the link target (0o120000).
    Symlink,
    /// Link to a commit in another repository, i.e. a submodule (0o160000).
    Commit,
}

impl EntryMode {
    /// Octal mode value as used in the tree encoding.
    pub fn mode_bits(&self) -> u32 {
        match self {
            Self::Tree => 0o40000,
            Self::Regular => 0o100644,
            Self::Executable => 0o100755,
            Self::Symlink => 0o120000,
            Self::Commit => 0o160000,
        }
    }

    /// Parse from an octal mode value.
    pub fn from_mode_bits(bits: u32) -> Option<Self> {
        match bits {
            0o40000 => Some(Self::Tree),
            0o100644 | 0o100664 => Some(Self::Regular),
            0o100755 => Some(Self::Executable),
            0o120000 => Some(Self::Symlink),
            0o160000 => Some(Self::Commit),
            _ => None,
        }
    }

    /// Parse from the octal text found in encoded trees (e.g. `"100644"`).
    pub fn from_octal_str(s: &str) -> Result<Self, TypeError> {
        u32::from_str_radix(s, 8)
            .ok()
            .and_then(Self::from_mode_bits)
            .ok_or_else(|| TypeError::UnknownMode(s.to_string()))
    }

    /// Kind of the object an entry with this mode points at.
    pub fn object_kind(&self) -> ObjectKind {
        match self {
            Self::Tree => ObjectKind::Tree,
            Self::Commit => ObjectKind::Commit,
            Self::Regular | Self::Executable | Self::Symlink => ObjectKind::Blob,
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Self::Tree)
    }

    /// Regular or executable file.
    pub fn is_file(&self) -> bool {
        matches!(self, Self::Regular | Self::Executable)
    }

    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Executable)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, Self::Symlink)
    }

    /// Submodule link.
    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Commit)
    }

    /// Anything backed by a blob.
    pub fn is_blob(&self) -> bool {
        self.object_kind() == ObjectKind::Blob
    }
}

impl fmt::Display for EntryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06o}", self.mode_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [EntryMode; 5] = [
        EntryMode::Tree,
        EntryMode::Regular,
        EntryMode::Executable,
        EntryMode::Symlink,
        EntryMode::Commit,
    ];

    #[test]
    fn mode_bits_roundtrip() {
        for mode in ALL {
            assert_eq!(EntryMode::from_mode_bits(mode.mode_bits()), Some(mode));
        }
    }

    #[test]
    fn octal_text_parses() {
        assert_eq!(EntryMode::from_octal_str("40000").unwrap(), EntryMode::Tree);
        assert_eq!(EntryMode::from_octal_str("100755").unwrap(), EntryMode::Executable);
        assert!(EntryMode::from_octal_str("777").is_err());
        assert!(EntryMode::from_octal_str("nope").is_err());
    }

    #[test]
    fn predicates_are_exclusive() {
        for mode in ALL {
            let flags = [
                mode.is_tree(),
                mode.is_file(),
                mode.is_symlink(),
                mode.is_commit(),
            ];
            assert_eq!(flags.iter().filter(|f| **f).count(), 1, "{mode:?}");
        }
        assert!(EntryMode::Executable.is_executable());
        assert!(!EntryMode::Regular.is_executable());
    }

    #[test]
    fn object_kind_of_mode() {
        assert_eq!(EntryMode::Tree.object_kind(), ObjectKind::Tree);
        assert_eq!(EntryMode::Commit.object_kind(), ObjectKind::Commit);
        assert_eq!(EntryMode::Symlink.object_kind(), ObjectKind::Blob);
        assert!(EntryMode::Symlink.is_blob());
    }

    #[test]
    fn kind_parse_and_display() {
        for kind in [ObjectKind::Blob, ObjectKind::Tree, ObjectKind::Commit, ObjectKind::Tag] {
            assert_eq!(kind.as_str().parse::<ObjectKind>().unwrap(), kind);
            assert_eq!(format!("{kind}"), kind.as_str());
        }
        assert!("receipt".parse::<ObjectKind>().is_err());
    }

    #[test]
    fn display_is_padded_octal() {
        assert_eq!(format!("{}", EntryMode::Tree), "040000");
        assert_eq!(format!("{}", EntryMode::Regular), "100644");
    }
}
