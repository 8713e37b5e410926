use std::cmp::Ordering;
use std::collections::BTreeMap;

use nest_types::{EntryMode, ObjectId, ObjectKind, OBJECT_ID_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::hasher::{split_frame, ContentHasher};
use crate::person::Person;

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

/// Opaque byte content.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub data: Vec<u8>,
}

impl Blob {
    /// Create a new blob from raw bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// The content as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// A single entry in a tree object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Entry name (a single path segment).
    pub name: String,
    /// What the entry is.
    pub mode: EntryMode,
    /// Content address of the referenced object.
    pub object_id: ObjectId,
}

impl TreeEntry {
    /// Create a new tree entry.
    pub fn new(name: impl Into<String>, mode: EntryMode, object_id: ObjectId) -> Self {
        Self {
            name: name.into(),
            mode,
            object_id,
        }
    }
}

/// The path-aware tree comparator.
///
/// Names are compared bytewise, with subtree names compared as if they ended
/// in `/`. This is part of the hash contract: `"a.txt"` sorts before the
/// directory `"a"` because `'.' < '/'`.
pub fn tree_order(a: &TreeEntry, b: &TreeEntry) -> Ordering {
    let key = |e: &TreeEntry| {
        let suffix: &[u8] = if e.mode.is_tree() { b"/" } else { b"" };
        e.name.as_bytes().iter().chain(suffix.iter()).copied().collect::<Vec<u8>>()
    };
    key(a).cmp(&key(b))
}

/// Check that `name` can appear as a single tree entry name.
pub fn validate_entry_name(name: &str) -> CodecResult<()> {
    let reason = if name.is_empty() {
        "empty entry name"
    } else if name == "." || name == ".." {
        "entry name must not be '.' or '..'"
    } else if name.contains('/') {
        "entry name must not contain '/'"
    } else if name.contains('\0') {
        "entry name must not contain NUL"
    } else {
        return Ok(());
    };
    Err(CodecError::malformed(ObjectKind::Tree, format!("{reason}: {name:?}")))
}

/// Directory listing object.
///
/// Entries are unique by name and always held in [`tree_order`], so the
/// encoding never depends on how the tree was built.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Create a tree from entries in any order. A later entry replaces an
    /// earlier one with the same name.
    pub fn new(entries: Vec<TreeEntry>) -> Self {
        let by_name: BTreeMap<String, TreeEntry> =
            entries.into_iter().map(|e| (e.name.clone(), e)).collect();
        let mut entries: Vec<TreeEntry> = by_name.into_values().collect();
        entries.sort_by(tree_order);
        Self { entries }
    }

    /// Create an empty tree.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sorted entries.
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Insert or replace an entry, keeping the order.
    pub fn insert(&mut self, entry: TreeEntry) {
        self.entries.retain(|e| e.name != entry.name);
        let at = self
            .entries
            .partition_point(|e| tree_order(e, &entry) == Ordering::Less);
        self.entries.insert(at, entry);
    }

    /// Remove an entry by name.
    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        let at = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(at))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// Snapshot of a tree with history metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: Person,
    pub committer: Person,
    pub message: String,
}

impl Commit {
    /// A commit whose committer is its author.
    pub fn new(
        tree: ObjectId,
        parents: Vec<ObjectId>,
        author: Person,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            parents,
            committer: author.clone(),
            author,
            message: message.into(),
        }
    }

    /// First parent, if any.
    pub fn parent(&self) -> Option<&ObjectId> {
        self.parents.first()
    }
}

// ---------------------------------------------------------------------------
// Tag
// ---------------------------------------------------------------------------

/// Annotated tag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tagged object.
    pub object: ObjectId,
    /// Kind of the tagged object.
    pub kind: ObjectKind,
    /// Tag name.
    pub name: String,
    pub tagger: Option<Person>,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------------

/// Any object, tagged by kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Object {
    Blob(Blob),
    Tree(Tree),
    Commit(Commit),
    Tag(Tag),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Blob(_) => ObjectKind::Blob,
            Self::Tree(_) => ObjectKind::Tree,
            Self::Commit(_) => ObjectKind::Commit,
            Self::Tag(_) => ObjectKind::Tag,
        }
    }

    /// Canonical body bytes.
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// Framed bytes (`header + body`), the form stores keep.
    pub fn encode_framed(&self) -> Vec<u8> {
        ContentHasher::for_kind(self.kind()).frame(&self.encode())
    }

    /// Content address.
    pub fn id(&self) -> ObjectId {
        ContentHasher::for_kind(self.kind()).hash(&self.encode())
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_tree(&self) -> Option<&Tree> {
        match self {
            Self::Tree(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_commit(&self) -> Option<&Commit> {
        match self {
            Self::Commit(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> Option<&Tag> {
        match self {
            Self::Tag(t) => Some(t),
            _ => None,
        }
    }
}

impl From<Blob> for Object {
    fn from(blob: Blob) -> Self {
        Self::Blob(blob)
    }
}

impl From<Tree> for Object {
    fn from(tree: Tree) -> Self {
        Self::Tree(tree)
    }
}

impl From<Commit> for Object {
    fn from(commit: Commit) -> Self {
        Self::Commit(commit)
    }
}

impl From<Tag> for Object {
    fn from(tag: Tag) -> Self {
        Self::Tag(tag)
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Canonical body bytes of an object.
pub fn encode(object: &Object) -> Vec<u8> {
    match object {
        Object::Blob(blob) => blob.data.clone(),
        Object::Tree(tree) => encode_tree(tree),
        Object::Commit(commit) => encode_commit(commit).into_bytes(),
        Object::Tag(tag) => encode_tag(tag).into_bytes(),
    }
}

fn encode_tree(tree: &Tree) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in &tree.entries {
        out.extend_from_slice(format!("{:o} {}", entry.mode.mode_bits(), entry.name).as_bytes());
        out.push(0);
        out.extend_from_slice(entry.object_id.as_bytes());
    }
    out
}

fn encode_commit(commit: &Commit) -> String {
    let mut out = format!("tree {}\n", commit.tree);
    for parent in &commit.parents {
        out.push_str(&format!("parent {parent}\n"));
    }
    out.push_str(&format!("author {}\n", commit.author));
    out.push_str(&format!("committer {}\n", commit.committer));
    out.push('\n');
    out.push_str(&commit.message);
    out
}

fn encode_tag(tag: &Tag) -> String {
    let mut out = format!("object {}\ntype {}\ntag {}\n", tag.object, tag.kind, tag.name);
    if let Some(tagger) = &tag.tagger {
        out.push_str(&format!("tagger {tagger}\n"));
    }
    out.push('\n');
    out.push_str(&tag.message);
    out
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Parse a body of the given kind.
pub fn decode(kind: ObjectKind, body: &[u8]) -> CodecResult<Object> {
    match kind {
        ObjectKind::Blob => Ok(Object::Blob(Blob::new(body))),
        ObjectKind::Tree => decode_tree(body).map(Object::Tree),
        ObjectKind::Commit => decode_commit(body).map(Object::Commit),
        ObjectKind::Tag => decode_tag(body).map(Object::Tag),
    }
}

/// Parse framed bytes (`header + body`).
pub fn decode_framed(framed: &[u8]) -> CodecResult<Object> {
    let (kind, body) = split_frame(framed)?;
    decode(kind, body)
}

fn decode_tree(body: &[u8]) -> CodecResult<Tree> {
    let malformed = |reason: &str| CodecError::malformed(ObjectKind::Tree, reason);
    let mut entries = Vec::new();
    let mut rest = body;

    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| malformed("unexpected end in mode"))?;
        let mode_str =
            std::str::from_utf8(&rest[..space]).map_err(|_| malformed("mode is not UTF-8"))?;
        let mode = EntryMode::from_octal_str(mode_str)?;
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| malformed("unexpected end in name"))?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|_| malformed("name is not UTF-8"))?
            .to_string();
        rest = &rest[nul + 1..];

        if rest.len() < OBJECT_ID_LEN {
            return Err(malformed("unexpected end in object id"));
        }
        let object_id = ObjectId::from_slice(&rest[..OBJECT_ID_LEN])?;
        rest = &rest[OBJECT_ID_LEN..];

        entries.push(TreeEntry::new(name, mode, object_id));
    }

    Ok(Tree::new(entries))
}

/// Header lines up to the first blank line, then the message verbatim.
fn split_headers<'a>(kind: ObjectKind, body: &'a [u8]) -> CodecResult<(Vec<&'a str>, String)> {
    let text = std::str::from_utf8(body)
        .map_err(|_| CodecError::malformed(kind, "body is not UTF-8"))?;
    let (head, message) = match text.find("\n\n") {
        Some(at) => (&text[..at], &text[at + 2..]),
        None => (text.trim_end_matches('\n'), ""),
    };
    Ok((head.lines().collect(), message.to_string()))
}

fn decode_commit(body: &[u8]) -> CodecResult<Commit> {
    let kind = ObjectKind::Commit;
    let (headers, message) = split_headers(kind, body)?;

    let mut tree = None;
    let mut parents = Vec::new();
    let mut author = None;
    let mut committer = None;

    for line in headers {
        // Continuation lines belong to multi-line headers such as signatures,
        // which the core neither produces nor interprets.
        if line.starts_with(' ') {
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        match key {
            "tree" => tree = Some(value.parse::<ObjectId>()?),
            "parent" => parents.push(value.parse::<ObjectId>()?),
            "author" => author = Some(Person::parse(value)?),
            "committer" => committer = Some(Person::parse(value)?),
            _ => {}
        }
    }

    let tree = tree.ok_or_else(|| CodecError::malformed(kind, "missing tree"))?;
    let author = author.ok_or_else(|| CodecError::malformed(kind, "missing author"))?;
    let committer = committer.unwrap_or_else(|| author.clone());

    Ok(Commit {
        tree,
        parents,
        author,
        committer,
        message,
    })
}

fn decode_tag(body: &[u8]) -> CodecResult<Tag> {
    let kind = ObjectKind::Tag;
    let (headers, message) = split_headers(kind, body)?;

    let mut object = None;
    let mut target_kind = None;
    let mut name = None;
    let mut tagger = None;

    for line in headers {
        if line.starts_with(' ') {
            continue;
        }
        let (key, value) = line.split_once(' ').unwrap_or((line, ""));
        match key {
            "object" => object = Some(value.parse::<ObjectId>()?),
            "type" => target_kind = Some(value.parse::<ObjectKind>()?),
            "tag" => name = Some(value.to_string()),
            "tagger" => tagger = Some(Person::parse(value)?),
            _ => {}
        }
    }

    Ok(Tag {
        object: object.ok_or_else(|| CodecError::malformed(kind, "missing object"))?,
        kind: target_kind.ok_or_else(|| CodecError::malformed(kind, "missing type"))?,
        name: name.ok_or_else(|| CodecError::malformed(kind, "missing tag name"))?,
        tagger,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash;
    use proptest::prelude::*;

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_hash([n; OBJECT_ID_LEN])
    }

    fn ada() -> Person {
        Person::new("Ada", "ada@example.com", 1_700_000_000, 60)
    }

    #[test]
    fn empty_tree_matches_git() {
        let id = Object::Tree(Tree::empty()).id();
        assert_eq!(id.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
    }

    #[test]
    fn directories_sort_as_if_slash_suffixed() {
        let tree = Tree::new(vec![
            TreeEntry::new("a", EntryMode::Tree, oid(1)),
            TreeEntry::new("a.txt", EntryMode::Regular, oid(2)),
            TreeEntry::new("a0", EntryMode::Regular, oid(3)),
        ]);
        let names: Vec<&str> = tree.entries().iter().map(|e| e.name.as_str()).collect();
        // '.' (0x2e) < '/' (0x2f) < '0' (0x30)
        assert_eq!(names, vec!["a.txt", "a", "a0"]);
    }

    #[test]
    fn file_named_like_directory_sorts_plainly() {
        let tree = Tree::new(vec![
            TreeEntry::new("a", EntryMode::Regular, oid(1)),
            TreeEntry::new("a.txt", EntryMode::Regular, oid(2)),
        ]);
        assert_eq!(tree.entries()[0].name, "a");
    }

    #[test]
    fn later_duplicate_replaces_earlier() {
        let tree = Tree::new(vec![
            TreeEntry::new("x", EntryMode::Regular, oid(1)),
            TreeEntry::new("x", EntryMode::Executable, oid(2)),
        ]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get("x").unwrap().object_id, oid(2));
    }

    #[test]
    fn insert_and_remove_keep_order() {
        let mut tree = Tree::new(vec![TreeEntry::new("b", EntryMode::Regular, oid(1))]);
        tree.insert(TreeEntry::new("a", EntryMode::Tree, oid(2)));
        tree.insert(TreeEntry::new("c", EntryMode::Regular, oid(3)));
        tree.insert(TreeEntry::new("b", EntryMode::Symlink, oid(4)));
        let names: Vec<&str> = tree.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(tree.get("b").unwrap().mode, EntryMode::Symlink);

        assert!(tree.remove("a").is_some());
        assert!(tree.remove("a").is_none());
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn tree_decode_roundtrip() {
        let tree = Tree::new(vec![
            TreeEntry::new("src", EntryMode::Tree, oid(1)),
            TreeEntry::new("run.sh", EntryMode::Executable, oid(2)),
            TreeEntry::new("link", EntryMode::Symlink, oid(3)),
            TreeEntry::new("lib", EntryMode::Commit, oid(4)),
        ]);
        let object = Object::Tree(tree);
        let decoded = decode(ObjectKind::Tree, &object.encode()).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn tree_encoding_uses_unpadded_octal() {
        let tree = Tree::new(vec![TreeEntry::new("d", EntryMode::Tree, oid(9))]);
        let body = encode(&Object::Tree(tree));
        assert!(body.starts_with(b"40000 d\0"));
        assert_eq!(body.len(), "40000 d\0".len() + OBJECT_ID_LEN);
    }

    #[test]
    fn truncated_tree_is_malformed() {
        let tree = Tree::new(vec![TreeEntry::new("f", EntryMode::Regular, oid(1))]);
        let body = encode(&Object::Tree(tree));
        let err = decode(ObjectKind::Tree, &body[..body.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedObject { .. }));
    }

    #[test]
    fn commit_encoding_layout() {
        let commit = Commit::new(oid(1), vec![oid(2)], ada(), "hello\n");
        let text = String::from_utf8(encode(&Object::Commit(commit))).unwrap();
        let expected = format!(
            "tree {}\nparent {}\nauthor Ada <ada@example.com> 1700000000 +0100\ncommitter Ada <ada@example.com> 1700000000 +0100\n\nhello\n",
            oid(1),
            oid(2)
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn commit_decode_roundtrip() {
        let mut commit = Commit::new(oid(1), vec![oid(2), oid(3)], ada(), "merge\n\nbody");
        commit.committer = Person::new("Bob", "bob@example.com", 1_700_000_100, -120);
        let object = Object::Commit(commit);
        let decoded = decode(ObjectKind::Commit, &object.encode()).unwrap();
        assert_eq!(decoded, object);
        assert_eq!(decoded.id(), object.id());
    }

    #[test]
    fn commit_without_tree_is_malformed() {
        let body = b"author A <a@b> 1 +0000\n\nmsg";
        assert!(decode(ObjectKind::Commit, body).is_err());
    }

    #[test]
    fn tag_decode_roundtrip() {
        let tag = Tag {
            object: oid(7),
            kind: ObjectKind::Commit,
            name: "v1.0".into(),
            tagger: Some(ada()),
            message: "release\n".into(),
        };
        let object = Object::Tag(tag);
        assert_eq!(decode(ObjectKind::Tag, &object.encode()).unwrap(), object);
    }

    #[test]
    fn framed_decode_roundtrip() {
        let object = Object::Blob(Blob::new(&b"bytes"[..]));
        let framed = object.encode_framed();
        assert_eq!(&framed[..7], b"blob 5\0");
        assert_eq!(decode_framed(&framed).unwrap(), object);
    }

    #[test]
    fn entry_names_validated() {
        assert!(validate_entry_name("ok.txt").is_ok());
        assert!(validate_entry_name("").is_err());
        assert!(validate_entry_name("..").is_err());
        assert!(validate_entry_name("a/b").is_err());
        assert!(validate_entry_name("a\0").is_err());
    }

    #[test]
    fn changing_any_commit_field_changes_hash() {
        let base = Commit::new(oid(1), vec![oid(2)], ada(), "msg");
        let id = Object::Commit(base.clone()).id();

        let mut c = base.clone();
        c.tree = oid(9);
        assert_ne!(Object::Commit(c).id(), id);

        let mut c = base.clone();
        c.parents.clear();
        assert_ne!(Object::Commit(c).id(), id);

        let mut c = base.clone();
        c.author.seconds += 1;
        assert_ne!(Object::Commit(c).id(), id);

        let mut c = base.clone();
        c.committer.email = "other@example.com".into();
        assert_ne!(Object::Commit(c).id(), id);

        let mut c = base;
        c.message.push('!');
        assert_ne!(Object::Commit(c).id(), id);
    }

    fn entry_strategy() -> impl Strategy<Value = Vec<TreeEntry>> {
        let mode = prop_oneof![
            Just(EntryMode::Tree),
            Just(EntryMode::Regular),
            Just(EntryMode::Executable),
            Just(EntryMode::Symlink),
            Just(EntryMode::Commit),
        ];
        prop::collection::btree_map("[a-z0-9._-]{1,8}", (mode, any::<u8>()), 0..16).prop_map(
            |map| {
                map.into_iter()
                    .map(|(name, (mode, n))| TreeEntry::new(name, mode, oid(n)))
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn tree_encoding_ignores_insertion_order(
            (entries, shuffled) in entry_strategy()
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            prop_assume!(entries.iter().all(|e| validate_entry_name(&e.name).is_ok()));
            let a = encode(&Object::Tree(Tree::new(entries)));
            let b = encode(&Object::Tree(Tree::new(shuffled)));
            prop_assert_eq!(a, b);
        }

        #[test]
        fn blob_hash_tracks_bytes(a in prop::collection::vec(any::<u8>(), 0..64),
                                  b in prop::collection::vec(any::<u8>(), 0..64)) {
            let same = hash(ObjectKind::Blob, &a) == hash(ObjectKind::Blob, &b);
            prop_assert_eq!(same, a == b);
        }
    }
}
