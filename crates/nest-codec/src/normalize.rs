//! Validation of loosely-typed object values.
//!
//! Callers describe objects as JSON values (the shape rule generators and the
//! CLI speak). [`normalize`] checks required fields, fills defaults, and
//! coerces arrays and maps into the canonical typed form.

use nest_types::{EntryMode, ObjectId, ObjectKind};
use serde_json::{Map, Value};

use crate::error::{CodecError, CodecResult};
use crate::object::{validate_entry_name, Blob, Commit, Object, Tag, Tree, TreeEntry};
use crate::person::Person;

/// Validate `value` as an object of `kind` and return its canonical form.
///
/// - blob: a string, or an array of byte values
/// - tree: a map `{name: {mode, hash}}` or an array of `{name, mode, hash}`
/// - commit: `tree`, `author`, and `message` are required; `committer`
///   defaults to the author and `parents` (or `parent`) to none
/// - tag: `object`, `type`, `tag`, and `message` are required
pub fn normalize(kind: ObjectKind, value: &Value) -> CodecResult<Object> {
    match kind {
        ObjectKind::Blob => normalize_blob(value).map(Object::Blob),
        ObjectKind::Tree => normalize_tree(value).map(Object::Tree),
        ObjectKind::Commit => normalize_commit(value).map(Object::Commit),
        ObjectKind::Tag => normalize_tag(value).map(Object::Tag),
    }
}

fn normalize_blob(value: &Value) -> CodecResult<Blob> {
    match value {
        Value::String(s) => Ok(Blob::new(s.as_bytes())),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| CodecError::malformed(ObjectKind::Blob, "byte out of range"))
            })
            .collect::<CodecResult<Vec<u8>>>()
            .map(Blob::new),
        _ => Err(CodecError::malformed(
            ObjectKind::Blob,
            "expected a string or byte array",
        )),
    }
}

fn normalize_tree(value: &Value) -> CodecResult<Tree> {
    let entries = match value {
        Value::Object(map) => map
            .iter()
            .map(|(name, entry)| tree_entry(name, entry))
            .collect::<CodecResult<Vec<_>>>()?,
        Value::Array(items) => items
            .iter()
            .map(|entry| {
                let name = field(ObjectKind::Tree, entry, "name")?
                    .as_str()
                    .ok_or_else(|| CodecError::malformed(ObjectKind::Tree, "name must be a string"))?;
                tree_entry(name, entry)
            })
            .collect::<CodecResult<Vec<_>>>()?,
        _ => {
            return Err(CodecError::malformed(
                ObjectKind::Tree,
                "expected a map or array of entries",
            ))
        }
    };
    Ok(Tree::new(entries))
}

fn tree_entry(name: &str, entry: &Value) -> CodecResult<TreeEntry> {
    validate_entry_name(name)?;
    let mode = entry_mode(field(ObjectKind::Tree, entry, "mode")?)?;
    let object_id = object_id(ObjectKind::Tree, field(ObjectKind::Tree, entry, "hash")?)?;
    Ok(TreeEntry::new(name, mode, object_id))
}

/// A mode given as octal bits, octal text, or a mode name.
fn entry_mode(value: &Value) -> CodecResult<EntryMode> {
    let bad = || CodecError::malformed(ObjectKind::Tree, format!("invalid mode {value}"));
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .and_then(EntryMode::from_mode_bits)
            .ok_or_else(bad),
        Value::String(s) => match s.as_str() {
            "tree" => Ok(EntryMode::Tree),
            "file" | "regular" => Ok(EntryMode::Regular),
            "exec" | "executable" => Ok(EntryMode::Executable),
            "sym" | "symlink" => Ok(EntryMode::Symlink),
            "commit" => Ok(EntryMode::Commit),
            octal => EntryMode::from_octal_str(octal).map_err(|_| bad()),
        },
        _ => Err(bad()),
    }
}

fn normalize_commit(value: &Value) -> CodecResult<Commit> {
    let kind = ObjectKind::Commit;
    let map = as_map(kind, value)?;

    let tree = object_id(kind, required(kind, map, "tree")?)?;
    let parents = match map.get("parents").or_else(|| map.get("parent")) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| object_id(kind, v))
            .collect::<CodecResult<Vec<_>>>()?,
        Some(single) => vec![object_id(kind, single)?],
    };
    let author = person(kind, required(kind, map, "author")?)?;
    let committer = match map.get("committer") {
        None | Some(Value::Null) => author.clone(),
        Some(v) => person(kind, v)?,
    };
    let message = string(kind, required(kind, map, "message")?, "message")?;

    Ok(Commit {
        tree,
        parents,
        author,
        committer,
        message,
    })
}

fn normalize_tag(value: &Value) -> CodecResult<Tag> {
    let kind = ObjectKind::Tag;
    let map = as_map(kind, value)?;

    let object = object_id(kind, required(kind, map, "object")?)?;
    let target_kind = string(kind, required(kind, map, "type")?, "type")?.parse()?;
    let name = string(kind, required(kind, map, "tag")?, "tag")?;
    let tagger = match map.get("tagger") {
        None | Some(Value::Null) => None,
        Some(v) => Some(person(kind, v)?),
    };
    let message = string(kind, required(kind, map, "message")?, "message")?;

    Ok(Tag {
        object,
        kind: target_kind,
        name,
        tagger,
        message,
    })
}

/// `{name, email, date?}` where date is `{seconds, offset}` or a bare number
/// of seconds. A missing date means now.
fn person(kind: ObjectKind, value: &Value) -> CodecResult<Person> {
    let map = as_map(kind, value)?;
    let name = string(kind, required(kind, map, "name")?, "name")?;
    let email = string(kind, required(kind, map, "email")?, "email")?;

    match map.get("date") {
        None | Some(Value::Null) => Ok(Person::now(&name, &email)),
        Some(Value::Number(n)) => {
            let seconds = n
                .as_i64()
                .ok_or_else(|| CodecError::malformed(kind, "date must be an integer"))?;
            Ok(Person::new(&name, &email, seconds, 0))
        }
        Some(Value::Object(date)) => {
            let seconds = date
                .get("seconds")
                .and_then(Value::as_i64)
                .ok_or_else(|| CodecError::malformed(kind, "date.seconds must be an integer"))?;
            let offset = match date.get("offset") {
                None => 0,
                Some(v) => v
                    .as_i64()
                    .and_then(|o| i32::try_from(o).ok())
                    .ok_or_else(|| CodecError::malformed(kind, "date.offset must be an integer"))?,
            };
            Ok(Person::new(&name, &email, seconds, offset))
        }
        Some(_) => Err(CodecError::malformed(kind, "invalid date")),
    }
}

fn as_map(kind: ObjectKind, value: &Value) -> CodecResult<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| CodecError::malformed(kind, "expected an object"))
}

fn required<'a>(kind: ObjectKind, map: &'a Map<String, Value>, key: &str) -> CodecResult<&'a Value> {
    match map.get(key) {
        None | Some(Value::Null) => Err(CodecError::malformed(kind, format!("missing {key}"))),
        Some(v) => Ok(v),
    }
}

fn field<'a>(kind: ObjectKind, value: &'a Value, key: &str) -> CodecResult<&'a Value> {
    required(kind, as_map(kind, value)?, key)
}

fn string(kind: ObjectKind, value: &Value, key: &str) -> CodecResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| CodecError::malformed(kind, format!("{key} must be a string")))
}

fn object_id(kind: ObjectKind, value: &Value) -> CodecResult<ObjectId> {
    let text = value
        .as_str()
        .ok_or_else(|| CodecError::malformed(kind, "hash must be a hex string"))?;
    Ok(text.parse()?)
}
