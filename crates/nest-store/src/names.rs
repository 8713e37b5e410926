//! Ref name validation following git-style conventions.
//!
//! Valid ref names:
//! - Must be non-empty
//! - Must not contain whitespace, control characters, `~`, `^`, `:`, `?`, `*`, `[`, `\`
//! - Must not contain `..` (double dot) or `@{`
//! - Must not start or end with `/`, must not end with `.`
//! - Must not end with `.lock`
//! - Components between slashes must be non-empty and not start with `.`

use crate::error::{StoreError, StoreResult};

/// Characters that are forbidden anywhere in a ref name.
const FORBIDDEN_CHARS: &[char] = &[' ', '\t', '~', '^', ':', '?', '*', '[', '\\'];

/// Validate a ref name such as `refs/heads/master` or `HEAD`.
pub fn validate_ref_name(name: &str) -> StoreResult<()> {
    let invalid = |reason: String| {
        Err(StoreError::InvalidRefName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("ref name must not be empty".into());
    }
    if let Some(ch) = name
        .chars()
        .find(|c| c.is_control() || FORBIDDEN_CHARS.contains(c))
    {
        return invalid(format!("contains forbidden character: {ch:?}"));
    }
    if name.contains("..") {
        return invalid("must not contain '..'".into());
    }
    if name.contains("@{") {
        return invalid("must not contain '@{'".into());
    }
    if name.starts_with('/') || name.ends_with('/') {
        return invalid("must not start or end with '/'".into());
    }
    if name.ends_with('.') {
        return invalid("must not end with '.'".into());
    }
    if name.ends_with(".lock") {
        return invalid("must not end with '.lock'".into());
    }
    for component in name.split('/') {
        if component.is_empty() {
            return invalid("path components must not be empty".into());
        }
        if component.starts_with('.') {
            return invalid(format!("component must not start with '.': {component:?}"));
        }
    }
    Ok(())
}
