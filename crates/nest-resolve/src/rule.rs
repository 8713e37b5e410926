//! Rule files.
//!
//! A rule lives at `<name>.rule` (executable mode) and describes how to
//! produce `<name>`: a generator plus positional arguments, written in JSON
//! with `//` and `#` line comments allowed.
//!
//! ```text
//! // greeting.txt.rule
//! { "generator": "text", "args": ["hello\n"] }
//! ```

use serde::Deserialize;
use serde_json::Value;

/// Suffix that marks an entry as a rule for its sibling.
pub const RULE_SUFFIX: &str = ".rule";

/// A parsed rule.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Rule {
    #[serde(alias = "action")]
    pub generator: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Parse rule text. The error is a human-readable reason.
pub fn parse_rule(text: &str) -> Result<Rule, String> {
    serde_json::from_str(&strip_comments(text)).map_err(|e| e.to_string())
}

/// The sibling a rule entry produces, if `name` is a rule entry name.
pub fn rule_target(name: &str) -> Option<&str> {
    name.strip_suffix(RULE_SUFFIX).filter(|t| !t.is_empty())
}

/// Drop `//` and `#` line comments that are outside string literals.
fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        let comment = c == '#' || (c == '/' && chars.peek() == Some(&'/'));
        if comment {
            for skipped in chars.by_ref() {
                if skipped == '\n' {
                    out.push('\n');
                    break;
                }
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    out
}
