//! Author, committer, and tagger identities.

use std::fmt;

use chrono::{Local, Offset};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};

/// Punctuation stripped from both ends of names and emails.
const EDGE_PUNCTUATION: &[char] = &['.', ',', ':', ';', '<', '>', '"', '\''];

/// Name, email, and timestamp of an author, committer, or tagger.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch.
    pub seconds: i64,
    /// Timezone offset in minutes east of UTC.
    pub offset: i32,
}

impl Person {
    /// A person with an explicit timestamp. Name and email are sanitized.
    pub fn new(name: &str, email: &str, seconds: i64, offset: i32) -> Self {
        Self {
            name: sanitize(name),
            email: sanitize(email),
            seconds,
            offset,
        }
    }

    /// A person stamped with the current local time.
    pub fn now(name: &str, email: &str) -> Self {
        let now = Local::now();
        let offset = now.offset().fix().local_minus_utc() / 60;
        Self::new(name, email, now.timestamp(), offset)
    }

    /// Parse the encoded form `"Name <email> 1700000000 +0100"`.
    pub fn parse(value: &str) -> CodecResult<Self> {
        let malformed = |reason: &str| CodecError::malformed("person", reason);

        let open = value.find('<').ok_or_else(|| malformed("missing '<'"))?;
        let close = value[open..]
            .find('>')
            .map(|i| i + open)
            .ok_or_else(|| malformed("missing '>'"))?;

        let name = value[..open].trim();
        let email = &value[open + 1..close];

        let mut date = value[close + 1..].split_whitespace();
        let seconds = date
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| malformed("invalid timestamp"))?;
        let offset = date
            .next()
            .map(parse_offset)
            .transpose()?
            .ok_or_else(|| malformed("missing timezone"))?;

        Ok(Self {
            name: name.to_string(),
            email: email.to_string(),
            seconds,
            offset,
        })
    }
}

impl fmt::Display for Person {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <{}> {} {}",
            self.name,
            self.email,
            self.seconds,
            format_offset(self.offset)
        )
    }
}

/// Strip control characters and angle brackets, then edge punctuation and
/// whitespace, so the value cannot break the `Name <email>` framing.
pub fn sanitize(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_control() && *c != '<' && *c != '>')
        .collect();
    cleaned
        .trim()
        .trim_start_matches(EDGE_PUNCTUATION)
        .trim_end_matches(EDGE_PUNCTUATION)
        .trim()
        .to_string()
}

/// `+HHMM` / `-HHMM` from minutes east of UTC.
pub fn format_offset(offset: i32) -> String {
    let sign = if offset < 0 { '-' } else { '+' };
    let abs = offset.unsigned_abs();
    format!("{sign}{:02}{:02}", abs / 60, abs % 60)
}

fn parse_offset(text: &str) -> CodecResult<i32> {
    let malformed = || CodecError::malformed("person", format!("invalid timezone {text:?}"));
    let (sign, digits) = match text.as_bytes().first() {
        Some(b'+') => (1, &text[1..]),
        Some(b'-') => (-1, &text[1..]),
        _ => return Err(malformed()),
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| malformed())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| malformed())?;
    Ok(sign * (hours * 60 + minutes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_roundtrip() {
        let p = Person::new("Ada Lovelace", "ada@example.com", 1_700_000_000, -330);
        let text = p.to_string();
        assert_eq!(text, "Ada Lovelace <ada@example.com> 1700000000 -0530");
        assert_eq!(Person::parse(&text).unwrap(), p);
    }

    #[test]
    fn sanitize_strips_framing_characters() {
        assert_eq!(sanitize("  <Eve>\n"), "Eve");
        assert_eq!(sanitize("\"quoted.\""), "quoted");
        assert_eq!(sanitize("a\0b"), "ab");
        assert_eq!(sanitize("Dr. Who"), "Dr. Who");
    }

    #[test]
    fn new_sanitizes_fields() {
        let p = Person::new("<mallory>", "m@x.org>\n", 0, 0);
        assert_eq!(p.name, "mallory");
        assert_eq!(p.email, "m@x.org");
    }

    #[test]
    fn offsets_format() {
        assert_eq!(format_offset(0), "+0000");
        assert_eq!(format_offset(60), "+0100");
        assert_eq!(format_offset(-90), "-0130");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Person::parse("no brackets 1 +0000").is_err());
        assert!(Person::parse("A <a@b> notanumber +0000").is_err());
        assert!(Person::parse("A <a@b> 12 0000").is_err());
        assert!(Person::parse("A <a@b> 12").is_err());
    }
}
