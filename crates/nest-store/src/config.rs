use std::collections::BTreeMap;

use nest_types::ObjectId;
use serde::{Deserialize, Serialize};

/// Per-root config: the two bookmarks plus origin parameters.
///
/// `current` is the commit representing the working state (possibly
/// uncommitted); `head` is the last explicitly committed commit. The origin
/// map (url, passphrase, prefix, ...) is opaque to the core and only handed
/// to the [`RepoFactory`](crate::RepoFactory).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<ObjectId>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub origin: BTreeMap<String, String>,
}

impl RepoConfig {
    /// A config pointing at a remote url.
    pub fn with_url(url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.origin.insert("url".into(), url.into());
        config
    }

    /// The working state differs from the last explicit commit.
    pub fn is_dirty(&self) -> bool {
        self.current != self.head
    }

    pub fn url(&self) -> Option<&str> {
        self.origin.get("url").map(String::as_str)
    }

    /// Fill bookmarks and origin keys that `self` lacks from `known`.
    pub fn merge_known(&mut self, known: &RepoConfig) {
        if self.current.is_none() {
            self.current = known.current;
        }
        if self.head.is_none() {
            self.head = known.head;
        }
        if self.ref_name.is_none() {
            self.ref_name = known.ref_name.clone();
        }
        for (key, value) in &known.origin {
            self.origin.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(n: u8) -> ObjectId {
        ObjectId::from_hash([n; 20])
    }

    #[test]
    fn dirty_when_bookmarks_differ() {
        let mut config = RepoConfig::default();
        assert!(!config.is_dirty());
        config.current = Some(oid(1));
        assert!(config.is_dirty());
        config.head = Some(oid(1));
        assert!(!config.is_dirty());
    }

    #[test]
    fn merge_known_fills_only_gaps() {
        let mut config = RepoConfig::with_url("mem://child");
        config.current = Some(oid(1));
        let mut known = RepoConfig::with_url("mem://stale");
        known.current = Some(oid(2));
        known.head = Some(oid(3));
        known.origin.insert("passphrase".into(), "secret".into());

        config.merge_known(&known);
        assert_eq!(config.current, Some(oid(1)));
        assert_eq!(config.head, Some(oid(3)));
        assert_eq!(config.url(), Some("mem://child"));
        assert_eq!(config.origin.get("passphrase").map(String::as_str), Some("secret"));
    }

    #[test]
    fn serde_uses_ref_key() {
        let mut config = RepoConfig::with_url("mem://x");
        config.ref_name = Some("refs/heads/master".into());
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["ref"], "refs/heads/master");
        assert!(json.get("current").is_none());
        let back: RepoConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
