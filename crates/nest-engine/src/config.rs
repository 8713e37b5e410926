use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Author and committer of synthetic commits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            name: "nest".into(),
            email: "nest@localhost".into(),
        }
    }
}

/// Configuration for a [`Forest`](crate::Forest).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    /// Identity stamped on working-state commits.
    pub identity: Identity,
    /// Message of working-state commits.
    pub uncommitted_message: String,
    /// Ref used by roots whose config names none.
    pub default_ref: String,
    /// Symlink and rule redirects allowed per resolution.
    pub max_redirects: usize,
    /// Buffered events per subscriber before the slowest one lags.
    pub event_capacity: usize,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            identity: Identity::default(),
            uncommitted_message: "uncommitted changes".into(),
            default_ref: "refs/heads/master".into(),
            max_redirects: 32,
            event_capacity: 64,
        }
    }
}

impl ForestConfig {
    /// Parse TOML. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> EngineResult<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    fn validate(&self) -> EngineResult<()> {
        if self.event_capacity == 0 {
            return Err(EngineError::Config("event_capacity must be at least 1".into()));
        }
        nest_store::validate_ref_name(&self.default_ref)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ForestConfig::default();
        assert_eq!(config.uncommitted_message, "uncommitted changes");
        assert_eq!(config.default_ref, "refs/heads/master");
        assert_eq!(config.max_redirects, 32);
        assert_eq!(config.identity.name, "nest");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ForestConfig::from_toml_str(
            "max_redirects = 4\n\n[identity]\nname = \"Robot\"\n",
        )
        .unwrap();
        assert_eq!(config.max_redirects, 4);
        assert_eq!(config.identity.name, "Robot");
        assert_eq!(config.identity.email, "nest@localhost");
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = ForestConfig::default();
        config.uncommitted_message = "wip".into();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ForestConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ForestConfig::from_toml_str("event_capacity = 0").is_err());
        assert!(ForestConfig::from_toml_str("default_ref = \"refs/heads/a..b\"").is_err());
        assert!(ForestConfig::from_toml_str("max_redirects = \"many\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nest.toml");
        std::fs::write(&path, "uncommitted_message = \"draft\"\n").unwrap();
        assert_eq!(ForestConfig::load(&path).unwrap().uncommitted_message, "draft");
        assert!(ForestConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
