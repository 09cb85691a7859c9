//! Agent configuration management
//!
//! The only durable local state: `{serverUrl, agentToken, createdAt}` stored
//! as JSON at `<config_dir>/porthole/config.json`, overwritten wholesale on
//! every successful login. A missing or partial file means "not logged in".

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted agent credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub server_url: String,
    pub agent_token: String,
    pub created_at: DateTime<Utc>,
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>, agent_token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            agent_token: agent_token.into(),
            created_at: Utc::now(),
        }
    }

    /// Get the default config directory path
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("porthole")
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Load configuration from a specific path
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Try to load the stored login, returning None when the file is absent
    /// or does not hold the required fields.
    pub fn try_load_default() -> Option<Self> {
        Self::load(&Self::default_path()).ok()
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Save to the default location
    pub fn save_default(&self) -> anyhow::Result<()> {
        self.save(&Self::default_path())
    }

    /// Remove the stored login. Idempotent: deleting a config that does not
    /// exist succeeds.
    pub fn delete(path: &Path) -> anyhow::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the stored login at the default location
    pub fn delete_default() -> anyhow::Result<()> {
        Self::delete(&Self::default_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("porthole-config-{}", uuid::Uuid::new_v4()))
            .join("config.json")
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = temp_path();
        let config = AgentConfig::new("https://porthole.example", "tok1");
        config.save(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.server_url, "https://porthole.example");
        assert_eq!(loaded.agent_token, "tok1");
        assert_eq!(loaded.created_at, config.created_at);

        AgentConfig::delete(&path).unwrap();
        assert!(AgentConfig::load(&path).is_err());
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let config = AgentConfig::new("https://porthole.example", "tok1");
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"serverUrl\""));
        assert!(json.contains("\"agentToken\""));
        assert!(json.contains("\"createdAt\""));
    }

    #[test]
    fn test_partial_config_reads_as_not_logged_in() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"serverUrl":"https://porthole.example"}"#).unwrap();
        assert!(AgentConfig::load(&path).is_err());
        AgentConfig::delete(&path).unwrap();
    }

    #[test]
    fn test_delete_is_idempotent() {
        let path = temp_path();
        AgentConfig::delete(&path).unwrap();
        AgentConfig::delete(&path).unwrap();
    }
}
