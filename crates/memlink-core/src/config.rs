//! Engine configuration
//!
//! Stored as JSON. Every field is optional; missing ones take their defaults.
//!
//! ```json
//! {
//!   "session": { "connection_id": "01", "response_timeout_ms": 5000 },
//!   "ota": { "chunk_size": 1024, "verify_checksum": true }
//! }
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ota::OtaConfig;
use crate::session::SessionConfig;

/// Errors loading or saving configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Content is not valid configuration JSON
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Combined session and OTA configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session engine settings
    pub session: SessionConfig,
    /// OTA engine settings
    pub ota: OtaConfig,
}

impl EngineConfig {
    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        debug!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    /// Parse from JSON text
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Write as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config() {
        let config = EngineConfig::from_json_str(
            r#"{"session": {"connection_id": "07"}, "ota": {"chunk_delay_ms": 0}}"#,
        )
        .unwrap();
        assert_eq!(config.session.connection_id, "07");
        assert_eq!(config.session.response_timeout_ms, 5000);
        assert_eq!(config.ota.chunk_delay_ms, 0);
        assert_eq!(config.ota.chunk_size, 1024);
    }

    #[test]
    fn test_empty_object_is_default() {
        assert_eq!(EngineConfig::from_json_str("{}").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memlink.json");

        let mut config = EngineConfig::default();
        config.session.poll_interval_ms = 250;
        config.ota.verify_checksum = false;
        config.save(&path).unwrap();

        assert_eq!(EngineConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_file("/nonexistent/memlink.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
