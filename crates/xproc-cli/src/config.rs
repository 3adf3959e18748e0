//! CLI configuration file.
//!
//! Every field is optional; missing ones fall back to library defaults and
//! command-line flags override whatever the file says.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use xproc::{ConnectionOptions, DispatcherOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Address `serve` listens on.
    pub host: String,
    /// Port `serve` listens on (0 = auto-assign).
    pub port: u16,
    pub connection: ConnectionOptions,
    pub dispatcher: DispatcherOptions,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            connection: ConnectionOptions::default(),
            dispatcher: DispatcherOptions::default(),
        }
    }
}

impl CliConfig {
    /// Load from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_load_without_path_uses_defaults() {
        assert_eq!(CliConfig::load(None).unwrap(), CliConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("xproc.json");
        std::fs::write(
            &path,
            r#"{"port": 4100, "connection": {"call_timeout": 500}, "dispatcher": {"workers": 1}}"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4100);
        assert_eq!(config.connection.call_timeout, Duration::from_millis(500));
        assert_eq!(config.dispatcher.workers, 1);
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(CliConfig::load(Some(&path)).is_err());
    }
}
