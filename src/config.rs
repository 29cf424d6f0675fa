//! Configuration management for serverack.
//!
//! This module defines the structure of the optional `serverack.toml` file and
//! provides functionality to load and parse it. Values given on the command
//! line take precedence over the file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `serverack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds each server gets to start accepting connections.
    pub timeout_secs: Option<u64>,
    /// Host the readiness probe connects to.
    pub host: Option<String>,
    /// Milliseconds a server gets to exit after SIGTERM before it is killed.
    pub grace_ms: Option<u64>,
    /// Milliseconds between readiness probe attempts.
    pub poll_ms: Option<u64>,
    /// Extra executables permitted as server commands.
    pub allow: Option<Vec<String>>,
    /// Output lines kept per server for diagnostics.
    pub max_lines: Option<usize>,
    /// Servers started before any given on the command line.
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,
}

/// Configuration for a single server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Shell command that starts the server.
    pub command: String,
    /// Port the server is expected to listen on.
    pub port: u16,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
timeout_secs = 60
host = "127.0.0.1"
grace_ms = 1500
poll_ms = 250
allow = ["bundle", "rails"]
max_lines = 50

[[server]]
command = "cd backend && python server.py"
port = 3000

[[server]]
command = "cd frontend && npm run dev"
port = 5173
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.timeout_secs, Some(60));
        assert_eq!(config.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.grace_ms, Some(1500));
        assert_eq!(config.poll_ms, Some(250));
        assert_eq!(
            config.allow.as_deref(),
            Some(&["bundle".to_string(), "rails".to_string()][..])
        );
        assert_eq!(config.max_lines, Some(50));
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[1].port, 5173);
    }

    #[test]
    fn empty_file_is_valid() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.servers.is_empty());
        assert!(config.timeout_secs.is_none());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<Config>("restart = true").is_err());
    }

    #[test]
    fn load_config_reports_path_on_failure() {
        let err = load_config(Path::new("/nonexistent/serverack.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/serverack.toml"));
    }
}
