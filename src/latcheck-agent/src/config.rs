//! Agent configuration surface.
//!
//! JSON file with serde defaults, overridable per-field from the command
//! line. Password-at-rest encryption is outside this crate: the `password`
//! field holds whatever the deployment put there.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Collection server host name or IP
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Worker count for the probing coordinator
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Location string reported with every upload
    #[serde(default)]
    pub location: String,

    /// Accept the server certificate without verification
    #[serde(default)]
    pub ignore_ssl_errors: bool,

    /// CA bundle used to verify the server certificate
    #[serde(default)]
    pub ca_certificate_path: Option<PathBuf>,

    /// Client certificate presented to the server (PEM)
    #[serde(default)]
    pub client_certificate_path: Option<PathBuf>,
    /// Private key for the client certificate (PEM)
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,

    /// Directory for hourly-rotated log files; console-only when unset
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_server_port(),
            threads: default_threads(),
            username: String::new(),
            password: String::new(),
            location: String::new(),
            ignore_ssl_errors: false,
            ca_certificate_path: None,
            client_certificate_path: None,
            client_key_path: None,
            log_path: None,
            log_level: default_log_level(),
        }
    }
}

fn default_server_host() -> String {
    "127.0.0.1".into()
}
fn default_server_port() -> u16 {
    8443
}
fn default_threads() -> usize {
    4
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_object() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server_port, 8443);
        assert_eq!(config.threads, 4);
        assert!(!config.ignore_ssl_errors);
    }

    #[test]
    fn partial_file_overrides() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"server_host": "collector.example", "threads": 16, "ignore_ssl_errors": true}"#,
        )
        .unwrap();
        assert_eq!(config.server_host, "collector.example");
        assert_eq!(config.threads, 16);
        assert!(config.ignore_ssl_errors);
        assert_eq!(config.server_port, 8443);
    }
}
