//! Proxy configuration
//!
//! Everything is optional: an absent file, or absent fields within it, fall
//! back to the defaults for proxying `codex mcp-server`. The rule sets live
//! here rather than in code because the field names they key on belong to
//! the downstream tool's protocol and change with it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::io::ndjson::DEFAULT_MAX_LINE_BYTES;
use crate::rules::{AutoResolutionRule, InjectionRule};

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How to launch the downstream peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownstreamConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for DownstreamConfig {
    /// `codex mcp-server` with no flags; config flags are ignored in MCP mode
    /// and travel as injected tool arguments instead
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: vec!["mcp-server".to_string()],
        }
    }
}

/// Top-level proxy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub downstream: DownstreamConfig,

    pub injection_rules: Vec<InjectionRule>,

    pub auto_resolution_rules: Vec<AutoResolutionRule>,

    /// Drop client replies to elicitations the proxy already answered
    pub suppress_duplicate_replies: bool,

    /// Lines longer than this are discarded
    pub max_line_bytes: usize,

    /// After the client disconnects, how long the subprocess may keep talking
    pub drain_grace_ms: u64,

    /// Time between SIGTERM and SIGKILL during teardown
    pub terminate_grace_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            downstream: DownstreamConfig::default(),
            injection_rules: vec![InjectionRule::default()],
            auto_resolution_rules: vec![AutoResolutionRule::default()],
            suppress_duplicate_replies: false,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            drain_grace_ms: 2_000,
            terminate_grace_ms: 2_000,
        }
    }
}

impl ProxyConfig {
    /// Load from an optional JSON file, falling back to defaults, and validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                debug!("No config file given, using defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file without validating it
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override the downstream executable (CLI flag or environment)
    pub fn with_command_override(mut self, command: Option<String>) -> Self {
        if let Some(command) = command {
            self.downstream.command = command;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.downstream.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "downstream.command must not be empty".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_line_bytes must be greater than zero".to_string(),
            ));
        }

        for (index, rule) in self.injection_rules.iter().enumerate() {
            if rule.tools.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "injection_rules[{index}].tools must list at least one tool"
                )));
            }
            if rule.defaults.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "injection_rules[{index}].defaults must not be empty"
                )));
            }
        }

        for (index, rule) in self.auto_resolution_rules.iter().enumerate() {
            if !rule.discriminator.is_empty() && !rule.discriminator.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "auto_resolution_rules[{index}].discriminator must be a JSON pointer starting with '/', got {:?}",
                    rule.discriminator
                )));
            }
            if rule.accepted.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "auto_resolution_rules[{index}].accepted must list at least one value"
                )));
            }
        }

        Ok(())
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_target_codex_mcp_server() {
        let config = ProxyConfig::load(None).unwrap();
        assert_eq!(config.downstream.command, "codex");
        assert_eq!(config.downstream.args, vec!["mcp-server"]);
        assert_eq!(config.injection_rules, vec![InjectionRule::default()]);
        assert_eq!(
            config.auto_resolution_rules,
            vec![AutoResolutionRule::default()]
        );
        assert!(!config.suppress_duplicate_replies);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let file = write_config(
            r#"{
                "downstream": {"command": "/opt/codex/bin/codex"},
                "auto_resolution_rules": [
                    {"discriminator": "/codex_elicitation", "accepted": ["patch-approval", "exec-approval"]}
                ],
                "drain_grace_ms": 50
            }"#,
        );
        let config = ProxyConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.downstream.command, "/opt/codex/bin/codex");
        assert_eq!(config.downstream.args, vec!["mcp-server"]);
        assert_eq!(config.injection_rules, vec![InjectionRule::default()]);
        assert_eq!(
            config.auto_resolution_rules[0].accepted,
            vec![json!("patch-approval"), json!("exec-approval")]
        );
        assert_eq!(config.drain_grace(), Duration::from_millis(50));
        assert_eq!(config.terminate_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let file = write_config(r#"{"downstrem": {}}"#);
        let err = ProxyConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProxyConfig::load(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ProxyConfig::default();
        config.downstream.command = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ProxyConfig::default();
        config.auto_resolution_rules[0].discriminator = "codex_elicitation".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("JSON pointer"));

        let mut config = ProxyConfig::default();
        config.injection_rules[0].tools.clear();
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.max_line_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_command_override() {
        let config = ProxyConfig::default().with_command_override(Some("my-codex".to_string()));
        assert_eq!(config.downstream.command, "my-codex");

        let config = ProxyConfig::default().with_command_override(None);
        assert_eq!(config.downstream.command, "codex");
    }
}
