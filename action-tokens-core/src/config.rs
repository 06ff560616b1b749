//! Token service configuration
//!
//! Defaults, YAML files and `TOKENS_*` environment variables, applied in that order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::types::TokenKind;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

/// Configuration for the token orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Storage document used when a call does not name one
    pub document_name: String,
    /// Entity kind for drafts that do not declare one
    pub default_kind: TokenKind,
    /// Token type name → event-name discriminator
    pub event_names: BTreeMap<String, String>,
    /// Capacity of the in-process broadcast event sink
    pub event_capacity: usize,
    /// When false, the HTTP controller answers 404 for every route
    pub controller_enabled: bool,
    /// Longest token id the default validator accepts
    pub max_id_len: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            document_name: "tokens".to_string(),
            default_kind: TokenKind::Simple,
            event_names: BTreeMap::new(),
            event_capacity: 1024,
            controller_enabled: true,
            max_id_len: 128,
        }
    }
}

impl TokenConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Overlay `TOKENS_*` environment variables onto this config.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(name) = var("TOKENS_DOCUMENT_NAME") {
            self.document_name = name;
        }
        if let Some(kind) = var("TOKENS_DEFAULT_KIND") {
            self.default_kind = kind.parse().map_err(|_| ConfigError::Invalid {
                key: "TOKENS_DEFAULT_KIND".to_string(),
                value: kind.clone(),
            })?;
        }
        if let Some(enabled) = var("TOKENS_CONTROLLER_ENABLED") {
            self.controller_enabled = parse_bool(&enabled).ok_or(ConfigError::Invalid {
                key: "TOKENS_CONTROLLER_ENABLED".to_string(),
                value: enabled.clone(),
            })?;
        }
        if let Some(capacity) = var("TOKENS_EVENT_CAPACITY") {
            self.event_capacity = capacity.parse().map_err(|_| ConfigError::Invalid {
                key: "TOKENS_EVENT_CAPACITY".to_string(),
                value: capacity.clone(),
            })?;
        }
        Ok(self)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = TokenConfig::from_yaml_str(
            r#"
document_name: action_tokens
default_kind: viewable
event_names:
  password-reset: reset
"#,
        )
        .unwrap();

        assert_eq!(config.document_name, "action_tokens");
        assert_eq!(config.default_kind, TokenKind::Viewable);
        assert_eq!(config.event_names.get("password-reset").unwrap(), "reset");
        // Untouched keys keep their defaults
        assert_eq!(config.event_capacity, 1024);
        assert!(config.controller_enabled);
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("TOKENS_DOCUMENT_NAME", "links"),
            ("TOKENS_DEFAULT_KIND", "composite"),
            ("TOKENS_CONTROLLER_ENABLED", "off"),
        ]
        .into_iter()
        .collect();

        let config = TokenConfig::default()
            .apply_vars(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.document_name, "links");
        assert_eq!(config.default_kind, TokenKind::Composite);
        assert!(!config.controller_enabled);
    }

    #[test]
    fn test_env_overlay_rejects_bad_values() {
        let result = TokenConfig::default().apply_vars(|k| {
            (k == "TOKENS_EVENT_CAPACITY").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }
}
