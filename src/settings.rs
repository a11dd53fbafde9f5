//! File-backed settings.
//!
//! Settings provide the defaults that environment variables override during
//! config resolution. The file is optional; a missing path yields defaults.

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub gateway: GatewaySettings,
    pub workflow: WorkflowSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub backend: String,
    pub pool_size: usize,
    pub libsql_path: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: "postgres".to_string(),
            pool_size: 10,
            libsql_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub host: String,
    pub port: u16,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    pub default_currency: String,
    pub advance_max_attempts: u32,
    pub audit: AuditMirrorSettings,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            default_currency: "BOB".to_string(),
            advance_max_attempts: 3,
            audit: AuditMirrorSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditMirrorSettings {
    pub enabled: bool,
    pub path: String,
    pub hash_chain: bool,
}

impl Default for AuditMirrorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "logs/audit.jsonl".to_string(),
            hash_chain: true,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn partial_file_keeps_defaults_for_missing_sections() {
        let settings = Settings::from_toml(
            r#"
            [gateway]
            port = 9000

            [workflow.audit]
            enabled = true
            "#,
        )
        .expect("valid settings");

        assert_eq!(settings.gateway.port, 9000);
        assert_eq!(settings.gateway.host, "127.0.0.1");
        assert_eq!(settings.database.backend, "postgres");
        assert!(settings.workflow.audit.enabled);
        assert_eq!(settings.workflow.audit.path, "logs/audit.jsonl");
        assert_eq!(settings.workflow.default_currency, "BOB");
    }

    #[test]
    fn malformed_file_is_reported() {
        assert!(Settings::from_toml("gateway = [").is_err());
    }
}
