use std::path::{Component, PathBuf};

use crate::config::helpers::{parse_bool_env, parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Optional JSONL mirror of the audit log.
#[derive(Debug, Clone)]
pub struct AuditMirrorConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub hash_chain: bool,
}

/// Case workflow controls.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Currency assigned to new cases that do not name one.
    pub default_currency: String,
    /// Compare-and-set attempts for advancement before reporting a conflict.
    pub advance_max_attempts: u32,
    pub audit: AuditMirrorConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_currency: "BOB".to_string(),
            advance_max_attempts: 3,
            audit: AuditMirrorConfig {
                enabled: false,
                path: PathBuf::from("logs/audit.jsonl"),
                hash_chain: true,
            },
        }
    }
}

fn validate_currency(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ConfigError::InvalidValue {
            key: "DEFAULT_CURRENCY".to_string(),
            message: format!("expected a three-letter currency code, got '{trimmed}'"),
        });
    }
    Ok(trimmed.to_ascii_uppercase())
}

fn validate_attempts(value: u32) -> Result<u32, ConfigError> {
    if value == 0 || value > 10 {
        return Err(ConfigError::InvalidValue {
            key: "ADVANCE_MAX_ATTEMPTS".to_string(),
            message: "must be between 1 and 10".to_string(),
        });
    }
    Ok(value)
}

fn validate_audit_path(raw: &str) -> Result<PathBuf, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        key: "AUDIT_MIRROR_PATH".to_string(),
        message: message.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("audit mirror path must not be empty"));
    }

    let raw_path = PathBuf::from(trimmed);
    if raw_path.is_absolute() {
        return Err(invalid("audit mirror path must be relative"));
    }

    let mut normalized = PathBuf::new();
    for component in raw_path.components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(invalid("audit mirror path must not contain '..' components"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("audit mirror path must be relative"));
            }
        }
    }

    if normalized.components().count() < 2 || !normalized.starts_with("logs") {
        return Err(invalid(
            "audit mirror path must be under 'logs/' and include a filename",
        ));
    }

    Ok(normalized)
}

impl WorkflowConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let workflow = &settings.workflow;
        Ok(Self {
            default_currency: {
                let raw =
                    parse_string_env("DEFAULT_CURRENCY", workflow.default_currency.clone())?;
                validate_currency(&raw)?
            },
            advance_max_attempts: validate_attempts(parse_env(
                "ADVANCE_MAX_ATTEMPTS",
                workflow.advance_max_attempts,
            )?)?,
            audit: AuditMirrorConfig {
                enabled: parse_bool_env("AUDIT_MIRROR_ENABLED", workflow.audit.enabled)?,
                path: {
                    let raw = parse_string_env("AUDIT_MIRROR_PATH", workflow.audit.path.clone())?;
                    validate_audit_path(&raw)?
                },
                hash_chain: parse_bool_env(
                    "AUDIT_MIRROR_HASH_CHAIN",
                    workflow.audit.hash_chain,
                )?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::error::ConfigError;

    #[test]
    fn currency_is_normalized_to_uppercase() {
        assert_eq!(super::validate_currency(" bob ").expect("valid"), "BOB");
        assert!(super::validate_currency("bolivianos").is_err());
        assert!(super::validate_currency("B0B").is_err());
    }

    #[test]
    fn attempts_must_be_bounded() {
        assert!(super::validate_attempts(0).is_err());
        assert_eq!(super::validate_attempts(3).expect("valid"), 3);
        assert!(super::validate_attempts(11).is_err());
    }

    #[test]
    fn validate_audit_path_accepts_normalized_logs_subpaths() {
        let path = super::validate_audit_path("./logs//cases/./audit.jsonl/")
            .expect("path should be accepted");
        assert_eq!(path, PathBuf::from("logs/cases/audit.jsonl"));
    }

    #[test]
    fn validate_audit_path_rejects_parent_dir_traversal() {
        let err = super::validate_audit_path("logs/../audit.jsonl").expect_err("must reject '..'");
        let ConfigError::InvalidValue { key, message } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "AUDIT_MIRROR_PATH");
        assert!(message.contains(".."), "unexpected message: {message}");
    }

    #[test]
    fn validate_audit_path_rejects_paths_outside_logs() {
        let err = super::validate_audit_path("tmp/audit.jsonl").expect_err("must stay under logs/");
        let ConfigError::InvalidValue { message, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert!(
            message.contains("under 'logs/'"),
            "unexpected message: {message}"
        );
    }
}
