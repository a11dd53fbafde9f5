//! Runtime configuration.
//!
//! Each section resolves from [`Settings`] defaults with environment
//! overrides, so a deployment can run from `.env` alone.

pub(crate) mod helpers;
mod workflow;

use std::path::PathBuf;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

pub use workflow::{AuditMirrorConfig, WorkflowConfig};

/// Which persistence backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Postgres,
    LibSql,
}

impl std::str::FromStr for DatabaseBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "libsql" | "sqlite" | "turso" => Ok(Self::LibSql),
            other => Err(format!("unsupported database backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// Postgres connection URL.
    pub url: Option<SecretString>,
    pub pool_size: usize,
    pub libsql_path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let backend_raw = parse_string_env("DATABASE_BACKEND", settings.database.backend.clone())?;
        let backend = backend_raw
            .parse::<DatabaseBackend>()
            .map_err(|message| ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message,
            })?;

        let url = optional_env("DATABASE_URL")?.map(SecretString::from);
        if backend == DatabaseBackend::Postgres && url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
                hint: "set DATABASE_URL or use DATABASE_BACKEND=libsql".to_string(),
            });
        }

        let pool_size = parse_env("DATABASE_POOL_SIZE", settings.database.pool_size)?;
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DATABASE_POOL_SIZE".to_string(),
                message: "pool size must be at least 1".to_string(),
            });
        }

        let libsql_path = optional_env("LIBSQL_PATH")?
            .or_else(|| settings.database.libsql_path.clone())
            .map(PathBuf::from);

        Ok(Self {
            backend,
            url,
            pool_size,
            libsql_path,
        })
    }
}

/// Default on-disk location of the embedded database.
pub fn default_libsql_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lexaltius")
        .join("lexaltius.db")
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Shared bearer token the upstream auth proxy presents.
    pub auth_token: Option<SecretString>,
}

impl GatewayConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            host: parse_string_env("GATEWAY_HOST", settings.gateway.host.clone())?,
            port: parse_env("GATEWAY_PORT", settings.gateway.port)?,
            auth_token: optional_env("GATEWAY_AUTH_TOKEN")?.map(SecretString::from),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub workflow: WorkflowConfig,
}

impl Config {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve(settings)?,
            gateway: GatewayConfig::resolve(settings)?,
            workflow: WorkflowConfig::resolve(settings)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::DatabaseBackend;

    #[test]
    fn backend_names_parse_with_aliases() {
        assert_eq!(
            "PostgreSQL".parse::<DatabaseBackend>(),
            Ok(DatabaseBackend::Postgres)
        );
        assert_eq!("sqlite".parse::<DatabaseBackend>(), Ok(DatabaseBackend::LibSql));
        assert!("mysql".parse::<DatabaseBackend>().is_err());
    }
}
