//! Error types for configuration, persistence and the case workflow.

use thiserror::Error;

/// Configuration resolution failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration '{key}': {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("failed to read settings file: {0}")]
    ParseError(String),
}

/// Persistence failures shared by every database backend.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A uniqueness or foreign-key constraint rejected the write.
    #[error("constraint violation: {0}")]
    Conflict(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DatabaseError {
    fn from(err: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        match err.code() {
            Some(code) if *code == SqlState::UNIQUE_VIOLATION => {
                Self::Conflict(err.to_string())
            }
            Some(code) if *code == SqlState::FOREIGN_KEY_VIOLATION => {
                Self::Conflict(err.to_string())
            }
            _ => Self::Query(err.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

#[cfg(feature = "libsql")]
impl From<libsql::Error> for DatabaseError {
    fn from(err: libsql::Error) -> Self {
        let message = err.to_string();
        if message.contains("UNIQUE constraint failed")
            || message.contains("FOREIGN KEY constraint failed")
        {
            Self::Conflict(message)
        } else {
            Self::Query(message)
        }
    }
}

/// HTTP gateway startup failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway failed to start: {0}")]
    StartupFailed(String),
}

/// Failures surfaced by workflow operations.
///
/// Variants follow the four error classes the gateway distinguishes:
/// field validation, permission, state conflict and infrastructure.
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("No autorizado: {0}")]
    PermissionDenied(String),

    #[error("{entity} no encontrado: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Conflict(String),

    /// Broken bundled data or another invariant the caller cannot fix.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl CaseError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
