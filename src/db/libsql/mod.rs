//! libSQL/SQLite backend for the `Database` trait.
//!
//! Used for embedded single-office deployments and for tests. Values that
//! Postgres stores natively are encoded as TEXT here: UUIDs, RFC 3339
//! timestamps, ISO dates and decimal strings.

mod audit;
mod cases;
mod stages;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use libsql::params;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{CreateProfileParams, Database, ProfileRecord, ProfileStore, UserRole};
use crate::error::DatabaseError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS profiles (
    id TEXT PRIMARY KEY,
    full_name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL CHECK (role IN ('admin_firma', 'abogado', 'analista', 'cliente')),
    telefono TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_profiles_role ON profiles(role);

CREATE TABLE IF NOT EXISTS cases (
    id TEXT PRIMARY KEY,
    numero_causa TEXT UNIQUE,
    caratulado TEXT NOT NULL,
    materia TEXT,
    tribunal TEXT,
    cliente_principal_id TEXT REFERENCES profiles(id) ON DELETE SET NULL,
    nombre_cliente TEXT NOT NULL,
    documento_cliente TEXT,
    abogado_responsable TEXT REFERENCES profiles(id) ON DELETE SET NULL,
    analista_id TEXT REFERENCES profiles(id) ON DELETE SET NULL,
    estado TEXT NOT NULL DEFAULT 'activo',
    prioridad TEXT NOT NULL DEFAULT 'media',
    workflow_state TEXT NOT NULL DEFAULT 'preparacion',
    fecha_inicio TEXT,
    valor_estimado TEXT,
    honorario_total_uf TEXT,
    honorario_pagado_uf TEXT NOT NULL DEFAULT '0',
    honorario_moneda TEXT NOT NULL DEFAULT 'BOB',
    modalidad_cobro TEXT,
    tarifa_referencia TEXT,
    alcance_cliente_solicitado INTEGER NOT NULL DEFAULT 0,
    alcance_cliente_autorizado INTEGER NOT NULL DEFAULT 0,
    observaciones TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cases_abogado ON cases(abogado_responsable);
CREATE INDEX IF NOT EXISTS idx_cases_cliente ON cases(cliente_principal_id);

CREATE TABLE IF NOT EXISTS case_clients (
    case_id TEXT NOT NULL REFERENCES cases(id) ON DELETE CASCADE,
    client_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
    es_principal INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (case_id, client_id)
);

CREATE INDEX IF NOT EXISTS idx_case_clients_client ON case_clients(client_id);

CREATE TABLE IF NOT EXISTS case_stages (
    id TEXT PRIMARY KEY,
    case_id TEXT NOT NULL REFERENCES cases(id) ON DELETE CASCADE,
    etapa TEXT NOT NULL,
    descripcion TEXT,
    fecha_programada TEXT,
    orden INTEGER NOT NULL CHECK (orden >= 1),
    estado TEXT NOT NULL DEFAULT 'pendiente',
    es_publica INTEGER NOT NULL DEFAULT 1,
    requiere_pago INTEGER NOT NULL DEFAULT 0,
    costo_uf TEXT,
    porcentaje_variable TEXT,
    estado_pago TEXT NOT NULL DEFAULT 'pendiente',
    enlace_pago TEXT,
    monto_pagado_uf TEXT NOT NULL DEFAULT '0',
    solicitado_por TEXT,
    solicitado_at TEXT,
    completado_at TEXT,
    audiencia_tipo TEXT,
    audiencia_fecha TEXT,
    audiencia_lugar TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (case_id, orden)
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    actor_id TEXT,
    action TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    diff TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_audit_log_created ON audit_log(created_at);
"#;

/// libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<libsql::Database>,
    path: PathBuf,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open libsql database: {}", e)))?;

        tracing::debug!(path = %path.display(), "opened libsql database");
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection with foreign keys enforced.
    pub(crate) async fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("failed to connect: {}", e)))?;
        conn.execute("PRAGMA foreign_keys = ON", ()).await?;
        // busy_timeout reports the new value as a row.
        let _ = conn.query("PRAGMA busy_timeout = 5000", ()).await?;
        Ok(conn)
    }
}

// ==================== Row helpers ====================

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    match row.get_value(idx) {
        Ok(libsql::Value::Text(value)) => value,
        _ => String::new(),
    }
}

pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    match row.get_value(idx) {
        Ok(libsql::Value::Text(value)) => Some(value),
        _ => None,
    }
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    match row.get_value(idx) {
        Ok(libsql::Value::Integer(value)) => value,
        _ => 0,
    }
}

pub(crate) fn get_i32(row: &libsql::Row, idx: i32) -> Result<i32, DatabaseError> {
    i32::try_from(get_i64(row, idx))
        .map_err(|_| DatabaseError::Serialization(format!("column {} out of i32 range", idx)))
}

pub(crate) fn get_bool(row: &libsql::Row, idx: i32) -> bool {
    get_i64(row, idx) != 0
}

pub(crate) fn opt_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(text) => libsql::Value::Text(text.to_string()),
        None => libsql::Value::Null,
    }
}

pub(crate) fn opt_uuid(value: Option<Uuid>) -> libsql::Value {
    match value {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

pub(crate) fn opt_decimal(value: Option<Decimal>) -> libsql::Value {
    match value {
        Some(amount) => libsql::Value::Text(amount.to_string()),
        None => libsql::Value::Null,
    }
}

pub(crate) fn opt_date(value: Option<NaiveDate>) -> libsql::Value {
    match value {
        Some(date) => libsql::Value::Text(date.format("%Y-%m-%d").to_string()),
        None => libsql::Value::Null,
    }
}

pub(crate) fn opt_ts(value: Option<DateTime<Utc>>) -> libsql::Value {
    match value {
        Some(ts) => libsql::Value::Text(fmt_ts(&ts)),
        None => libsql::Value::Null,
    }
}

/// Fixed-width UTC timestamp so TEXT ordering matches time ordering.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("invalid timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_opt_timestamp(
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} uuid: {}", field, e)))
}

pub(crate) fn parse_opt_uuid(raw: Option<String>, field: &str) -> Result<Option<Uuid>, DatabaseError> {
    raw.as_deref().map(|value| parse_uuid(value, field)).transpose()
}

pub(crate) fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} amount: {}", field, e)))
}

pub(crate) fn parse_opt_decimal(
    raw: Option<String>,
    field: &str,
) -> Result<Option<Decimal>, DatabaseError> {
    raw.as_deref()
        .map(|value| parse_decimal(value, field))
        .transpose()
}

pub(crate) fn parse_opt_date(raw: Option<String>) -> Result<Option<NaiveDate>, DatabaseError> {
    raw.as_deref()
        .map(|value| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
                DatabaseError::Serialization(format!("invalid date '{}': {}", value, e))
            })
        })
        .transpose()
}

pub(crate) fn parse_enum<T>(
    raw: &str,
    what: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, DatabaseError> {
    parse(raw).ok_or_else(|| DatabaseError::Serialization(format!("invalid {} '{}'", what, raw)))
}

// ==================== Profiles ====================

const PROFILE_COLUMNS: &str = "id, full_name, email, role, telefono, created_at, updated_at";

fn row_to_profile_record(row: &libsql::Row) -> Result<ProfileRecord, DatabaseError> {
    Ok(ProfileRecord {
        id: parse_uuid(&get_text(row, 0), "profile.id")?,
        full_name: get_text(row, 1),
        email: get_text(row, 2),
        role: parse_enum(&get_text(row, 3), "role", UserRole::from_db_value)?,
        telefono: get_opt_text(row, 4),
        created_at: parse_timestamp(&get_text(row, 5))?,
        updated_at: parse_timestamp(&get_text(row, 6))?,
    })
}

#[async_trait::async_trait]
impl ProfileStore for LibSqlBackend {
    async fn create_profile(
        &self,
        input: &CreateProfileParams,
    ) -> Result<ProfileRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4().to_string();
        let now = fmt_ts(&Utc::now());
        conn.execute(
            "INSERT INTO profiles (id, full_name, email, role, telefono, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                id.as_str(),
                input.full_name.trim(),
                input.email.trim(),
                input.role.as_str(),
                opt_text(input.telefono.as_deref()),
                now.as_str(),
            ],
        )
        .await?;

        let row = conn
            .query(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = ?1 LIMIT 1"),
                params![id.as_str()],
            )
            .await?
            .next()
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created profile".to_string()))?;
        row_to_profile_record(&row)
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<ProfileRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = ?1 LIMIT 1"),
                params![id.to_string()],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_profile_record(&row)).transpose()
    }

    async fn list_profiles_by_role(
        &self,
        role: UserRole,
    ) -> Result<Vec<ProfileRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PROFILE_COLUMNS} FROM profiles WHERE role = ?1 ORDER BY full_name ASC"
                ),
                params![role.as_str()],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_profile_record(&row)?);
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("libsql schema: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(super) async fn setup_backend() -> (LibSqlBackend, tempfile::TempDir) {
        let tmpdir = tempfile::tempdir().expect("tempdir");
        let backend = LibSqlBackend::new_local(&tmpdir.path().join("lexaltius_test.db"))
            .await
            .expect("local backend should initialize");
        backend
            .run_migrations()
            .await
            .expect("migrations should succeed");
        (backend, tmpdir)
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (backend, _tmpdir) = setup_backend().await;
        backend
            .run_migrations()
            .await
            .expect("second run should be a no-op");

        let conn = backend.connect().await.expect("connect");
        for table in ["profiles", "cases", "case_clients", "case_stages", "audit_log"] {
            let row = conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                )
                .await
                .expect("query sqlite_master")
                .next()
                .await
                .expect("row read");
            assert!(row.is_some(), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn profiles_filter_by_role() {
        let (backend, _tmpdir) = setup_backend().await;
        for (name, role) in [
            ("Zoe Abogada", UserRole::Abogado),
            ("Ana Abogada", UserRole::Abogado),
            ("Carla Cliente", UserRole::Cliente),
        ] {
            backend
                .create_profile(&CreateProfileParams {
                    full_name: name.to_string(),
                    email: format!("{}@example.com", name.replace(' ', ".").to_lowercase()),
                    role,
                    telefono: None,
                })
                .await
                .expect("create profile");
        }

        let lawyers = backend
            .list_profiles_by_role(UserRole::Abogado)
            .await
            .expect("list lawyers");
        let names: Vec<_> = lawyers.iter().map(|p| p.full_name.as_str()).collect();
        assert_eq!(names, vec!["Ana Abogada", "Zoe Abogada"]);
    }

    #[tokio::test]
    async fn duplicate_email_is_a_conflict() {
        let (backend, _tmpdir) = setup_backend().await;
        let params = CreateProfileParams {
            full_name: "Ana".to_string(),
            email: "ana@example.com".to_string(),
            role: UserRole::Cliente,
            telefono: None,
        };
        backend.create_profile(&params).await.expect("first insert");
        let err = backend
            .create_profile(&params)
            .await
            .expect_err("duplicate email must fail");
        assert!(matches!(err, DatabaseError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn timestamps_format_sortably_and_parse_back() {
        let ts = DateTime::parse_from_rfc3339("2026-03-01T09:30:00Z")
            .expect("valid")
            .with_timezone(&Utc);
        let formatted = fmt_ts(&ts);
        assert_eq!(formatted, "2026-03-01T09:30:00.000000Z");
        assert_eq!(parse_timestamp(&formatted).expect("parse"), ts);
        assert_eq!(
            parse_timestamp("2026-03-01 09:30:00").expect("sqlite format"),
            ts
        );
    }
}
