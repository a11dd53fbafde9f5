use chrono::Utc;
use libsql::params;
use uuid::Uuid;

use crate::db::{AuditAction, AuditLogFilter, AuditLogRecord, AuditStore, CreateAuditLogParams};
use crate::error::DatabaseError;

use super::{
    LibSqlBackend, fmt_ts, get_opt_text, get_text, opt_uuid, parse_enum, parse_opt_uuid,
    parse_timestamp, parse_uuid,
};

const AUDIT_COLUMNS: &str = "id, actor_id, action, entity_type, entity_id, diff, created_at";

fn row_to_audit_record(row: &libsql::Row) -> Result<AuditLogRecord, DatabaseError> {
    let diff_raw = get_text(row, 5);
    let diff = if diff_raw.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(&diff_raw).map_err(|e| DatabaseError::Serialization(e.to_string()))?
    };
    Ok(AuditLogRecord {
        id: parse_uuid(&get_text(row, 0), "audit.id")?,
        actor_id: parse_opt_uuid(get_opt_text(row, 1), "audit.actor_id")?,
        action: parse_enum(&get_text(row, 2), "audit action", AuditAction::from_db_value)?,
        entity_type: get_text(row, 3),
        entity_id: get_text(row, 4),
        diff,
        created_at: parse_timestamp(&get_text(row, 6))?,
    })
}

#[async_trait::async_trait]
impl AuditStore for LibSqlBackend {
    async fn append_audit_log(
        &self,
        input: &CreateAuditLogParams,
    ) -> Result<AuditLogRecord, DatabaseError> {
        let conn = self.connect().await?;
        let id = Uuid::new_v4().to_string();
        let diff = serde_json::to_string(&input.diff)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO audit_log (id, actor_id, action, entity_type, entity_id, diff, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.as_str(),
                opt_uuid(input.actor_id),
                input.action.as_str(),
                input.entity_type.as_str(),
                input.entity_id.as_str(),
                diff,
                fmt_ts(&Utc::now()),
            ],
        )
        .await?;

        let row = conn
            .query(
                &format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE id = ?1 LIMIT 1"),
                params![id.as_str()],
            )
            .await?
            .next()
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load audit entry".to_string()))?;
        row_to_audit_record(&row)
    }

    async fn list_audit_logs(
        &self,
        filter: &AuditLogFilter,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<libsql::Value> = Vec::new();
        if let Some(entity_type) = &filter.entity_type {
            values.push(libsql::Value::Text(entity_type.clone()));
            clauses.push(format!("entity_type = ?{}", values.len()));
        }
        if let Some(entity_id) = &filter.entity_id {
            values.push(libsql::Value::Text(entity_id.clone()));
            clauses.push(format!("entity_id = ?{}", values.len()));
        }
        values.push(libsql::Value::Integer(filter.limit.max(1)));
        let limit_idx = values.len();

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log{where_sql} \
             ORDER BY created_at DESC, rowid DESC LIMIT ?{limit_idx}"
        );

        let conn = self.connect().await?;
        let mut rows = conn.query(&sql, values).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_audit_record(&row)?);
        }
        Ok(out)
    }
}
