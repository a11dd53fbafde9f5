//! Audit sink: one `audit_log` row per successful mutation, optionally
//! mirrored to a hash-chained JSONL file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AuditMirrorConfig;
use crate::db::{AuditAction, AuditLogRecord, CreateAuditLogParams, Database};
use crate::legal::actor::Actor;

pub const ENTITY_CASE: &str = "case";
pub const ENTITY_STAGE: &str = "case_stage";

#[derive(Debug, Serialize)]
struct MirrorEvent<'a> {
    ts: String,
    id: String,
    actor_id: Option<String>,
    action: &'a str,
    entity_type: &'a str,
    entity_id: &'a str,
    diff: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

struct AuditMirror {
    path: PathBuf,
    hash_chain: bool,
    state: Mutex<Option<String>>,
}

impl AuditMirror {
    fn new(path: PathBuf, hash_chain: bool) -> Self {
        Self {
            path,
            hash_chain,
            state: Mutex::new(None),
        }
    }

    fn write(&self, record: &AuditLogRecord) {
        // Hold the chain state through the append so lines stay in hash order.
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Audit mirror state lock poisoned: {}", e);
                return;
            }
        };

        let entity_id = record.entity_id.as_str();
        let mut event = MirrorEvent {
            ts: record.created_at.to_rfc3339(),
            id: record.id.to_string(),
            actor_id: record.actor_id.map(|id| id.to_string()),
            action: record.action.as_str(),
            entity_type: record.entity_type.as_str(),
            entity_id,
            diff: &record.diff,
            prev_hash: state.clone(),
            hash: None,
        };

        let mut next_hash = None;
        if self.hash_chain {
            let to_hash = match serde_json::to_string(&event) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Failed to serialize audit event for hashing: {}", e);
                    return;
                }
            };
            let mut hasher = Sha256::new();
            hasher.update(to_hash.as_bytes());
            let hash = format!("{:x}", hasher.finalize());
            event.hash = Some(hash.clone());
            next_hash = Some(hash);
        }

        let line = match serde_json::to_string(&event) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to serialize audit mirror event: {}", e);
                return;
            }
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!("Failed to create audit mirror dir {:?}: {}", parent, e);
            return;
        }

        // New files are owner-only; existing files with broader modes are refused.
        let mut open_opts = OpenOptions::new();
        open_opts.create(true).append(true);
        #[cfg(unix)]
        open_opts.mode(0o600);
        let mut file = match open_opts.open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Failed to open audit mirror {:?}: {}", self.path, e);
                return;
            }
        };

        #[cfg(unix)]
        {
            let mode = match file.metadata() {
                Ok(meta) => meta.permissions().mode() & 0o777,
                Err(e) => {
                    tracing::warn!(
                        "Failed to read permissions for audit mirror {:?}: {}",
                        self.path,
                        e
                    );
                    return;
                }
            };
            if mode != 0o600 {
                tracing::warn!(
                    "Refusing to write audit mirror; insecure mode {:o} on {:?} (expected 600)",
                    mode,
                    self.path
                );
                return;
            }
        }

        match writeln!(file, "{line}") {
            Ok(()) => {
                if next_hash.is_some() {
                    *state = next_hash;
                }
            }
            Err(e) => tracing::warn!("Failed to append audit mirror event: {}", e),
        }
    }
}

/// Writes audit entries. Failures are logged and never fail the caller.
#[derive(Clone)]
pub struct AuditSink {
    db: Arc<dyn Database>,
    mirror: Option<Arc<AuditMirror>>,
}

impl AuditSink {
    pub fn new(db: Arc<dyn Database>, config: &AuditMirrorConfig) -> Self {
        let mirror = config
            .enabled
            .then(|| Arc::new(AuditMirror::new(config.path.clone(), config.hash_chain)));
        Self { db, mirror }
    }

    pub async fn record(
        &self,
        actor: &Actor,
        action: AuditAction,
        entity_type: &str,
        entity_id: impl ToString,
        diff: serde_json::Value,
    ) {
        let params = CreateAuditLogParams {
            actor_id: Some(actor.profile_id),
            action,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            diff,
        };
        match self.db.append_audit_log(&params).await {
            Ok(record) => {
                tracing::debug!(
                    action = action.as_str(),
                    entity_type,
                    entity_id = %record.entity_id,
                    "audit entry recorded"
                );
                if let Some(mirror) = &self.mirror {
                    mirror.write(&record);
                }
            }
            Err(e) => {
                tracing::warn!(
                    action = action.as_str(),
                    entity_type,
                    entity_id = %params.entity_id,
                    "Failed to write audit entry: {}",
                    e
                );
            }
        }
    }
}

/// Field-level diff of two serialized records: `{ field: { before, after } }`
/// for every top-level key whose value changed.
pub fn json_diff(before: &serde_json::Value, after: &serde_json::Value) -> serde_json::Value {
    let empty = serde_json::Map::new();
    let before_map = before.as_object().unwrap_or(&empty);
    let after_map = after.as_object().unwrap_or(&empty);

    let mut changes = serde_json::Map::new();
    for (key, new_value) in after_map {
        if key == "updated_at" {
            continue;
        }
        let old_value = before_map.get(key).unwrap_or(&serde_json::Value::Null);
        if old_value != new_value {
            changes.insert(
                key.clone(),
                serde_json::json!({ "before": old_value, "after": new_value }),
            );
        }
    }
    for (key, old_value) in before_map {
        if !after_map.contains_key(key) {
            changes.insert(
                key.clone(),
                serde_json::json!({ "before": old_value, "after": serde_json::Value::Null }),
            );
        }
    }
    serde_json::Value::Object(changes)
}

/// Serialize a record for an audit payload; serialization failures become `null`.
pub fn snapshot<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Utc;
    use serde_json::{Value, json};
    use uuid::Uuid;

    use super::*;

    fn record(action: AuditAction, n: i64) -> AuditLogRecord {
        AuditLogRecord {
            id: Uuid::new_v4(),
            actor_id: Some(Uuid::new_v4()),
            action,
            entity_type: ENTITY_CASE.to_string(),
            entity_id: Uuid::new_v4().to_string(),
            diff: json!({ "n": n }),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn hash_chain_links_consecutive_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("audit.jsonl");
        let mirror = AuditMirror::new(path.clone(), true);

        mirror.write(&record(AuditAction::Create, 1));
        mirror.write(&record(AuditAction::Update, 2));

        let raw = fs::read_to_string(path).expect("read audit mirror");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).expect("first line json");
        let second: Value = serde_json::from_str(lines[1]).expect("second line json");
        assert_eq!(first["action"], "CREATE");
        assert!(first.get("prev_hash").is_none());

        let first_hash = first["hash"].as_str().expect("first hash");
        assert_eq!(second["prev_hash"].as_str(), Some(first_hash));
        assert!(second["hash"].as_str().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn mirror_refuses_existing_file_with_broad_permissions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit.jsonl");
        fs::write(&path, "existing\n").expect("seed existing file");
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .expect("set permissive mode");

        let mirror = AuditMirror::new(path.clone(), false);
        mirror.write(&record(AuditAction::Create, 1));

        assert_eq!(fs::read_to_string(&path).expect("read"), "existing\n");
    }

    #[cfg(unix)]
    #[test]
    fn mirror_creates_owner_only_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("audit-new.jsonl");
        AuditMirror::new(path.clone(), false).write(&record(AuditAction::Create, 1));

        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn json_diff_reports_changed_fields_only() {
        let before = json!({ "tribunal": "TDJ 1", "prioridad": "media", "updated_at": "a" });
        let after = json!({ "tribunal": "TDJ 2", "prioridad": "media", "updated_at": "b" });
        let diff = json_diff(&before, &after);
        assert_eq!(
            diff,
            json!({ "tribunal": { "before": "TDJ 1", "after": "TDJ 2" } })
        );
    }
}
