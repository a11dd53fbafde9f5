//! Case workflow: stage planning, the client/firm advancement protocol,
//! stage payments and role-scoped case management.
//!
//! Every operation takes the calling [`Actor`] explicitly and runs against
//! the [`Database`] behind a [`Workflow`]. Successful mutations are audited
//! through the [`AuditSink`].

pub mod actor;
pub mod advance;
pub mod audit;
pub mod cases;
pub mod dashboard;
pub mod fees;
pub mod payments;
pub mod stages;
pub mod templates;
pub mod validation;

use std::sync::Arc;

use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::db::{AuditLogFilter, AuditLogRecord, CaseRecord, Database, StageRecord, UserRole};
use crate::error::CaseError;

pub use actor::Actor;
pub use audit::AuditSink;

/// Upper bound for a single audit log page.
pub const MAX_AUDIT_PAGE: i64 = 500;

/// Entry point for every workflow operation.
#[derive(Clone)]
pub struct Workflow {
    db: Arc<dyn Database>,
    audit: AuditSink,
    config: WorkflowConfig,
}

impl Workflow {
    pub fn new(db: Arc<dyn Database>, config: WorkflowConfig) -> Self {
        let audit = AuditSink::new(Arc::clone(&db), &config.audit);
        Self { db, audit, config }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Resolve the actor for a profile id.
    pub async fn actor(&self, profile_id: Uuid) -> Result<Option<Actor>, CaseError> {
        Actor::resolve(self.db.as_ref(), profile_id).await
    }

    async fn load_case(&self, case_id: Uuid) -> Result<CaseRecord, CaseError> {
        self.db
            .get_case(case_id)
            .await?
            .ok_or_else(|| CaseError::not_found("Caso", case_id))
    }

    async fn load_stage(&self, stage_id: Uuid) -> Result<StageRecord, CaseError> {
        self.db
            .get_stage(stage_id)
            .await?
            .ok_or_else(|| CaseError::not_found("Etapa", stage_id))
    }

    /// Load a stage together with its case, failing unless the actor may manage it.
    async fn load_managed_stage(
        &self,
        actor: &Actor,
        stage_id: Uuid,
    ) -> Result<(CaseRecord, StageRecord), CaseError> {
        let stage = self.load_stage(stage_id).await?;
        let case = self.load_case(stage.case_id).await?;
        actor.require_manage(&case)?;
        Ok((case, stage))
    }

    /// Audit entries, newest first. Admin only.
    pub async fn list_audit_logs(
        &self,
        actor: &Actor,
        entity_type: Option<String>,
        entity_id: Option<String>,
        limit: Option<i64>,
    ) -> Result<Vec<AuditLogRecord>, CaseError> {
        actor.require_role(&[UserRole::AdminFirma], "consultar la auditoría")?;
        let limit = match limit {
            None => AuditLogFilter::default().limit,
            Some(value) if (1..=MAX_AUDIT_PAGE).contains(&value) => value,
            Some(_) => {
                return Err(CaseError::validation(
                    "limit",
                    format!("debe estar entre 1 y {}", MAX_AUDIT_PAGE),
                ));
            }
        };
        let filter = AuditLogFilter {
            entity_type: entity_type.filter(|value| !value.trim().is_empty()),
            entity_id: entity_id.filter(|value| !value.trim().is_empty()),
            limit,
        };
        Ok(self.db.list_audit_logs(&filter).await?)
    }
}
