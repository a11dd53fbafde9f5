//! Client/firm advancement protocol.
//!
//! A client asks to move the case up to some stage (`request`); staff then
//! approve up to what was asked (`authorize`). Each side raises one of the
//! two scope counters on the case and moves the payment state of the
//! covered stages in the same atomic store call:
//!
//! ```text
//! request:    estado_pago pendiente|vencido -> solicitado   (orden <= target)
//! authorize:  estado_pago solicitado        -> en_proceso   (orden <= capped)
//! ```
//!
//! Counters are compared-and-set against the values the plan was computed
//! from. A lost race re-reads the case and plans again.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{
    AuditAction, CaseScope, PaymentStatus, PaymentTransition, ScopeChange, StageStatus, UserRole,
};
use crate::error::CaseError;
use crate::legal::Workflow;
use crate::legal::actor::{Actor, require_view};
use crate::legal::audit::ENTITY_CASE;

/// Why a plan was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRejection {
    /// The target is already within the authorized scope.
    AlreadyAuthorized,
    /// Authorization would not raise the authorized scope.
    NothingToAuthorize,
    /// Stage positions start at 1.
    InvalidTarget,
}

impl From<PlanRejection> for CaseError {
    fn from(rejection: PlanRejection) -> Self {
        match rejection {
            PlanRejection::AlreadyAuthorized => {
                CaseError::Conflict("La etapa ya está autorizada".to_string())
            }
            PlanRejection::NothingToAuthorize => {
                CaseError::Conflict("No hay avances pendientes que autorizar".to_string())
            }
            PlanRejection::InvalidTarget => {
                CaseError::validation("target_order", "debe ser un entero positivo")
            }
        }
    }
}

/// Next scope after a client requests up to `target`.
pub fn plan_request(scope: CaseScope, target: i32) -> Result<CaseScope, PlanRejection> {
    if target <= 0 {
        return Err(PlanRejection::InvalidTarget);
    }
    if target <= scope.autorizado {
        return Err(PlanRejection::AlreadyAuthorized);
    }
    Ok(CaseScope {
        solicitado: scope.solicitado.max(target),
        autorizado: scope.autorizado,
    })
}

/// Next scope after staff authorize up to `target`, with the capped position
/// the payment transition applies to.
///
/// Authorization is capped at what the client asked for. With no request on
/// file the firm may push the full target.
pub fn plan_authorization(
    scope: CaseScope,
    target: i32,
) -> Result<(CaseScope, i32), PlanRejection> {
    if target <= 0 {
        return Err(PlanRejection::InvalidTarget);
    }
    if target <= scope.autorizado {
        return Err(PlanRejection::NothingToAuthorize);
    }
    let capped = if scope.solicitado > 0 {
        target.min(scope.solicitado)
    } else {
        target
    };
    if capped <= scope.autorizado {
        return Err(PlanRejection::NothingToAuthorize);
    }
    Ok((
        CaseScope {
            solicitado: scope.solicitado.max(capped),
            autorizado: capped,
        },
        capped,
    ))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestAdvanceInput {
    pub stage_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeAdvanceInput {
    pub target_order: i32,
}

/// Result of an accepted request or authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvanceOutcome {
    pub case_id: Uuid,
    pub alcance_cliente_solicitado: i32,
    pub alcance_cliente_autorizado: i32,
    /// Stages whose payment state moved.
    pub etapas_actualizadas: u64,
}

impl Workflow {
    /// Plan against the current counters and apply; replan when another
    /// writer got there first.
    async fn apply_with_retry<F>(
        &self,
        case_id: Uuid,
        initial: CaseScope,
        mut plan: F,
    ) -> Result<(CaseScope, CaseScope, u64), CaseError>
    where
        F: FnMut(CaseScope) -> Result<(CaseScope, PaymentTransition), CaseError>,
    {
        let attempts = self.config.advance_max_attempts.max(1);
        let mut current = initial;
        for attempt in 1..=attempts {
            let (next, payment) = plan(current)?;
            let change = ScopeChange {
                case_id,
                expected: current,
                next,
                payment,
            };
            if let Some(moved) = self.db.apply_scope_change(&change).await? {
                return Ok((current, next, moved));
            }

            tracing::debug!(case_id = %case_id, attempt, "scope changed concurrently, replanning");
            current = self.load_case(case_id).await?.scope();
        }

        tracing::warn!(case_id = %case_id, attempts, "scope change kept losing the race");
        Err(CaseError::Conflict(
            "El caso fue modificado por otra operación; intente nuevamente".to_string(),
        ))
    }

    /// Client asks to advance the case up to the position of `stage_id`.
    pub async fn request_case_advance(
        &self,
        actor: &Actor,
        case_id: Uuid,
        stage_id: Uuid,
    ) -> Result<AdvanceOutcome, CaseError> {
        if actor.role != UserRole::Cliente {
            return Err(CaseError::PermissionDenied(
                "solo el cliente puede solicitar avances".to_string(),
            ));
        }
        let case = self.load_case(case_id).await?;
        require_view(self.db.as_ref(), actor, &case).await?;

        let stage = self.load_stage(stage_id).await?;
        if stage.case_id != case_id {
            return Err(CaseError::validation(
                "stage_id",
                "la etapa no pertenece al caso",
            ));
        }
        if !stage.es_publica {
            return Err(CaseError::not_found("Etapa", stage_id));
        }
        if stage.estado == StageStatus::Completado {
            return Err(CaseError::Conflict(
                "La etapa ya está completada".to_string(),
            ));
        }
        if stage.orden <= 0 {
            return Err(CaseError::validation("stage_id", "la etapa no tiene orden"));
        }

        let target = stage.orden;
        let requested_at = Utc::now();
        let requester = actor.profile_id;
        let (before, after, moved) = self
            .apply_with_retry(case_id, case.scope(), |scope| {
                let next = plan_request(scope, target)?;
                Ok((
                    next,
                    PaymentTransition {
                        max_orden: target,
                        from: vec![PaymentStatus::Pendiente, PaymentStatus::Vencido],
                        to: PaymentStatus::Solicitado,
                        requested_by: Some((requester, requested_at)),
                    },
                ))
            })
            .await?;

        tracing::info!(
            case_id = %case_id,
            client = %requester,
            target,
            etapas = moved,
            "advance requested"
        );
        self.audit
            .record(
                actor,
                AuditAction::RequestAdvance,
                ENTITY_CASE,
                case_id,
                serde_json::json!({
                    "stage_id": stage_id,
                    "target_order": target,
                    "before": before,
                    "after": after,
                    "etapas_actualizadas": moved,
                }),
            )
            .await;

        Ok(AdvanceOutcome {
            case_id,
            alcance_cliente_solicitado: after.solicitado,
            alcance_cliente_autorizado: after.autorizado,
            etapas_actualizadas: moved,
        })
    }

    /// Firm approves advancing the case up to `target_order`, capped at the
    /// client's request.
    pub async fn authorize_case_advance(
        &self,
        actor: &Actor,
        case_id: Uuid,
        target_order: i32,
    ) -> Result<AdvanceOutcome, CaseError> {
        actor.require_role(
            &[UserRole::AdminFirma, UserRole::Analista],
            "autorizar avances",
        )?;
        if target_order <= 0 {
            return Err(PlanRejection::InvalidTarget.into());
        }
        let case = self.load_case(case_id).await?;

        let stages = self.db.list_stages(case_id, false).await?;
        if !stages.iter().any(|stage| stage.orden == target_order) {
            return Err(CaseError::validation(
                "target_order",
                format!("el caso no tiene una etapa con orden {}", target_order),
            ));
        }

        let (before, after, moved) = self
            .apply_with_retry(case_id, case.scope(), |scope| {
                let (next, capped) = plan_authorization(scope, target_order)?;
                Ok((
                    next,
                    PaymentTransition {
                        max_orden: capped,
                        from: vec![PaymentStatus::Solicitado],
                        to: PaymentStatus::EnProceso,
                        requested_by: None,
                    },
                ))
            })
            .await?;

        tracing::info!(
            case_id = %case_id,
            actor = %actor.profile_id,
            target_order,
            autorizado = after.autorizado,
            etapas = moved,
            "advance authorized"
        );
        self.audit
            .record(
                actor,
                AuditAction::AuthorizeAdvance,
                ENTITY_CASE,
                case_id,
                serde_json::json!({
                    "target_order": target_order,
                    "before": before,
                    "after": after,
                    "etapas_actualizadas": moved,
                }),
            )
            .await;

        Ok(AdvanceOutcome {
            case_id,
            alcance_cliente_solicitado: after.solicitado,
            alcance_cliente_autorizado: after.autorizado,
            etapas_actualizadas: moved,
        })
    }
}
