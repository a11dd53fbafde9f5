//! Stage CRUD and the completion gate.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{
    AuditAction, NewStage, PaymentStatus, StageRecord, StageStatus, UpdateStageParams, UserRole,
};
use crate::error::{CaseError, DatabaseError};
use crate::legal::Workflow;
use crate::legal::actor::{Actor, require_view};
use crate::legal::audit::{ENTITY_STAGE, json_diff, snapshot};
use crate::legal::validation::{
    MAX_LONG_TEXT_LEN, MAX_SHORT_TEXT_LEN, MAX_TITLE_LEN, double_option, non_negative_amount,
    optional_text, payment_link, required_text, share, stage_order,
};

const PAYMENT_REQUIRED: &str = "La etapa requiere pago antes de completarse";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateStageInput {
    pub etapa: String,
    pub descripcion: Option<String>,
    pub fecha_programada: Option<NaiveDate>,
    /// Next free position when absent.
    pub orden: Option<i32>,
    pub es_publica: Option<bool>,
    pub requiere_pago: Option<bool>,
    pub costo_uf: Option<Decimal>,
    pub porcentaje_variable: Option<Decimal>,
    pub enlace_pago: Option<String>,
    pub audiencia_tipo: Option<String>,
    pub audiencia_fecha: Option<DateTime<Utc>>,
    pub audiencia_lugar: Option<String>,
}

/// Partial stage update. Payment state moves only through the payment actions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateStageInput {
    pub etapa: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub descripcion: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub fecha_programada: Option<Option<NaiveDate>>,
    pub orden: Option<i32>,
    pub estado: Option<StageStatus>,
    pub es_publica: Option<bool>,
    pub requiere_pago: Option<bool>,
    #[serde(deserialize_with = "double_option")]
    pub costo_uf: Option<Option<Decimal>>,
    #[serde(deserialize_with = "double_option")]
    pub porcentaje_variable: Option<Option<Decimal>>,
    #[serde(deserialize_with = "double_option")]
    pub audiencia_tipo: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub audiencia_fecha: Option<Option<DateTime<Utc>>>,
    #[serde(deserialize_with = "double_option")]
    pub audiencia_lugar: Option<Option<String>>,
}

fn order_taken(orden: i32) -> CaseError {
    CaseError::Conflict(format!("Ya existe una etapa con el orden {}", orden))
}

fn map_stage_write_error(err: DatabaseError, orden: i32) -> CaseError {
    match err {
        DatabaseError::Conflict(detail) if detail.contains("orden") => order_taken(orden),
        DatabaseError::Conflict(detail) => {
            tracing::warn!("Stage write rejected by constraint: {}", detail);
            CaseError::Conflict("La etapa entra en conflicto con datos existentes".to_string())
        }
        other => other.into(),
    }
}

impl Workflow {
    pub async fn create_stage(
        &self,
        actor: &Actor,
        case_id: Uuid,
        input: CreateStageInput,
    ) -> Result<StageRecord, CaseError> {
        let case = self.load_case(case_id).await?;
        actor.require_manage(&case)?;

        let etapa = required_text("etapa", &input.etapa, MAX_TITLE_LEN)?;
        let descripcion =
            optional_text("descripcion", input.descripcion.as_deref(), MAX_LONG_TEXT_LEN)?;
        let costo_uf = non_negative_amount("costo_uf", input.costo_uf)?;
        let porcentaje_variable = share("porcentaje_variable", input.porcentaje_variable)?;
        let enlace_pago = match input.enlace_pago.as_deref() {
            Some(raw) => payment_link(raw)?,
            None => None,
        };
        let requiere_pago = enlace_pago.is_some()
            || input
                .requiere_pago
                .unwrap_or_else(|| costo_uf.is_some_and(|c| c > Decimal::ZERO));

        let existing = self.db.list_stages(case_id, false).await?;
        let orden = match input.orden {
            Some(orden) => {
                let orden = stage_order("orden", orden)?;
                if existing.iter().any(|stage| stage.orden == orden) {
                    return Err(order_taken(orden));
                }
                orden
            }
            None => {
                let last = existing.iter().map(|stage| stage.orden).max().unwrap_or(0);
                let next = last.checked_add(1).unwrap_or(i32::MAX);
                stage_order("orden", next)?
            }
        };

        let new_stage = NewStage {
            etapa,
            descripcion,
            fecha_programada: input.fecha_programada,
            orden,
            estado: StageStatus::Pendiente,
            es_publica: input.es_publica.unwrap_or(true),
            requiere_pago,
            costo_uf,
            porcentaje_variable,
            estado_pago: PaymentStatus::Pendiente,
            enlace_pago,
            monto_pagado_uf: Decimal::ZERO,
            audiencia_tipo: optional_text(
                "audiencia_tipo",
                input.audiencia_tipo.as_deref(),
                MAX_SHORT_TEXT_LEN,
            )?,
            audiencia_fecha: input.audiencia_fecha,
            audiencia_lugar: optional_text(
                "audiencia_lugar",
                input.audiencia_lugar.as_deref(),
                MAX_SHORT_TEXT_LEN,
            )?,
        };
        let stage = self
            .db
            .create_stage(case_id, &new_stage)
            .await
            .map_err(|e| map_stage_write_error(e, orden))?;

        tracing::info!(case_id = %case_id, stage_id = %stage.id, orden, "stage created");
        self.audit
            .record(
                actor,
                AuditAction::Create,
                ENTITY_STAGE,
                stage.id,
                serde_json::json!({ "after": snapshot(&stage) }),
            )
            .await;
        Ok(stage)
    }

    /// Update stage fields. Moving to `completado` goes through the payment gate.
    pub async fn update_stage(
        &self,
        actor: &Actor,
        stage_id: Uuid,
        input: UpdateStageInput,
    ) -> Result<StageRecord, CaseError> {
        let (_, existing) = self.load_managed_stage(actor, stage_id).await?;

        let mut params = UpdateStageParams::default();
        if let Some(etapa) = &input.etapa {
            params.etapa = Some(required_text("etapa", etapa, MAX_TITLE_LEN)?);
        }
        if let Some(descripcion) = &input.descripcion {
            params.descripcion = Some(optional_text(
                "descripcion",
                descripcion.as_deref(),
                MAX_LONG_TEXT_LEN,
            )?);
        }
        params.fecha_programada = input.fecha_programada;
        if let Some(orden) = input.orden {
            params.orden = Some(stage_order("orden", orden)?);
        }
        params.es_publica = input.es_publica;
        params.requiere_pago = input.requiere_pago;
        if let Some(costo) = input.costo_uf {
            params.costo_uf = Some(non_negative_amount("costo_uf", costo)?);
        }
        if let Some(porcentaje) = input.porcentaje_variable {
            params.porcentaje_variable = Some(share("porcentaje_variable", porcentaje)?);
        }
        if let Some(tipo) = &input.audiencia_tipo {
            params.audiencia_tipo = Some(optional_text(
                "audiencia_tipo",
                tipo.as_deref(),
                MAX_SHORT_TEXT_LEN,
            )?);
        }
        params.audiencia_fecha = input.audiencia_fecha;
        if let Some(lugar) = &input.audiencia_lugar {
            params.audiencia_lugar = Some(optional_text(
                "audiencia_lugar",
                lugar.as_deref(),
                MAX_SHORT_TEXT_LEN,
            )?);
        }

        if let Some(estado) = input.estado {
            let was_completed = existing.estado == StageStatus::Completado;
            if estado == StageStatus::Completado && !was_completed {
                if params.merge_into(&existing).payment_blocks_completion() {
                    return Err(CaseError::Conflict(PAYMENT_REQUIRED.to_string()));
                }
                params.completado_at = Some(Some(Utc::now()));
            } else if estado != StageStatus::Completado && was_completed {
                params.completado_at = Some(None);
            }
            params.estado = Some(estado);
        }

        let orden = params.orden.unwrap_or(existing.orden);
        let updated = self
            .db
            .update_stage(stage_id, &params)
            .await
            .map_err(|e| map_stage_write_error(e, orden))?
            .ok_or_else(|| CaseError::not_found("Etapa", stage_id))?;

        tracing::info!(stage_id = %stage_id, actor = %actor.profile_id, "stage updated");
        self.audit
            .record(
                actor,
                AuditAction::Update,
                ENTITY_STAGE,
                stage_id,
                json_diff(&snapshot(&existing), &snapshot(&updated)),
            )
            .await;
        Ok(updated)
    }

    /// Mark a stage as done. Rejected while a required payment is outstanding.
    pub async fn complete_stage(
        &self,
        actor: &Actor,
        stage_id: Uuid,
    ) -> Result<StageRecord, CaseError> {
        let (_, existing) = self.load_managed_stage(actor, stage_id).await?;
        if existing.estado == StageStatus::Completado {
            return Err(CaseError::Conflict(
                "La etapa ya está completada".to_string(),
            ));
        }
        if existing.payment_blocks_completion() {
            return Err(CaseError::Conflict(PAYMENT_REQUIRED.to_string()));
        }

        let params = UpdateStageParams {
            estado: Some(StageStatus::Completado),
            completado_at: Some(Some(Utc::now())),
            ..Default::default()
        };
        let updated = self
            .db
            .update_stage(stage_id, &params)
            .await?
            .ok_or_else(|| CaseError::not_found("Etapa", stage_id))?;

        tracing::info!(stage_id = %stage_id, case_id = %updated.case_id, "stage completed");
        self.audit
            .record(
                actor,
                AuditAction::Update,
                ENTITY_STAGE,
                stage_id,
                json_diff(&snapshot(&existing), &snapshot(&updated)),
            )
            .await;
        Ok(updated)
    }

    pub async fn delete_stage(&self, actor: &Actor, stage_id: Uuid) -> Result<(), CaseError> {
        let (case, existing) = self.load_managed_stage(actor, stage_id).await?;
        if !self.db.delete_stage(stage_id).await? {
            return Err(CaseError::not_found("Etapa", stage_id));
        }
        if existing.monto_pagado_uf > Decimal::ZERO {
            self.recompute_paid_total(case.id).await?;
        }

        tracing::info!(stage_id = %stage_id, case_id = %case.id, "stage deleted");
        self.audit
            .record(
                actor,
                AuditAction::Delete,
                ENTITY_STAGE,
                stage_id,
                serde_json::json!({ "before": snapshot(&existing) }),
            )
            .await;
        Ok(())
    }

    /// Stages of a case in order. Clients only see public stages.
    pub async fn get_stages(
        &self,
        actor: &Actor,
        case_id: Uuid,
    ) -> Result<Vec<StageRecord>, CaseError> {
        let case = self.load_case(case_id).await?;
        require_view(self.db.as_ref(), actor, &case).await?;
        let public_only = actor.role == UserRole::Cliente;
        Ok(self.db.list_stages(case_id, public_only).await?)
    }
}
