//! Read-only overview of the cases an actor can see.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use futures::future::try_join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::db::{CaseRecord, PaymentStatus, StageRecord, StageStatus, UserRole};
use crate::error::CaseError;
use crate::legal::Workflow;
use crate::legal::actor::Actor;

/// Days ahead that count as upcoming.
pub const UPCOMING_WINDOW_DAYS: i64 = 14;

#[derive(Debug, Clone, Serialize)]
pub struct UpcomingStage {
    pub case_id: Uuid,
    pub caratulado: String,
    pub stage_id: Uuid,
    pub etapa: String,
    pub orden: i32,
    pub fecha_programada: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingPayment {
    pub case_id: Uuid,
    pub caratulado: String,
    pub stage_id: Uuid,
    pub etapa: String,
    pub estado_pago: PaymentStatus,
    pub costo_uf: Option<Decimal>,
    pub monto_pagado_uf: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardSummary {
    pub total_casos: usize,
    pub por_estado: BTreeMap<&'static str, usize>,
    pub por_workflow: BTreeMap<&'static str, usize>,
    pub proximas_etapas: Vec<UpcomingStage>,
    pub pagos_pendientes: Vec<PendingPayment>,
}

fn summarize(
    cases: &[CaseRecord],
    stages_per_case: &[Vec<StageRecord>],
    today: NaiveDate,
) -> DashboardSummary {
    let horizon = today + Duration::days(UPCOMING_WINDOW_DAYS);
    let mut summary = DashboardSummary {
        total_casos: cases.len(),
        por_estado: BTreeMap::new(),
        por_workflow: BTreeMap::new(),
        proximas_etapas: Vec::new(),
        pagos_pendientes: Vec::new(),
    };

    for (case, stages) in cases.iter().zip(stages_per_case) {
        *summary.por_estado.entry(case.estado.as_str()).or_default() += 1;
        *summary
            .por_workflow
            .entry(case.workflow_state.as_str())
            .or_default() += 1;

        for stage in stages {
            if stage.estado != StageStatus::Completado
                && let Some(fecha) = stage.fecha_programada
                && fecha >= today
                && fecha <= horizon
            {
                summary.proximas_etapas.push(UpcomingStage {
                    case_id: case.id,
                    caratulado: case.caratulado.clone(),
                    stage_id: stage.id,
                    etapa: stage.etapa.clone(),
                    orden: stage.orden,
                    fecha_programada: fecha,
                });
            }
            if matches!(
                stage.estado_pago,
                PaymentStatus::Solicitado | PaymentStatus::EnProceso
            ) {
                summary.pagos_pendientes.push(PendingPayment {
                    case_id: case.id,
                    caratulado: case.caratulado.clone(),
                    stage_id: stage.id,
                    etapa: stage.etapa.clone(),
                    estado_pago: stage.estado_pago,
                    costo_uf: stage.costo_uf,
                    monto_pagado_uf: stage.monto_pagado_uf,
                });
            }
        }
    }

    summary
        .proximas_etapas
        .sort_by(|a, b| a.fecha_programada.cmp(&b.fecha_programada));
    summary
}

impl Workflow {
    pub async fn dashboard_summary(
        &self,
        actor: &Actor,
        today: NaiveDate,
    ) -> Result<DashboardSummary, CaseError> {
        let cases = self.get_cases(actor, None).await?;
        let public_only = actor.role == UserRole::Cliente;
        let db = self.db.as_ref();
        let stages =
            try_join_all(cases.iter().map(|case| db.list_stages(case.id, public_only))).await?;
        Ok(summarize(&cases, &stages, today))
    }
}
