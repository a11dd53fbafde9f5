//! Stage payment actions: payment links, recorded payments and forced
//! settlement. Each one keeps the case's paid total in sync.

use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::db::{AuditAction, PaymentStatus, StageRecord, UpdateStageParams};
use crate::error::CaseError;
use crate::legal::Workflow;
use crate::legal::actor::Actor;
use crate::legal::audit::{ENTITY_STAGE, json_diff, snapshot};
use crate::legal::validation::{payment_link, positive_amount};

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentLinkInput {
    #[serde(default)]
    pub enlace_pago: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterPaymentInput {
    pub monto: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MarkPaidInput {
    /// Accept settling a stage whose recorded payment is below its cost.
    pub confirm_underpayment: bool,
}

/// Payment state after recording `amount` against a stage costing `cost`.
pub fn status_for_payment(cost: Option<Decimal>, amount: Decimal) -> PaymentStatus {
    match cost {
        Some(cost) if cost > Decimal::ZERO && amount >= cost => PaymentStatus::Pagado,
        _ => PaymentStatus::Parcial,
    }
}

impl Workflow {
    async fn write_payment(
        &self,
        actor: &Actor,
        existing: &StageRecord,
        params: UpdateStageParams,
    ) -> Result<StageRecord, CaseError> {
        let updated = self
            .db
            .update_stage(existing.id, &params)
            .await?
            .ok_or_else(|| CaseError::not_found("Etapa", existing.id))?;
        let total = self.recompute_paid_total(updated.case_id).await?;

        tracing::info!(
            stage_id = %updated.id,
            case_id = %updated.case_id,
            estado_pago = updated.estado_pago.as_str(),
            honorario_pagado = %total,
            "stage payment updated"
        );
        self.audit
            .record(
                actor,
                AuditAction::Update,
                ENTITY_STAGE,
                updated.id,
                json_diff(&snapshot(existing), &snapshot(&updated)),
            )
            .await;
        Ok(updated)
    }

    /// Set or clear the payment link. A link always makes the stage payable.
    pub async fn set_payment_link(
        &self,
        actor: &Actor,
        stage_id: Uuid,
        link: &str,
    ) -> Result<StageRecord, CaseError> {
        let (_, existing) = self.load_managed_stage(actor, stage_id).await?;
        let enlace = payment_link(link)?;

        let params = UpdateStageParams {
            requiere_pago: enlace.is_some().then_some(true),
            enlace_pago: Some(enlace),
            ..Default::default()
        };
        self.write_payment(actor, &existing, params).await
    }

    /// Record the amount paid so far; it replaces any previous amount.
    pub async fn register_payment(
        &self,
        actor: &Actor,
        stage_id: Uuid,
        amount: Decimal,
    ) -> Result<StageRecord, CaseError> {
        let (_, existing) = self.load_managed_stage(actor, stage_id).await?;
        let amount = positive_amount("monto", amount)?;

        let params = UpdateStageParams {
            requiere_pago: Some(true),
            monto_pagado_uf: Some(amount),
            estado_pago: Some(status_for_payment(existing.costo_uf, amount)),
            ..Default::default()
        };
        self.write_payment(actor, &existing, params).await
    }

    /// Settle the stage at its cost. Settling below the recorded cost needs
    /// `confirm_underpayment`.
    pub async fn mark_stage_paid(
        &self,
        actor: &Actor,
        stage_id: Uuid,
        confirm_underpayment: bool,
    ) -> Result<StageRecord, CaseError> {
        let (_, existing) = self.load_managed_stage(actor, stage_id).await?;

        let cost = existing.costo_uf.filter(|cost| *cost > Decimal::ZERO);
        if let Some(cost) = cost
            && existing.monto_pagado_uf < cost
            && !confirm_underpayment
        {
            return Err(CaseError::Conflict(format!(
                "El monto registrado ({}) es menor al costo de la etapa ({}); \
                 confirme para marcarla como pagada",
                existing.monto_pagado_uf, cost
            )));
        }

        let params = UpdateStageParams {
            estado_pago: Some(PaymentStatus::Pagado),
            monto_pagado_uf: Some(cost.unwrap_or(existing.monto_pagado_uf)),
            ..Default::default()
        };
        self.write_payment(actor, &existing, params).await
    }
}

#[cfg(all(test, feature = "libsql"))]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::{CaseRecord, StageStatus};
    use crate::legal::stages::CreateStageInput;
    use crate::legal::validation::MAX_AMOUNT;
    use crate::testing::{Cast, sample_case_input, seed_cast, test_workflow};

    async fn open_case(workflow: &Workflow) -> (Cast, CaseRecord, Vec<StageRecord>) {
        let cast = seed_cast(workflow.db().as_ref()).await;
        let case = workflow
            .create_case(&cast.lawyer, sample_case_input(cast.client.profile_id))
            .await
            .expect("create case");
        let stages = workflow
            .get_stages(&cast.lawyer, case.id)
            .await
            .expect("stages");
        (cast, case, stages)
    }

    #[test]
    fn payment_status_follows_cost() {
        assert_eq!(
            status_for_payment(Some(dec!(1200)), dec!(1200)),
            PaymentStatus::Pagado
        );
        assert_eq!(
            status_for_payment(Some(dec!(1200)), dec!(1500)),
            PaymentStatus::Pagado
        );
        assert_eq!(
            status_for_payment(Some(dec!(1200)), dec!(200)),
            PaymentStatus::Parcial
        );
        assert_eq!(status_for_payment(None, dec!(200)), PaymentStatus::Parcial);
        assert_eq!(
            status_for_payment(Some(Decimal::ZERO), dec!(200)),
            PaymentStatus::Parcial
        );
    }

    #[tokio::test]
    async fn partial_then_full_payment_updates_case_total() {
        let (workflow, _tmp) = test_workflow().await;
        let (cast, case, stages) = open_case(&workflow).await;

        let partial = workflow
            .register_payment(&cast.lawyer, stages[0].id, dec!(500))
            .await
            .expect("partial");
        assert_eq!(partial.estado_pago, PaymentStatus::Parcial);
        assert_eq!(partial.monto_pagado_uf, dec!(500));

        let full = workflow
            .register_payment(&cast.lawyer, stages[0].id, dec!(1200))
            .await
            .expect("full");
        assert_eq!(full.estado_pago, PaymentStatus::Pagado);

        workflow
            .register_payment(&cast.lawyer, stages[1].id, dec!(300))
            .await
            .expect("second stage");

        let case = workflow
            .get_case_by_id(&cast.lawyer, case.id)
            .await
            .expect("case");
        assert_eq!(case.honorario_pagado_uf, dec!(1500));

        workflow
            .complete_stage(&cast.lawyer, stages[0].id)
            .await
            .expect("paid stage completes");
    }

    #[tokio::test]
    async fn payment_amount_must_be_positive() {
        let (workflow, _tmp) = test_workflow().await;
        let (cast, _, stages) = open_case(&workflow).await;

        let err = workflow
            .register_payment(&cast.lawyer, stages[0].id, Decimal::ZERO)
            .await
            .expect_err("zero payment");
        assert!(matches!(err, CaseError::Validation { ref field, .. } if field == "monto"));
    }

    #[tokio::test]
    async fn oversized_payments_are_rejected_and_totals_stay_exact() {
        let (workflow, _tmp) = test_workflow().await;
        let (cast, case, stages) = open_case(&workflow).await;

        let err = workflow
            .register_payment(
                &cast.lawyer,
                stages[0].id,
                dec!(50_000_000_000_000_000_000_000_000_000),
            )
            .await
            .expect_err("above the amount ceiling");
        assert!(matches!(err, CaseError::Validation { ref field, .. } if field == "monto"));

        for stage in &stages[..2] {
            workflow
                .register_payment(&cast.lawyer, stage.id, MAX_AMOUNT)
                .await
                .expect("payment at the ceiling");
        }
        let case = workflow
            .get_case_by_id(&cast.lawyer, case.id)
            .await
            .expect("case");
        assert_eq!(case.honorario_pagado_uf, MAX_AMOUNT * dec!(2));
    }

    #[tokio::test]
    async fn underpaid_settlement_needs_confirmation() {
        let (workflow, _tmp) = test_workflow().await;
        let (cast, case, stages) = open_case(&workflow).await;

        workflow
            .register_payment(&cast.lawyer, stages[1].id, dec!(200))
            .await
            .expect("partial");
        let err = workflow
            .mark_stage_paid(&cast.lawyer, stages[1].id, false)
            .await
            .expect_err("needs confirmation");
        assert!(matches!(err, CaseError::Conflict(ref msg) if msg.contains("200")));

        let settled = workflow
            .mark_stage_paid(&cast.lawyer, stages[1].id, true)
            .await
            .expect("confirmed");
        assert_eq!(settled.estado_pago, PaymentStatus::Pagado);
        assert_eq!(settled.monto_pagado_uf, dec!(1200));

        let case = workflow
            .get_case_by_id(&cast.admin, case.id)
            .await
            .expect("case");
        assert_eq!(case.honorario_pagado_uf, dec!(1200));
    }

    #[tokio::test]
    async fn settling_a_costless_stage_keeps_recorded_amount() {
        let (workflow, _tmp) = test_workflow().await;
        let (cast, case, _) = open_case(&workflow).await;
        let stage = workflow
            .create_stage(
                &cast.lawyer,
                case.id,
                CreateStageInput {
                    etapa: "Gastos de notificación".to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("stage");

        workflow
            .register_payment(&cast.lawyer, stage.id, dec!(80))
            .await
            .expect("payment");
        let settled = workflow
            .mark_stage_paid(&cast.lawyer, stage.id, false)
            .await
            .expect("no cost, no warning");
        assert_eq!(settled.monto_pagado_uf, dec!(80));
        assert_eq!(settled.estado_pago, PaymentStatus::Pagado);
        assert!(settled.requiere_pago);
    }

    #[tokio::test]
    async fn payment_link_forces_payment_and_can_be_cleared() {
        let (workflow, _tmp) = test_workflow().await;
        let (cast, case, _) = open_case(&workflow).await;
        let stage = workflow
            .create_stage(
                &cast.lawyer,
                case.id,
                CreateStageInput {
                    etapa: "Tasación".to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("stage");
        assert!(!stage.requiere_pago);

        let linked = workflow
            .set_payment_link(&cast.lawyer, stage.id, "https://pagos.example.com/t/1")
            .await
            .expect("link");
        assert!(linked.requiere_pago);
        assert_eq!(
            linked.enlace_pago.as_deref(),
            Some("https://pagos.example.com/t/1")
        );

        let err = workflow
            .set_payment_link(&cast.lawyer, stage.id, "ftp://pagos.example.com")
            .await
            .expect_err("bad scheme");
        assert!(matches!(err, CaseError::Validation { .. }));

        let cleared = workflow
            .set_payment_link(&cast.lawyer, stage.id, "")
            .await
            .expect("clear");
        assert!(cleared.enlace_pago.is_none());
        assert!(cleared.requiere_pago);

        let err = workflow
            .complete_stage(&cast.lawyer, stage.id)
            .await
            .expect_err("still requires payment");
        assert!(matches!(err, CaseError::Conflict(_)));
        assert_ne!(cleared.estado, StageStatus::Completado);
    }

    #[tokio::test]
    async fn clients_cannot_record_payments() {
        let (workflow, _tmp) = test_workflow().await;
        let (cast, _, stages) = open_case(&workflow).await;

        let err = workflow
            .register_payment(&cast.client, stages[0].id, dec!(100))
            .await
            .expect_err("client");
        assert!(matches!(err, CaseError::PermissionDenied(_)));
    }
}
