//! Case CRUD, lawyer assignment, client links and role-scoped listings.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{
    AuditAction, BillingModality, CaseClientRecord, CaseFilter, CasePriority, CaseRecord,
    CaseStatus, NewCase, NewCaseBundle, ProfileRecord, UpdateCaseParams, UserRole, WorkflowState,
};
use crate::error::{CaseError, DatabaseError};
use crate::legal::Workflow;
use crate::legal::actor::{Actor, require_view};
use crate::legal::audit::{ENTITY_CASE, json_diff, snapshot};
use crate::legal::fees;
use crate::legal::templates::{FeeTerms, InitialHearing, StagePlanInput, generate_stages};
use crate::legal::validation::{
    MAX_LONG_TEXT_LEN, MAX_SHORT_TEXT_LEN, MAX_TITLE_LEN, currency_code, double_option,
    non_negative_amount, optional_text, required_text,
};

#[derive(Debug, Clone, Deserialize)]
pub struct InitialHearingInput {
    pub tipo: String,
    pub fecha: DateTime<Utc>,
    #[serde(default)]
    pub lugar: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateCaseInput {
    pub numero_causa: Option<String>,
    pub caratulado: String,
    pub materia: Option<String>,
    pub tribunal: Option<String>,
    pub cliente_principal_id: Option<Uuid>,
    /// Defaults to the principal client's profile name.
    pub nombre_cliente: Option<String>,
    pub documento_cliente: Option<String>,
    pub abogado_responsable: Option<Uuid>,
    pub analista_id: Option<Uuid>,
    pub prioridad: Option<CasePriority>,
    pub fecha_inicio: Option<NaiveDate>,
    pub valor_estimado: Option<Decimal>,
    pub honorario_total_uf: Option<Decimal>,
    pub honorario_moneda: Option<String>,
    pub modalidad_cobro: Option<BillingModality>,
    pub tarifa_referencia: Option<String>,
    pub observaciones: Option<String>,
    pub audiencia_inicial: Option<InitialHearingInput>,
}

/// Partial case update. `null` clears a nullable field, an absent key keeps it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpdateCaseInput {
    #[serde(deserialize_with = "double_option")]
    pub numero_causa: Option<Option<String>>,
    pub caratulado: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub materia: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub tribunal: Option<Option<String>>,
    pub cliente_principal_id: Option<Uuid>,
    pub nombre_cliente: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub documento_cliente: Option<Option<String>>,
    /// Admin only.
    #[serde(deserialize_with = "double_option")]
    pub analista_id: Option<Option<Uuid>>,
    pub estado: Option<CaseStatus>,
    pub prioridad: Option<CasePriority>,
    pub workflow_state: Option<WorkflowState>,
    #[serde(deserialize_with = "double_option")]
    pub fecha_inicio: Option<Option<NaiveDate>>,
    #[serde(deserialize_with = "double_option")]
    pub valor_estimado: Option<Option<Decimal>>,
    #[serde(deserialize_with = "double_option")]
    pub honorario_total_uf: Option<Option<Decimal>>,
    pub honorario_moneda: Option<String>,
    #[serde(deserialize_with = "double_option")]
    pub modalidad_cobro: Option<Option<BillingModality>>,
    #[serde(deserialize_with = "double_option")]
    pub tarifa_referencia: Option<Option<String>>,
    #[serde(deserialize_with = "double_option")]
    pub observaciones: Option<Option<String>>,
    /// Send the case to review (`en_revision`); closed cases stay closed.
    pub marcar_validado: bool,
}

/// Public fields of a lawyer profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LawyerSummary {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub telefono: Option<String>,
}

impl From<ProfileRecord> for LawyerSummary {
    fn from(profile: ProfileRecord) -> Self {
        Self {
            id: profile.id,
            full_name: profile.full_name,
            email: profile.email,
            telefono: profile.telefono,
        }
    }
}

fn duplicate_numero(numero: &str) -> CaseError {
    CaseError::Conflict(format!("Ya existe un caso con el número de causa {}", numero))
}

/// Translate a constraint violation from a case write into a user-facing conflict.
fn map_case_write_error(err: DatabaseError, numero: Option<&str>) -> CaseError {
    match err {
        DatabaseError::Conflict(detail) => match numero {
            Some(numero) if detail.contains("numero_causa") => duplicate_numero(numero),
            _ => {
                tracing::warn!("Case write rejected by constraint: {}", detail);
                CaseError::Conflict("El caso entra en conflicto con datos existentes".to_string())
            }
        },
        other => other.into(),
    }
}

fn fee_reference(raw: Option<&str>) -> Result<Option<String>, CaseError> {
    let Some(code) = optional_text("tarifa_referencia", raw, MAX_SHORT_TEXT_LEN)? else {
        return Ok(None);
    };
    match fees::get_fee_item(&code).map_err(CaseError::Internal)? {
        Some(item) => Ok(Some(item.code.clone())),
        None => Err(CaseError::validation(
            "tarifa_referencia",
            format!("código de arancel desconocido: {}", code),
        )),
    }
}

fn hearing_from_input(input: InitialHearingInput) -> Result<InitialHearing, CaseError> {
    Ok(InitialHearing {
        tipo: required_text("audiencia_inicial.tipo", &input.tipo, MAX_SHORT_TEXT_LEN)?,
        fecha: input.fecha,
        lugar: optional_text(
            "audiencia_inicial.lugar",
            input.lugar.as_deref(),
            MAX_SHORT_TEXT_LEN,
        )?,
    })
}

impl Workflow {
    /// Load a profile and check its role; a mismatch is a validation error on `field`.
    async fn profile_with_role(
        &self,
        profile_id: Uuid,
        role: UserRole,
        field: &str,
    ) -> Result<ProfileRecord, CaseError> {
        match self.db.get_profile(profile_id).await? {
            Some(profile) if profile.role == role => Ok(profile),
            Some(_) => Err(CaseError::validation(
                field,
                format!("el perfil no corresponde a un {}", role.as_str()),
            )),
            None => Err(CaseError::validation(field, "el perfil no existe")),
        }
    }

    /// Create a case with its principal client link and generated stage plan.
    pub async fn create_case(
        &self,
        actor: &Actor,
        input: CreateCaseInput,
    ) -> Result<CaseRecord, CaseError> {
        actor.require_role(&[UserRole::Abogado, UserRole::Analista], "crear casos")?;

        let caratulado = required_text("caratulado", &input.caratulado, MAX_TITLE_LEN)?;
        let numero_causa = optional_text(
            "numero_causa",
            input.numero_causa.as_deref(),
            MAX_SHORT_TEXT_LEN,
        )?;
        let materia = optional_text("materia", input.materia.as_deref(), MAX_SHORT_TEXT_LEN)?;
        let tribunal = optional_text("tribunal", input.tribunal.as_deref(), MAX_SHORT_TEXT_LEN)?;
        let documento_cliente = optional_text(
            "documento_cliente",
            input.documento_cliente.as_deref(),
            MAX_SHORT_TEXT_LEN,
        )?;
        let observaciones = optional_text(
            "observaciones",
            input.observaciones.as_deref(),
            MAX_LONG_TEXT_LEN,
        )?;
        let valor_estimado = non_negative_amount("valor_estimado", input.valor_estimado)?;
        let honorario_total_uf =
            non_negative_amount("honorario_total_uf", input.honorario_total_uf)?;
        let honorario_moneda = match input
            .honorario_moneda
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
        {
            Some(raw) => currency_code("honorario_moneda", raw)?,
            None => self.config.default_currency.clone(),
        };
        let tarifa_referencia = fee_reference(input.tarifa_referencia.as_deref())?;
        let hearing = input.audiencia_inicial.map(hearing_from_input).transpose()?;

        let client_id = input.cliente_principal_id.ok_or_else(|| {
            CaseError::validation("cliente_principal_id", "debe seleccionar un cliente principal")
        })?;
        let client = self
            .profile_with_role(client_id, UserRole::Cliente, "cliente_principal_id")
            .await?;
        let nombre_cliente =
            optional_text("nombre_cliente", input.nombre_cliente.as_deref(), MAX_TITLE_LEN)?
                .unwrap_or_else(|| client.full_name.clone());

        let abogado_responsable = match input.abogado_responsable {
            Some(id) => {
                self.profile_with_role(id, UserRole::Abogado, "abogado_responsable")
                    .await?;
                Some(id)
            }
            None if actor.role == UserRole::Abogado => Some(actor.profile_id),
            None => None,
        };
        let analista_id = if actor.role == UserRole::Analista {
            Some(actor.profile_id)
        } else if let Some(id) = input.analista_id {
            self.profile_with_role(id, UserRole::Analista, "analista_id")
                .await?;
            Some(id)
        } else {
            None
        };

        if let Some(numero) = numero_causa.as_deref()
            && self.db.find_case_by_numero(numero).await?.is_some()
        {
            return Err(duplicate_numero(numero));
        }

        let today = Utc::now().date_naive();
        let fecha_inicio = input.fecha_inicio.unwrap_or(today);
        let plan = StagePlanInput {
            materia: materia.clone(),
            fecha_inicio: Some(fecha_inicio),
            fees: FeeTerms {
                honorario_total_uf,
                honorario_moneda: honorario_moneda.clone(),
                modalidad_cobro: input.modalidad_cobro,
                tarifa_referencia: tarifa_referencia.clone(),
                valor_estimado,
            },
            hearing,
        };
        let stages = generate_stages(&plan, today).map_err(CaseError::Internal)?;

        let bundle = NewCaseBundle {
            case: NewCase {
                id: Uuid::new_v4(),
                numero_causa: numero_causa.clone(),
                caratulado,
                materia,
                tribunal,
                cliente_principal_id: client.id,
                nombre_cliente,
                documento_cliente,
                abogado_responsable,
                analista_id,
                estado: CaseStatus::Activo,
                prioridad: input.prioridad.unwrap_or(CasePriority::Media),
                workflow_state: WorkflowState::Preparacion,
                fecha_inicio: Some(fecha_inicio),
                valor_estimado,
                honorario_total_uf,
                honorario_moneda,
                modalidad_cobro: input.modalidad_cobro,
                tarifa_referencia,
                observaciones,
                created_by: actor.profile_id,
            },
            stages,
        };

        let case = self
            .db
            .create_case_bundle(&bundle)
            .await
            .map_err(|e| map_case_write_error(e, numero_causa.as_deref()))?;

        tracing::info!(
            case_id = %case.id,
            actor = %actor.profile_id,
            etapas = bundle.stages.len(),
            "case created"
        );
        self.audit
            .record(
                actor,
                AuditAction::Create,
                ENTITY_CASE,
                case.id,
                serde_json::json!({
                    "after": snapshot(&case),
                    "etapas_generadas": bundle.stages.len(),
                }),
            )
            .await;
        Ok(case)
    }

    pub async fn update_case(
        &self,
        actor: &Actor,
        case_id: Uuid,
        input: UpdateCaseInput,
    ) -> Result<CaseRecord, CaseError> {
        let existing = self.load_case(case_id).await?;
        actor.require_manage(&existing)?;

        let mut params = UpdateCaseParams::default();

        if let Some(numero) = &input.numero_causa {
            let numero = optional_text("numero_causa", numero.as_deref(), MAX_SHORT_TEXT_LEN)?;
            if let Some(value) = numero.as_deref()
                && existing.numero_causa.as_deref() != Some(value)
                && let Some(other) = self.db.find_case_by_numero(value).await?
                && other != case_id
            {
                return Err(duplicate_numero(value));
            }
            params.numero_causa = Some(numero);
        }
        if let Some(caratulado) = &input.caratulado {
            params.caratulado = Some(required_text("caratulado", caratulado, MAX_TITLE_LEN)?);
        }
        if let Some(materia) = &input.materia {
            params.materia = Some(optional_text(
                "materia",
                materia.as_deref(),
                MAX_SHORT_TEXT_LEN,
            )?);
        }
        if let Some(tribunal) = &input.tribunal {
            params.tribunal = Some(optional_text(
                "tribunal",
                tribunal.as_deref(),
                MAX_SHORT_TEXT_LEN,
            )?);
        }
        let new_principal = match input.cliente_principal_id {
            Some(id) if existing.cliente_principal_id != Some(id) => Some(
                self.profile_with_role(id, UserRole::Cliente, "cliente_principal_id")
                    .await?,
            ),
            _ => None,
        };
        if let Some(client) = &new_principal {
            params.cliente_principal_id = Some(Some(client.id));
            params.nombre_cliente = Some(client.full_name.clone());
        }
        if let Some(nombre) = &input.nombre_cliente {
            params.nombre_cliente = Some(required_text("nombre_cliente", nombre, MAX_TITLE_LEN)?);
        }
        if let Some(documento) = &input.documento_cliente {
            params.documento_cliente = Some(optional_text(
                "documento_cliente",
                documento.as_deref(),
                MAX_SHORT_TEXT_LEN,
            )?);
        }
        if let Some(analista) = input.analista_id {
            actor.require_role(&[UserRole::AdminFirma], "reasignar analistas")?;
            if let Some(id) = analista {
                self.profile_with_role(id, UserRole::Analista, "analista_id")
                    .await?;
            }
            params.analista_id = Some(analista);
        }
        params.estado = input.estado;
        params.prioridad = input.prioridad;
        params.workflow_state = input.workflow_state;
        params.fecha_inicio = input.fecha_inicio;
        if let Some(valor) = input.valor_estimado {
            params.valor_estimado = Some(non_negative_amount("valor_estimado", valor)?);
        }
        if let Some(total) = input.honorario_total_uf {
            params.honorario_total_uf = Some(non_negative_amount("honorario_total_uf", total)?);
        }
        if let Some(moneda) = &input.honorario_moneda {
            params.honorario_moneda = Some(currency_code("honorario_moneda", moneda)?);
        }
        params.modalidad_cobro = input.modalidad_cobro;
        if let Some(tarifa) = &input.tarifa_referencia {
            params.tarifa_referencia = Some(fee_reference(tarifa.as_deref())?);
        }
        if let Some(observaciones) = &input.observaciones {
            params.observaciones = Some(optional_text(
                "observaciones",
                observaciones.as_deref(),
                MAX_LONG_TEXT_LEN,
            )?);
        }
        if input.marcar_validado {
            let current = params.workflow_state.unwrap_or(existing.workflow_state);
            params.workflow_state = Some(if current == WorkflowState::Cerrado {
                WorkflowState::Cerrado
            } else {
                WorkflowState::EnRevision
            });
        }

        let numero_for_errors = params
            .numero_causa
            .clone()
            .flatten()
            .or_else(|| existing.numero_causa.clone());
        let updated = self
            .db
            .update_case(case_id, &params)
            .await
            .map_err(|e| map_case_write_error(e, numero_for_errors.as_deref()))?
            .ok_or_else(|| CaseError::not_found("Caso", case_id))?;

        if let Some(client) = &new_principal {
            self.db.link_case_client(case_id, client.id, true).await?;
        }

        let diff = json_diff(&snapshot(&existing), &snapshot(&updated));
        tracing::info!(case_id = %case_id, actor = %actor.profile_id, "case updated");
        self.audit
            .record(actor, AuditAction::Update, ENTITY_CASE, case_id, diff)
            .await;
        Ok(updated)
    }

    /// Delete a case and, through the cascade, its stages and client links. Admin only.
    pub async fn delete_case(&self, actor: &Actor, case_id: Uuid) -> Result<(), CaseError> {
        actor.require_role(&[UserRole::AdminFirma], "eliminar casos")?;
        let existing = self.load_case(case_id).await?;
        if !self.db.delete_case(case_id).await? {
            return Err(CaseError::not_found("Caso", case_id));
        }

        tracing::info!(case_id = %case_id, actor = %actor.profile_id, "case deleted");
        self.audit
            .record(
                actor,
                AuditAction::Delete,
                ENTITY_CASE,
                case_id,
                serde_json::json!({ "before": snapshot(&existing) }),
            )
            .await;
        Ok(())
    }

    /// Make `lawyer_id` the responsible lawyer of the case.
    pub async fn assign_lawyer(
        &self,
        actor: &Actor,
        case_id: Uuid,
        lawyer_id: Uuid,
    ) -> Result<LawyerSummary, CaseError> {
        actor.require_role(
            &[UserRole::AdminFirma, UserRole::Analista],
            "asignar abogados",
        )?;
        let case = self.load_case(case_id).await?;
        let lawyer = self
            .db
            .get_profile(lawyer_id)
            .await?
            .ok_or_else(|| CaseError::not_found("Abogado", lawyer_id))?;
        if lawyer.role != UserRole::Abogado {
            return Err(CaseError::validation(
                "abogado_id",
                "el perfil seleccionado no es un abogado",
            ));
        }
        if case.abogado_responsable == Some(lawyer_id) {
            return Err(CaseError::Conflict(
                "El abogado ya está asignado a este caso".to_string(),
            ));
        }

        let params = UpdateCaseParams {
            abogado_responsable: Some(Some(lawyer_id)),
            ..Default::default()
        };
        self.db
            .update_case(case_id, &params)
            .await?
            .ok_or_else(|| CaseError::not_found("Caso", case_id))?;

        tracing::info!(case_id = %case_id, lawyer = %lawyer_id, "lawyer assigned");
        self.audit
            .record(
                actor,
                AuditAction::AssignLawyer,
                ENTITY_CASE,
                case_id,
                serde_json::json!({
                    "abogado_responsable": {
                        "before": case.abogado_responsable,
                        "after": lawyer_id,
                    }
                }),
            )
            .await;
        Ok(LawyerSummary::from(lawyer))
    }

    pub async fn list_available_lawyers(
        &self,
        actor: &Actor,
    ) -> Result<Vec<LawyerSummary>, CaseError> {
        actor.require_staff("listar abogados")?;
        let lawyers = self.db.list_profiles_by_role(UserRole::Abogado).await?;
        Ok(lawyers.into_iter().map(LawyerSummary::from).collect())
    }

    /// Add a client to the case. A principal link also replaces the case's
    /// principal client.
    pub async fn link_case_client(
        &self,
        actor: &Actor,
        case_id: Uuid,
        client_id: Uuid,
        principal: bool,
    ) -> Result<CaseClientRecord, CaseError> {
        let case = self.load_case(case_id).await?;
        actor.require_manage(&case)?;
        let client = self
            .profile_with_role(client_id, UserRole::Cliente, "client_id")
            .await?;

        let link = self.db.link_case_client(case_id, client.id, principal).await?;
        if principal && case.cliente_principal_id != Some(client.id) {
            let params = UpdateCaseParams {
                cliente_principal_id: Some(Some(client.id)),
                nombre_cliente: Some(client.full_name.clone()),
                ..Default::default()
            };
            self.db.update_case(case_id, &params).await?;
        }

        self.audit
            .record(
                actor,
                AuditAction::Update,
                ENTITY_CASE,
                case_id,
                serde_json::json!({
                    "cliente_vinculado": client.id,
                    "es_principal": principal,
                }),
            )
            .await;
        Ok(link)
    }

    pub async fn list_case_clients(
        &self,
        actor: &Actor,
        case_id: Uuid,
    ) -> Result<Vec<CaseClientRecord>, CaseError> {
        let case = self.load_case(case_id).await?;
        require_view(self.db.as_ref(), actor, &case).await?;
        Ok(self.db.list_case_clients(case_id).await?)
    }

    /// Cases visible to the actor, newest first.
    pub async fn get_cases(
        &self,
        actor: &Actor,
        estado: Option<CaseStatus>,
    ) -> Result<Vec<CaseRecord>, CaseError> {
        let mut filter = CaseFilter {
            estado,
            ..Default::default()
        };
        match actor.role {
            UserRole::AdminFirma | UserRole::Analista => {}
            UserRole::Abogado => filter.abogado_id = Some(actor.profile_id),
            UserRole::Cliente => filter.cliente_id = Some(actor.profile_id),
        }
        Ok(self.db.list_cases(&filter).await?)
    }

    pub async fn get_case_by_id(
        &self,
        actor: &Actor,
        case_id: Uuid,
    ) -> Result<CaseRecord, CaseError> {
        let case = self.load_case(case_id).await?;
        require_view(self.db.as_ref(), actor, &case).await?;
        Ok(case)
    }

    /// Keep `honorario_pagado_uf` equal to the sum of the stages' paid amounts.
    pub(crate) async fn recompute_paid_total(&self, case_id: Uuid) -> Result<Decimal, CaseError> {
        let stages = self.db.list_stages(case_id, false).await?;
        let total = stages
            .iter()
            .try_fold(Decimal::ZERO, |acc, stage| acc.checked_add(stage.monto_pagado_uf))
            .ok_or_else(|| {
                CaseError::Internal(format!("paid total overflows for case {}", case_id))
            })?;
        let params = UpdateCaseParams {
            honorario_pagado_uf: Some(total.round_dp(2)),
            ..Default::default()
        };
        self.db.update_case(case_id, &params).await?;
        Ok(total)
    }
}
