//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait that unifies all persistence
//! operations. Two implementations exist behind feature flags:
//!
//! - `postgres` (default): Uses `deadpool-postgres` + `tokio-postgres`
//! - `libsql`: Uses libSQL (Turso's SQLite fork) for embedded deployment and tests
//!
//! Scope counters on a case are only ever written through
//! [`CaseStore::apply_scope_change`], which compares and sets them together
//! with the stage payment transition in a single transaction.

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "libsql")]
pub mod libsql;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        crate::config::DatabaseBackend::LibSql => {
            let default_path = crate::config::default_libsql_path();
            let db_path = config.libsql_path.as_deref().unwrap_or(&default_path);
            let backend = libsql::LibSqlBackend::new_local(db_path).await?;
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "postgres")]
        crate::config::DatabaseBackend::Postgres => {
            let pg = postgres::PgBackend::new(config).await?;
            pg.run_migrations().await?;
            Ok(Arc::new(pg))
        }
        #[allow(unreachable_patterns)]
        other => Err(DatabaseError::Pool(format!(
            "database backend {:?} is not compiled in; enable the matching cargo feature",
            other
        ))),
    }
}

/// Role of a profile inside the firm's tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    AdminFirma,
    Abogado,
    Analista,
    Cliente,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdminFirma => "admin_firma",
            Self::Abogado => "abogado",
            Self::Analista => "analista",
            Self::Cliente => "cliente",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "admin_firma" => Some(Self::AdminFirma),
            "abogado" => Some(Self::Abogado),
            "analista" => Some(Self::Analista),
            "cliente" => Some(Self::Cliente),
            _ => None,
        }
    }

    /// Firm staff, as opposed to clients.
    pub fn is_staff(self) -> bool {
        !matches!(self, Self::Cliente)
    }
}

/// Case lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Activo,
    Suspendido,
    Archivado,
    Terminado,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activo => "activo",
            Self::Suspendido => "suspendido",
            Self::Archivado => "archivado",
            Self::Terminado => "terminado",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "activo" => Some(Self::Activo),
            "suspendido" => Some(Self::Suspendido),
            "archivado" => Some(Self::Archivado),
            "terminado" => Some(Self::Terminado),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasePriority {
    Baja,
    Media,
    Alta,
    Urgente,
}

impl CasePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baja => "baja",
            Self::Media => "media",
            Self::Alta => "alta",
            Self::Urgente => "urgente",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "baja" => Some(Self::Baja),
            "media" => Some(Self::Media),
            "alta" => Some(Self::Alta),
            "urgente" => Some(Self::Urgente),
            _ => None,
        }
    }
}

/// Internal review workflow of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Preparacion,
    EnRevision,
    Activo,
    Cerrado,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preparacion => "preparacion",
            Self::EnRevision => "en_revision",
            Self::Activo => "activo",
            Self::Cerrado => "cerrado",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "preparacion" => Some(Self::Preparacion),
            "en_revision" => Some(Self::EnRevision),
            "activo" => Some(Self::Activo),
            "cerrado" => Some(Self::Cerrado),
            _ => None,
        }
    }
}

/// How the firm bills the case (`modalidad_cobro`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModality {
    Prepago,
    Postpago,
    Mixto,
}

impl BillingModality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepago => "prepago",
            Self::Postpago => "postpago",
            Self::Mixto => "mixto",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "prepago" => Some(Self::Prepago),
            "postpago" => Some(Self::Postpago),
            "mixto" => Some(Self::Mixto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pendiente,
    EnProceso,
    Completado,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pendiente => "pendiente",
            Self::EnProceso => "en_proceso",
            Self::Completado => "completado",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "pendiente" => Some(Self::Pendiente),
            "en_proceso" => Some(Self::EnProceso),
            "completado" => Some(Self::Completado),
            _ => None,
        }
    }
}

/// Payment sub-state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pendiente,
    Solicitado,
    EnProceso,
    Parcial,
    Pagado,
    Vencido,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pendiente => "pendiente",
            Self::Solicitado => "solicitado",
            Self::EnProceso => "en_proceso",
            Self::Parcial => "parcial",
            Self::Pagado => "pagado",
            Self::Vencido => "vencido",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "pendiente" => Some(Self::Pendiente),
            "solicitado" => Some(Self::Solicitado),
            "en_proceso" => Some(Self::EnProceso),
            "parcial" => Some(Self::Parcial),
            "pagado" => Some(Self::Pagado),
            "vencido" => Some(Self::Vencido),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    AssignLawyer,
    RequestAdvance,
    AuthorizeAdvance,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::AssignLawyer => "ASSIGN_LAWYER",
            Self::RequestAdvance => "REQUEST_ADVANCE",
            Self::AuthorizeAdvance => "AUTHORIZE_ADVANCE",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            "ASSIGN_LAWYER" => Some(Self::AssignLawyer),
            "REQUEST_ADVANCE" => Some(Self::RequestAdvance),
            "AUTHORIZE_ADVANCE" => Some(Self::AuthorizeAdvance),
            _ => None,
        }
    }
}

// ==================== Records ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub role: UserRole,
    pub telefono: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateProfileParams {
    pub full_name: String,
    pub email: String,
    pub role: UserRole,
    pub telefono: Option<String>,
}

/// The client/firm advancement ceilings of a case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseScope {
    /// Highest stage `orden` the client has requested.
    pub solicitado: i32,
    /// Highest stage `orden` the firm has authorized.
    pub autorizado: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: Uuid,
    pub numero_causa: Option<String>,
    pub caratulado: String,
    pub materia: Option<String>,
    pub tribunal: Option<String>,
    pub cliente_principal_id: Option<Uuid>,
    pub nombre_cliente: String,
    pub documento_cliente: Option<String>,
    pub abogado_responsable: Option<Uuid>,
    pub analista_id: Option<Uuid>,
    pub estado: CaseStatus,
    pub prioridad: CasePriority,
    pub workflow_state: WorkflowState,
    pub fecha_inicio: Option<NaiveDate>,
    pub valor_estimado: Option<Decimal>,
    pub honorario_total_uf: Option<Decimal>,
    pub honorario_pagado_uf: Decimal,
    pub honorario_moneda: String,
    pub modalidad_cobro: Option<BillingModality>,
    pub tarifa_referencia: Option<String>,
    pub alcance_cliente_solicitado: i32,
    pub alcance_cliente_autorizado: i32,
    pub observaciones: Option<String>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseRecord {
    pub fn scope(&self) -> CaseScope {
        CaseScope {
            solicitado: self.alcance_cliente_solicitado,
            autorizado: self.alcance_cliente_autorizado,
        }
    }
}

/// Insertable case row. Scope counters always start at zero.
#[derive(Debug, Clone)]
pub struct NewCase {
    pub id: Uuid,
    pub numero_causa: Option<String>,
    pub caratulado: String,
    pub materia: Option<String>,
    pub tribunal: Option<String>,
    pub cliente_principal_id: Uuid,
    pub nombre_cliente: String,
    pub documento_cliente: Option<String>,
    pub abogado_responsable: Option<Uuid>,
    pub analista_id: Option<Uuid>,
    pub estado: CaseStatus,
    pub prioridad: CasePriority,
    pub workflow_state: WorkflowState,
    pub fecha_inicio: Option<NaiveDate>,
    pub valor_estimado: Option<Decimal>,
    pub honorario_total_uf: Option<Decimal>,
    pub honorario_moneda: String,
    pub modalidad_cobro: Option<BillingModality>,
    pub tarifa_referencia: Option<String>,
    pub observaciones: Option<String>,
    pub created_by: Uuid,
}

/// A case together with its principal client link and generated stages,
/// written atomically.
#[derive(Debug, Clone)]
pub struct NewCaseBundle {
    pub case: NewCase,
    pub stages: Vec<NewStage>,
}

/// Partial case update. `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default)]
pub struct UpdateCaseParams {
    pub numero_causa: Option<Option<String>>,
    pub caratulado: Option<String>,
    pub materia: Option<Option<String>>,
    pub tribunal: Option<Option<String>>,
    pub cliente_principal_id: Option<Option<Uuid>>,
    pub nombre_cliente: Option<String>,
    pub documento_cliente: Option<Option<String>>,
    pub abogado_responsable: Option<Option<Uuid>>,
    pub analista_id: Option<Option<Uuid>>,
    pub estado: Option<CaseStatus>,
    pub prioridad: Option<CasePriority>,
    pub workflow_state: Option<WorkflowState>,
    pub fecha_inicio: Option<Option<NaiveDate>>,
    pub valor_estimado: Option<Option<Decimal>>,
    pub honorario_total_uf: Option<Option<Decimal>>,
    pub honorario_pagado_uf: Option<Decimal>,
    pub honorario_moneda: Option<String>,
    pub modalidad_cobro: Option<Option<BillingModality>>,
    pub tarifa_referencia: Option<Option<String>>,
    pub observaciones: Option<Option<String>>,
}

impl UpdateCaseParams {
    /// Overlay this update on an existing row. Scope counters are untouched.
    pub fn merge_into(&self, existing: &CaseRecord) -> CaseRecord {
        let mut merged = existing.clone();
        if let Some(value) = &self.numero_causa {
            merged.numero_causa = value.clone();
        }
        if let Some(value) = &self.caratulado {
            merged.caratulado = value.clone();
        }
        if let Some(value) = &self.materia {
            merged.materia = value.clone();
        }
        if let Some(value) = &self.tribunal {
            merged.tribunal = value.clone();
        }
        if let Some(value) = self.cliente_principal_id {
            merged.cliente_principal_id = value;
        }
        if let Some(value) = &self.nombre_cliente {
            merged.nombre_cliente = value.clone();
        }
        if let Some(value) = &self.documento_cliente {
            merged.documento_cliente = value.clone();
        }
        if let Some(value) = self.abogado_responsable {
            merged.abogado_responsable = value;
        }
        if let Some(value) = self.analista_id {
            merged.analista_id = value;
        }
        if let Some(value) = self.estado {
            merged.estado = value;
        }
        if let Some(value) = self.prioridad {
            merged.prioridad = value;
        }
        if let Some(value) = self.workflow_state {
            merged.workflow_state = value;
        }
        if let Some(value) = self.fecha_inicio {
            merged.fecha_inicio = value;
        }
        if let Some(value) = self.valor_estimado {
            merged.valor_estimado = value;
        }
        if let Some(value) = self.honorario_total_uf {
            merged.honorario_total_uf = value;
        }
        if let Some(value) = self.honorario_pagado_uf {
            merged.honorario_pagado_uf = value;
        }
        if let Some(value) = &self.honorario_moneda {
            merged.honorario_moneda = value.clone();
        }
        if let Some(value) = self.modalidad_cobro {
            merged.modalidad_cobro = value;
        }
        if let Some(value) = &self.tarifa_referencia {
            merged.tarifa_referencia = value.clone();
        }
        if let Some(value) = &self.observaciones {
            merged.observaciones = value.clone();
        }
        merged
    }
}

/// Row-level visibility filter for case listings.
#[derive(Debug, Clone, Default)]
pub struct CaseFilter {
    /// Only cases where this lawyer is responsible.
    pub abogado_id: Option<Uuid>,
    /// Only cases this client is principal on or linked to.
    pub cliente_id: Option<Uuid>,
    pub estado: Option<CaseStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseClientRecord {
    pub case_id: Uuid,
    pub client_id: Uuid,
    pub es_principal: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: Uuid,
    pub case_id: Uuid,
    pub etapa: String,
    pub descripcion: Option<String>,
    pub fecha_programada: Option<NaiveDate>,
    pub orden: i32,
    pub estado: StageStatus,
    pub es_publica: bool,
    pub requiere_pago: bool,
    pub costo_uf: Option<Decimal>,
    pub porcentaje_variable: Option<Decimal>,
    pub estado_pago: PaymentStatus,
    pub enlace_pago: Option<String>,
    pub monto_pagado_uf: Decimal,
    pub solicitado_por: Option<Uuid>,
    pub solicitado_at: Option<DateTime<Utc>>,
    pub completado_at: Option<DateTime<Utc>>,
    pub audiencia_tipo: Option<String>,
    pub audiencia_fecha: Option<DateTime<Utc>>,
    pub audiencia_lugar: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageRecord {
    /// Completion is blocked while a required payment is outstanding.
    pub fn payment_blocks_completion(&self) -> bool {
        self.requiere_pago && self.estado_pago != PaymentStatus::Pagado
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStage {
    pub etapa: String,
    pub descripcion: Option<String>,
    pub fecha_programada: Option<NaiveDate>,
    pub orden: i32,
    pub estado: StageStatus,
    pub es_publica: bool,
    pub requiere_pago: bool,
    pub costo_uf: Option<Decimal>,
    pub porcentaje_variable: Option<Decimal>,
    pub estado_pago: PaymentStatus,
    pub enlace_pago: Option<String>,
    pub monto_pagado_uf: Decimal,
    pub audiencia_tipo: Option<String>,
    pub audiencia_fecha: Option<DateTime<Utc>>,
    pub audiencia_lugar: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateStageParams {
    pub etapa: Option<String>,
    pub descripcion: Option<Option<String>>,
    pub fecha_programada: Option<Option<NaiveDate>>,
    pub orden: Option<i32>,
    pub estado: Option<StageStatus>,
    pub es_publica: Option<bool>,
    pub requiere_pago: Option<bool>,
    pub costo_uf: Option<Option<Decimal>>,
    pub porcentaje_variable: Option<Option<Decimal>>,
    pub estado_pago: Option<PaymentStatus>,
    pub enlace_pago: Option<Option<String>>,
    pub monto_pagado_uf: Option<Decimal>,
    pub completado_at: Option<Option<DateTime<Utc>>>,
    pub audiencia_tipo: Option<Option<String>>,
    pub audiencia_fecha: Option<Option<DateTime<Utc>>>,
    pub audiencia_lugar: Option<Option<String>>,
}

impl UpdateStageParams {
    pub fn merge_into(&self, existing: &StageRecord) -> StageRecord {
        let mut merged = existing.clone();
        if let Some(value) = &self.etapa {
            merged.etapa = value.clone();
        }
        if let Some(value) = &self.descripcion {
            merged.descripcion = value.clone();
        }
        if let Some(value) = self.fecha_programada {
            merged.fecha_programada = value;
        }
        if let Some(value) = self.orden {
            merged.orden = value;
        }
        if let Some(value) = self.estado {
            merged.estado = value;
        }
        if let Some(value) = self.es_publica {
            merged.es_publica = value;
        }
        if let Some(value) = self.requiere_pago {
            merged.requiere_pago = value;
        }
        if let Some(value) = self.costo_uf {
            merged.costo_uf = value;
        }
        if let Some(value) = self.porcentaje_variable {
            merged.porcentaje_variable = value;
        }
        if let Some(value) = self.estado_pago {
            merged.estado_pago = value;
        }
        if let Some(value) = &self.enlace_pago {
            merged.enlace_pago = value.clone();
        }
        if let Some(value) = self.monto_pagado_uf {
            merged.monto_pagado_uf = value;
        }
        if let Some(value) = self.completado_at {
            merged.completado_at = value;
        }
        if let Some(value) = &self.audiencia_tipo {
            merged.audiencia_tipo = value.clone();
        }
        if let Some(value) = self.audiencia_fecha {
            merged.audiencia_fecha = value;
        }
        if let Some(value) = &self.audiencia_lugar {
            merged.audiencia_lugar = value.clone();
        }
        merged
    }
}

/// Stage payment transition applied together with a scope change.
#[derive(Debug, Clone)]
pub struct PaymentTransition {
    /// Stages with `orden <= max_orden` that require payment are candidates.
    pub max_orden: i32,
    /// Only stages currently in one of these payment states move.
    pub from: Vec<PaymentStatus>,
    pub to: PaymentStatus,
    /// Requester stamp written on moved stages.
    pub requested_by: Option<(Uuid, DateTime<Utc>)>,
}

/// Compare-and-set of a case's scope counters.
#[derive(Debug, Clone)]
pub struct ScopeChange {
    pub case_id: Uuid,
    pub expected: CaseScope,
    pub next: CaseScope,
    pub payment: PaymentTransition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogRecord {
    pub id: Uuid,
    pub actor_id: Option<Uuid>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub diff: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateAuditLogParams {
    pub actor_id: Option<Uuid>,
    pub action: AuditAction,
    pub entity_type: String,
    pub entity_id: String,
    pub diff: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct AuditLogFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub limit: i64,
}

impl Default for AuditLogFilter {
    fn default() -> Self {
        Self {
            entity_type: None,
            entity_id: None,
            limit: 100,
        }
    }
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups related persistence methods. The `Database` supertrait
// combines them all; leaf consumers can depend on a specific sub-trait instead.

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn create_profile(
        &self,
        input: &CreateProfileParams,
    ) -> Result<ProfileRecord, DatabaseError>;
    async fn get_profile(&self, id: Uuid) -> Result<Option<ProfileRecord>, DatabaseError>;
    async fn list_profiles_by_role(
        &self,
        role: UserRole,
    ) -> Result<Vec<ProfileRecord>, DatabaseError>;
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Insert the case, its principal client link and its stages in one transaction.
    async fn create_case_bundle(
        &self,
        bundle: &NewCaseBundle,
    ) -> Result<CaseRecord, DatabaseError>;
    async fn get_case(&self, id: Uuid) -> Result<Option<CaseRecord>, DatabaseError>;
    async fn list_cases(&self, filter: &CaseFilter) -> Result<Vec<CaseRecord>, DatabaseError>;
    async fn find_case_by_numero(
        &self,
        numero_causa: &str,
    ) -> Result<Option<Uuid>, DatabaseError>;
    async fn update_case(
        &self,
        id: Uuid,
        input: &UpdateCaseParams,
    ) -> Result<Option<CaseRecord>, DatabaseError>;
    async fn delete_case(&self, id: Uuid) -> Result<bool, DatabaseError>;
    async fn list_case_clients(&self, case_id: Uuid)
    -> Result<Vec<CaseClientRecord>, DatabaseError>;
    async fn link_case_client(
        &self,
        case_id: Uuid,
        client_id: Uuid,
        es_principal: bool,
    ) -> Result<CaseClientRecord, DatabaseError>;
    async fn is_client_linked(&self, case_id: Uuid, client_id: Uuid)
    -> Result<bool, DatabaseError>;
    /// Compare-and-set the scope counters and apply the stage payment
    /// transition atomically. Returns `None` when the counters no longer
    /// match `expected`, otherwise the number of stages moved.
    async fn apply_scope_change(&self, change: &ScopeChange)
    -> Result<Option<u64>, DatabaseError>;
}

#[async_trait]
pub trait StageStore: Send + Sync {
    async fn list_stages(
        &self,
        case_id: Uuid,
        public_only: bool,
    ) -> Result<Vec<StageRecord>, DatabaseError>;
    async fn get_stage(&self, id: Uuid) -> Result<Option<StageRecord>, DatabaseError>;
    async fn create_stage(
        &self,
        case_id: Uuid,
        input: &NewStage,
    ) -> Result<StageRecord, DatabaseError>;
    async fn update_stage(
        &self,
        id: Uuid,
        input: &UpdateStageParams,
    ) -> Result<Option<StageRecord>, DatabaseError>;
    async fn delete_stage(&self, id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit_log(
        &self,
        input: &CreateAuditLogParams,
    ) -> Result<AuditLogRecord, DatabaseError>;
    async fn list_audit_logs(
        &self,
        filter: &AuditLogFilter,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError>;
}

/// Backend-agnostic database supertrait.
#[async_trait]
pub trait Database: ProfileStore + CaseStore + StageStore + AuditStore + Send + Sync {
    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips_through_db_values() {
        for role in [
            UserRole::AdminFirma,
            UserRole::Abogado,
            UserRole::Analista,
            UserRole::Cliente,
        ] {
            assert_eq!(UserRole::from_db_value(role.as_str()), Some(role));
        }
        for status in [
            PaymentStatus::Pendiente,
            PaymentStatus::Solicitado,
            PaymentStatus::EnProceso,
            PaymentStatus::Parcial,
            PaymentStatus::Pagado,
            PaymentStatus::Vencido,
        ] {
            assert_eq!(PaymentStatus::from_db_value(status.as_str()), Some(status));
        }
        assert_eq!(
            AuditAction::from_db_value("AUTHORIZE_ADVANCE"),
            Some(AuditAction::AuthorizeAdvance)
        );
        assert_eq!(WorkflowState::from_db_value("cerrado"), Some(WorkflowState::Cerrado));
        assert_eq!(CaseStatus::from_db_value("closed"), None);
    }

    #[test]
    fn serde_names_match_db_values() {
        let json = serde_json::to_string(&PaymentStatus::EnProceso).expect("serialize");
        assert_eq!(json, "\"en_proceso\"");
        let json = serde_json::to_string(&AuditAction::AssignLawyer).expect("serialize");
        assert_eq!(json, "\"ASSIGN_LAWYER\"");
        let role: UserRole = serde_json::from_str("\"admin_firma\"").expect("deserialize");
        assert_eq!(role, UserRole::AdminFirma);
    }

    #[test]
    fn payment_gate_only_releases_paid_stages() {
        let now = Utc::now();
        let mut stage = StageRecord {
            id: Uuid::new_v4(),
            case_id: Uuid::new_v4(),
            etapa: "Demanda".to_string(),
            descripcion: None,
            fecha_programada: None,
            orden: 1,
            estado: StageStatus::Pendiente,
            es_publica: true,
            requiere_pago: true,
            costo_uf: Some(Decimal::new(1000, 0)),
            porcentaje_variable: None,
            estado_pago: PaymentStatus::Pendiente,
            enlace_pago: None,
            monto_pagado_uf: Decimal::ZERO,
            solicitado_por: None,
            solicitado_at: None,
            completado_at: None,
            audiencia_tipo: None,
            audiencia_fecha: None,
            audiencia_lugar: None,
            created_at: now,
            updated_at: now,
        };

        for status in [
            PaymentStatus::Pendiente,
            PaymentStatus::Solicitado,
            PaymentStatus::EnProceso,
            PaymentStatus::Parcial,
            PaymentStatus::Vencido,
        ] {
            stage.estado_pago = status;
            assert!(stage.payment_blocks_completion(), "{status:?} must block");
        }

        stage.estado_pago = PaymentStatus::Pagado;
        assert!(!stage.payment_blocks_completion());

        stage.estado_pago = PaymentStatus::Pendiente;
        stage.requiere_pago = false;
        assert!(!stage.payment_blocks_completion());
    }

    #[test]
    fn case_update_merge_clears_and_keeps_fields() {
        let now = Utc::now();
        let existing = CaseRecord {
            id: Uuid::new_v4(),
            numero_causa: Some("LP-100/2026".to_string()),
            caratulado: "Pérez c/ Gómez".to_string(),
            materia: Some("Civil".to_string()),
            tribunal: Some("Juzgado 3ro".to_string()),
            cliente_principal_id: Some(Uuid::new_v4()),
            nombre_cliente: "Ana Pérez".to_string(),
            documento_cliente: None,
            abogado_responsable: None,
            analista_id: None,
            estado: CaseStatus::Activo,
            prioridad: CasePriority::Media,
            workflow_state: WorkflowState::Preparacion,
            fecha_inicio: None,
            valor_estimado: None,
            honorario_total_uf: None,
            honorario_pagado_uf: Decimal::ZERO,
            honorario_moneda: "BOB".to_string(),
            modalidad_cobro: None,
            tarifa_referencia: None,
            alcance_cliente_solicitado: 4,
            alcance_cliente_autorizado: 2,
            observaciones: None,
            created_by: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        };

        let update = UpdateCaseParams {
            tribunal: Some(None),
            prioridad: Some(CasePriority::Alta),
            ..Default::default()
        };
        let merged = update.merge_into(&existing);
        assert_eq!(merged.tribunal, None);
        assert_eq!(merged.prioridad, CasePriority::Alta);
        assert_eq!(merged.materia.as_deref(), Some("Civil"));
        assert_eq!(merged.scope(), existing.scope());
    }
}
