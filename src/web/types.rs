//! Request and response DTOs for the gateway API, and the mapping from
//! workflow errors to HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{AuditLogRecord, CaseClientRecord, CaseRecord, CaseStatus, StageRecord};
use crate::error::CaseError;
use crate::legal::advance::AdvanceOutcome;
use crate::legal::cases::LawyerSummary;
use crate::legal::dashboard::DashboardSummary;

// --- Errors ---

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No autenticado: {0}")]
    Unauthorized(String),

    #[error("Solicitud inválida: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Case(#[from] CaseError),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, field: Option<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            field,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::new(format!("No autenticado: {}", msg), None),
            ),
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new(msg, None))
            }
            ApiError::Case(CaseError::Validation { field, message }) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new(message, Some(field)),
            ),
            ApiError::Case(err @ CaseError::PermissionDenied(_)) => {
                (StatusCode::FORBIDDEN, ErrorResponse::new(err.to_string(), None))
            }
            ApiError::Case(err @ CaseError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, ErrorResponse::new(err.to_string(), None))
            }
            ApiError::Case(CaseError::Conflict(msg)) => {
                (StatusCode::CONFLICT, ErrorResponse::new(msg, None))
            }
            ApiError::Case(err) => {
                tracing::error!("Gateway request failed: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Error interno", None),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

// --- Cases ---

#[derive(Debug, Default, Deserialize)]
pub struct CaseListQuery {
    pub estado: Option<CaseStatus>,
}

#[derive(Debug, Serialize)]
pub struct CaseListResponse {
    pub success: bool,
    pub cases: Vec<CaseRecord>,
}

#[derive(Debug, Serialize)]
pub struct CaseResponse {
    pub success: bool,
    pub case: CaseRecord,
}

#[derive(Debug, Deserialize)]
pub struct AssignLawyerRequest {
    pub abogado_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct LawyerResponse {
    pub success: bool,
    pub lawyer: LawyerSummary,
}

#[derive(Debug, Serialize)]
pub struct LawyerListResponse {
    pub success: bool,
    pub lawyers: Vec<LawyerSummary>,
}

#[derive(Debug, Deserialize)]
pub struct LinkClientRequest {
    pub client_id: Uuid,
    #[serde(default)]
    pub principal: bool,
}

#[derive(Debug, Serialize)]
pub struct CaseClientResponse {
    pub success: bool,
    pub link: CaseClientRecord,
}

#[derive(Debug, Serialize)]
pub struct CaseClientListResponse {
    pub success: bool,
    pub clients: Vec<CaseClientRecord>,
}

// --- Stages ---

#[derive(Debug, Serialize)]
pub struct StageListResponse {
    pub success: bool,
    pub stages: Vec<StageRecord>,
}

#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub success: bool,
    pub stage: StageRecord,
}

// --- Advancement ---

#[derive(Debug, Serialize)]
pub struct AdvanceResponse {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: AdvanceOutcome,
}

// --- Dashboard, audit, fees ---

#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    /// Reference day for the upcoming-stage window; defaults to today (UTC).
    pub fecha: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub success: bool,
    #[serde(flatten)]
    pub summary: DashboardSummary,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct AuditListResponse {
    pub success: bool,
    pub total: usize,
    pub entries: Vec<AuditLogRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FeeQuery {
    pub valor_estimado: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct FeeLookupResponse {
    pub success: bool,
    pub code: String,
    pub materia: &'static str,
    pub descripcion: String,
    /// `None` when the fee depends on an estimated value that was not given.
    pub monto: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

// --- Health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}
