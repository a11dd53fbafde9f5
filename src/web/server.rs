//! Axum HTTP server for the case workflow gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{
        DefaultBodyLimit, Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderName, HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowHeaders, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::{CaseError, GatewayError};
use crate::legal::advance::{AuthorizeAdvanceInput, RequestAdvanceInput};
use crate::legal::cases::{CreateCaseInput, UpdateCaseInput};
use crate::legal::fees;
use crate::legal::payments::{MarkPaidInput, PaymentLinkInput, RegisterPaymentInput};
use crate::legal::stages::{CreateStageInput, UpdateStageInput};
use crate::legal::validation::non_negative_amount;
use crate::legal::{Actor, Workflow};
use crate::web::auth::{AuthState, PROFILE_HEADER, auth_middleware};
use crate::web::types::*;

/// Shared state for all gateway handlers.
pub struct GatewayState {
    pub workflow: Workflow,
    /// Shutdown signal sender.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
}

impl GatewayState {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            shutdown_tx: tokio::sync::RwLock::new(None),
        }
    }

    /// Ask a running server to stop accepting connections.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Map an extractor rejection to the gateway's error shape.
fn accept<T, R: std::fmt::Display>(extracted: Result<T, R>) -> Result<T, ApiError> {
    extracted.map_err(|rejection| ApiError::BadRequest(rejection.to_string()))
}

/// Build the router. `origins` lists the browser origins allowed by CORS.
pub fn build_router(
    state: Arc<GatewayState>,
    auth_token: String,
    origins: Vec<HeaderValue>,
) -> Router {
    // Public routes (no auth)
    let public = Router::new().route("/api/health", get(health_handler));

    let auth_state = AuthState {
        token: auth_token,
        workflow: state.workflow.clone(),
    };
    let protected = Router::new()
        // Cases
        .route(
            "/api/cases",
            get(cases_list_handler).post(cases_create_handler),
        )
        .route(
            "/api/cases/{id}",
            get(cases_detail_handler)
                .put(cases_update_handler)
                .delete(cases_delete_handler),
        )
        .route("/api/cases/{id}/lawyer", post(cases_assign_lawyer_handler))
        .route(
            "/api/cases/{id}/clients",
            get(cases_clients_list_handler).post(cases_clients_link_handler),
        )
        .route(
            "/api/cases/{id}/stages",
            get(stages_list_handler).post(stages_create_handler),
        )
        .route(
            "/api/cases/{id}/advance/request",
            post(advance_request_handler),
        )
        .route(
            "/api/cases/{id}/advance/authorize",
            post(advance_authorize_handler),
        )
        // Stages
        .route(
            "/api/stages/{id}",
            axum::routing::put(stages_update_handler).delete(stages_delete_handler),
        )
        .route("/api/stages/{id}/complete", post(stages_complete_handler))
        .route(
            "/api/stages/{id}/payment-link",
            post(stages_payment_link_handler),
        )
        .route("/api/stages/{id}/payments", post(stages_payment_handler))
        .route("/api/stages/{id}/mark-paid", post(stages_mark_paid_handler))
        // Directory, overview, audit
        .route("/api/lawyers", get(lawyers_list_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/audit", get(audit_list_handler))
        .route("/api/fees/{reference}", get(fee_lookup_handler))
        .route_layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(PROFILE_HEADER),
        ]));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0) and
/// the server task, which finishes after [`GatewayState::shutdown`].
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
    auth_token: String,
) -> Result<(SocketAddr, JoinHandle<()>), GatewayError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::StartupFailed(format!("Failed to bind to {}: {}", addr, e)))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| GatewayError::StartupFailed(format!("Failed to get local addr: {}", e)))?;

    // Browser clients are served from the same host.
    let origins = [
        format!("http://{}:{}", bound_addr.ip(), bound_addr.port()),
        format!("http://localhost:{}", bound_addr.port()),
    ]
    .iter()
    .filter_map(|origin| HeaderValue::from_str(origin).ok())
    .collect();
    let app = build_router(state.clone(), auth_token, origins);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Gateway shutting down");
            })
            .await
        {
            tracing::error!("Gateway server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "gateway listening");
    Ok((bound_addr, handle))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "lexaltius",
    })
}

// --- Case handlers ---

async fn cases_list_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    query: Result<Query<CaseListQuery>, QueryRejection>,
) -> ApiResult<CaseListResponse> {
    let Query(query) = accept(query)?;
    let cases = state.workflow.get_cases(&actor, query.estado).await?;
    Ok(Json(CaseListResponse {
        success: true,
        cases,
    }))
}

async fn cases_create_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    payload: Result<Json<CreateCaseInput>, JsonRejection>,
) -> ApiResult<CaseResponse> {
    let Json(input) = accept(payload)?;
    let case = state.workflow.create_case(&actor, input).await?;
    Ok(Json(CaseResponse {
        success: true,
        case,
    }))
}

async fn cases_detail_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<CaseResponse> {
    let Path(id) = accept(id)?;
    let case = state.workflow.get_case_by_id(&actor, id).await?;
    Ok(Json(CaseResponse {
        success: true,
        case,
    }))
}

async fn cases_update_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<UpdateCaseInput>, JsonRejection>,
) -> ApiResult<CaseResponse> {
    let Path(id) = accept(id)?;
    let Json(input) = accept(payload)?;
    let case = state.workflow.update_case(&actor, id, input).await?;
    Ok(Json(CaseResponse {
        success: true,
        case,
    }))
}

async fn cases_delete_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<ActionResponse> {
    let Path(id) = accept(id)?;
    state.workflow.delete_case(&actor, id).await?;
    Ok(Json(ActionResponse::ok("Caso eliminado")))
}

async fn cases_assign_lawyer_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<AssignLawyerRequest>, JsonRejection>,
) -> ApiResult<LawyerResponse> {
    let Path(id) = accept(id)?;
    let Json(body) = accept(payload)?;
    let lawyer = state
        .workflow
        .assign_lawyer(&actor, id, body.abogado_id)
        .await?;
    Ok(Json(LawyerResponse {
        success: true,
        lawyer,
    }))
}

async fn cases_clients_list_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<CaseClientListResponse> {
    let Path(id) = accept(id)?;
    let clients = state.workflow.list_case_clients(&actor, id).await?;
    Ok(Json(CaseClientListResponse {
        success: true,
        clients,
    }))
}

async fn cases_clients_link_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<LinkClientRequest>, JsonRejection>,
) -> ApiResult<CaseClientResponse> {
    let Path(id) = accept(id)?;
    let Json(body) = accept(payload)?;
    let link = state
        .workflow
        .link_case_client(&actor, id, body.client_id, body.principal)
        .await?;
    Ok(Json(CaseClientResponse {
        success: true,
        link,
    }))
}

// --- Stage handlers ---

async fn stages_list_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<StageListResponse> {
    let Path(id) = accept(id)?;
    let stages = state.workflow.get_stages(&actor, id).await?;
    Ok(Json(StageListResponse {
        success: true,
        stages,
    }))
}

async fn stages_create_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<CreateStageInput>, JsonRejection>,
) -> ApiResult<StageResponse> {
    let Path(id) = accept(id)?;
    let Json(input) = accept(payload)?;
    let stage = state.workflow.create_stage(&actor, id, input).await?;
    Ok(Json(StageResponse {
        success: true,
        stage,
    }))
}

async fn stages_update_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<UpdateStageInput>, JsonRejection>,
) -> ApiResult<StageResponse> {
    let Path(id) = accept(id)?;
    let Json(input) = accept(payload)?;
    let stage = state.workflow.update_stage(&actor, id, input).await?;
    Ok(Json(StageResponse {
        success: true,
        stage,
    }))
}

async fn stages_delete_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<ActionResponse> {
    let Path(id) = accept(id)?;
    state.workflow.delete_stage(&actor, id).await?;
    Ok(Json(ActionResponse::ok("Etapa eliminada")))
}

async fn stages_complete_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<StageResponse> {
    let Path(id) = accept(id)?;
    let stage = state.workflow.complete_stage(&actor, id).await?;
    Ok(Json(StageResponse {
        success: true,
        stage,
    }))
}

async fn stages_payment_link_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<PaymentLinkInput>, JsonRejection>,
) -> ApiResult<StageResponse> {
    let Path(id) = accept(id)?;
    let Json(body) = accept(payload)?;
    let stage = state
        .workflow
        .set_payment_link(&actor, id, &body.enlace_pago)
        .await?;
    Ok(Json(StageResponse {
        success: true,
        stage,
    }))
}

async fn stages_payment_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<RegisterPaymentInput>, JsonRejection>,
) -> ApiResult<StageResponse> {
    let Path(id) = accept(id)?;
    let Json(body) = accept(payload)?;
    let stage = state
        .workflow
        .register_payment(&actor, id, body.monto)
        .await?;
    Ok(Json(StageResponse {
        success: true,
        stage,
    }))
}

async fn stages_mark_paid_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<MarkPaidInput>, JsonRejection>,
) -> ApiResult<StageResponse> {
    let Path(id) = accept(id)?;
    let Json(body) = accept(payload)?;
    let stage = state
        .workflow
        .mark_stage_paid(&actor, id, body.confirm_underpayment)
        .await?;
    Ok(Json(StageResponse {
        success: true,
        stage,
    }))
}

// --- Advancement handlers ---

async fn advance_request_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<RequestAdvanceInput>, JsonRejection>,
) -> ApiResult<AdvanceResponse> {
    let Path(id) = accept(id)?;
    let Json(body) = accept(payload)?;
    let outcome = state
        .workflow
        .request_case_advance(&actor, id, body.stage_id)
        .await?;
    Ok(Json(AdvanceResponse {
        success: true,
        outcome,
    }))
}

async fn advance_authorize_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<AuthorizeAdvanceInput>, JsonRejection>,
) -> ApiResult<AdvanceResponse> {
    let Path(id) = accept(id)?;
    let Json(body) = accept(payload)?;
    let outcome = state
        .workflow
        .authorize_case_advance(&actor, id, body.target_order)
        .await?;
    Ok(Json(AdvanceResponse {
        success: true,
        outcome,
    }))
}

// --- Directory, dashboard, audit, fees ---

async fn lawyers_list_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
) -> ApiResult<LawyerListResponse> {
    let lawyers = state.workflow.list_available_lawyers(&actor).await?;
    Ok(Json(LawyerListResponse {
        success: true,
        lawyers,
    }))
}

async fn dashboard_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    query: Result<Query<DashboardQuery>, QueryRejection>,
) -> ApiResult<DashboardResponse> {
    let Query(query) = accept(query)?;
    let today = query.fecha.unwrap_or_else(|| Utc::now().date_naive());
    let summary = state.workflow.dashboard_summary(&actor, today).await?;
    Ok(Json(DashboardResponse {
        success: true,
        summary,
    }))
}

async fn audit_list_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(actor): Extension<Actor>,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> ApiResult<AuditListResponse> {
    let Query(query) = accept(query)?;
    let entries = state
        .workflow
        .list_audit_logs(&actor, query.entity_type, query.entity_id, query.limit)
        .await?;
    Ok(Json(AuditListResponse {
        success: true,
        total: entries.len(),
        entries,
    }))
}

async fn fee_lookup_handler(
    Path(reference): Path<String>,
    query: Result<Query<FeeQuery>, QueryRejection>,
) -> ApiResult<FeeLookupResponse> {
    let Query(query) = accept(query)?;
    let valor_estimado = non_negative_amount("valor_estimado", query.valor_estimado)?;
    let item = fees::get_fee_item(&reference)
        .map_err(CaseError::Internal)?
        .ok_or_else(|| CaseError::not_found("Arancel", reference.trim()))?;
    Ok(Json(FeeLookupResponse {
        success: true,
        code: item.code.clone(),
        materia: item.materia.as_str(),
        descripcion: item.descripcion.clone(),
        monto: item.amount_for(valor_estimado),
    }))
}
