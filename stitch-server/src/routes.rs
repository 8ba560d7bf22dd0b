//! HTTP control surface for the Stitch engine: run start, worker
//! callback, UX complete, plus flow/run inspection.

use axum::{
    extract::{ConnectInfo, FromRequest, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use stitch_core::engine::StitchEngine;
use stitch_core::error::{EngineError, ValidationError as GraphValidationError};
use stitch_core::types::{CallbackPayload, Run, VisualGraph};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::rate_limit::RateLimits;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StitchEngine>,
    pub limits: Arc<RateLimits>,
}

pub fn router(state: AppState) -> Router {
    let callback = Router::new()
        .route(
            "/api/stitch/callback/:run_id/:node_id",
            post(worker_callback),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            webhook_rate_limit,
        ));

    let control = Router::new()
        .route("/api/flows", post(create_flow))
        .route("/api/flows/:flow_id/run", post(start_run))
        .route("/api/stitch/complete/:run_id/:node_id", post(ux_complete))
        .route("/api/stitch/runs/:run_id", get(get_run))
        .route_layer(middleware::from_fn_with_state(state.clone(), api_rate_limit));

    Router::new()
        .merge(callback)
        .merge(control)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Rate-limit middleware ────────────────────────────────────

async fn api_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !state.limits.check_api(addr.ip()) {
        return too_many_requests();
    }
    next.run(request).await
}

async fn webhook_rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !state.limits.check_webhook(addr.ip()) {
        return too_many_requests();
    }
    next.run(request).await
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "success": false, "error": "Too many requests" })),
    )
        .into_response()
}

// ─── Error mapping ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    ValidationError,
    Conflict,
    InternalError,
    ParseError,
}

/// Engine error rendered as `{ success: false, error, code }` with the
/// appropriate HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
    validation: Vec<GraphValidationError>,
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, message: String) -> Self {
        Self {
            status,
            code,
            message,
            validation: Vec::new(),
        }
    }

    fn parse(message: String) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::ParseError, message)
    }

    /// The UX-complete surface reports wrong-state as 400, not 409.
    fn conflict_as_bad_request(mut self) -> Self {
        if self.status == StatusCode::CONFLICT {
            self.status = StatusCode::BAD_REQUEST;
            self.code = ErrorCode::BadRequest;
        }
        self
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::FlowNotFound(_)
            | EngineError::VersionNotFound(_)
            | EngineError::RunNotFound(_)
            | EngineError::NodeNotFound(_)
            | EngineError::NodeStateNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
            }
            EngineError::NoCurrentVersion(_)
            | EngineError::WrongNodeKind { .. }
            | EngineError::BadRequest(_) => {
                Self::new(StatusCode::BAD_REQUEST, ErrorCode::BadRequest, message)
            }
            EngineError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, ErrorCode::Conflict, message)
            }
            EngineError::Validation(errors) => Self {
                status: StatusCode::BAD_REQUEST,
                code: ErrorCode::ValidationError,
                message,
                validation: errors,
            },
            EngineError::Config(_) | EngineError::Store(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::InternalError,
                message,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "success": false,
            "error": self.message,
            "code": self.code,
        });
        if !self.validation.is_empty() {
            body["validationErrors"] =
                serde_json::to_value(&self.validation).unwrap_or(Value::Null);
        }
        (self.status, Json(body)).into_response()
    }
}

/// JSON extractor that renders rejections in the API error shape.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::parse(rejection.to_string())),
        }
    }
}

// ─── Request/response types ───────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateFlowRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowResponse {
    pub flow_id: Uuid,
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    #[serde(default)]
    pub visual_graph: Option<VisualGraph>,
    #[serde(default)]
    pub entity_id: Option<Uuid>,
    #[serde(default)]
    pub input: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub version_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct UxCompleteRequest {
    pub input: Value,
}

// ─── Handlers ─────────────────────────────────────────────────

async fn create_flow(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CreateFlowRequest>,
) -> Result<Json<CreateFlowResponse>, ApiError> {
    let flow = state.engine.create_flow(&body.name).await?;
    Ok(Json(CreateFlowResponse {
        flow_id: flow.flow_id,
        name: flow.name,
    }))
}

async fn start_run(
    State(state): State<AppState>,
    Path(flow_id): Path<Uuid>,
    ApiJson(body): ApiJson<StartRunRequest>,
) -> Result<Json<StartRunResponse>, ApiError> {
    let started = state
        .engine
        .start_run(flow_id, body.visual_graph, body.entity_id, body.input)
        .await?;
    Ok(Json(StartRunResponse {
        run_id: started.run_id,
        version_id: started.version_id,
        status: "started",
    }))
}

/// Worker Protocol inbound. Node-level failures reported by workers are
/// not HTTP errors here — the callback succeeded, the node failed.
async fn worker_callback(
    State(state): State<AppState>,
    Path((run_id, node_id)): Path<(Uuid, String)>,
    ApiJson(payload): ApiJson<CallbackPayload>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .handle_callback(run_id, &node_id, payload)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn ux_complete(
    State(state): State<AppState>,
    Path((run_id, node_id)): Path<(Uuid, String)>,
    ApiJson(body): ApiJson<UxCompleteRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .engine
        .complete_ux(run_id, &node_id, body.input)
        .await
        .map_err(|err| ApiError::from(err).conflict_as_bad_request())?;
    Ok(Json(json!({ "success": true })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.engine.get_run(run_id).await?))
}
