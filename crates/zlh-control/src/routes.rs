use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use zlh_model::InstanceId;
use zlh_provision::{ProvisionError, ProvisionRequest, Provisioned, TeardownReport};

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

pub struct ApiError(pub ProvisionError);

impl From<ProvisionError> for ApiError {
    fn from(value: ProvisionError) -> Self {
        Self(value)
    }
}

pub fn status_for(err: &ProvisionError) -> StatusCode {
    match err {
        ProvisionError::Validation(_) => StatusCode::BAD_REQUEST,
        ProvisionError::TemplateNotFound(_) | ProvisionError::NotFound(_) => StatusCode::NOT_FOUND,
        ProvisionError::RangeExhausted { .. } | ProvisionError::InsufficientPorts { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ProvisionError::StillRunning { .. } => StatusCode::CONFLICT,
        ProvisionError::HypervisorTimeout { .. } | ProvisionError::AgentTimeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ProvisionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn provision(
    State(state): State<AppState>,
    Json(req): Json<ProvisionRequest>,
) -> Result<Json<Provisioned>, ApiError> {
    let out = state.orchestrator.provision(req).await?;
    Ok(Json(out))
}

#[derive(Debug, Default, Deserialize)]
pub struct TeardownQuery {
    #[serde(default)]
    pub force: bool,
}

async fn decommission(
    State(state): State<AppState>,
    Path(id): Path<InstanceId>,
    Query(q): Query<TeardownQuery>,
) -> Result<Json<TeardownReport>, ApiError> {
    let report = state.decommissioner.decommission(id, q.force).await?;
    Ok(Json(report))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/provision", post(provision))
        .route("/instances/:id", delete(decommission))
        .with_state(state)
}
