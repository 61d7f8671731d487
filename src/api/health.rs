use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppState, EndpointState};

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub state: EndpointState,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: i64,
    pub models_loaded: usize,
}

/// Liveness check on the inference port.
pub async fn ping(State(state): State<AppState>) -> impl IntoResponse {
    let (code, status) = match state.ensure_serving() {
        Ok(()) => (StatusCode::OK, "Healthy"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy"),
    };

    (
        code,
        Json(PingResponse {
            status: status.to_string(),
        }),
    )
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let serving = state.ensure_serving().is_ok();
    let now = Utc::now();
    let response = HealthResponse {
        status: if serving { "healthy" } else { "unhealthy" }.to_string(),
        state: state.lifecycle.current(),
        timestamp: now,
        uptime_secs: (now - state.started_at).num_seconds(),
        models_loaded: state.registry.len().await,
    };

    let code = if serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
