pub mod health;
pub mod inference;
pub mod management;

use axum::{
    error_handling::HandleErrorLayer,
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    BoxError, Json, Router,
};
use tower::ServiceBuilder;

use crate::error::ErrorBody;
use crate::AppState;

pub use health::{health_check, ping, HealthResponse, PingResponse};
pub use inference::{predict, predict_stream, PredictionResponse, StreamToken};
pub use management::{
    describe_model, list_models, register_model, shutdown, unregister_model, ModelListResponse,
    RegisterModelRequest, RegisterModelResponse,
};

/// Routes served on the inference port.
pub fn inference_router(state: AppState) -> Router {
    let body_limit = state.config.max_request_size;

    Router::new()
        .route("/ping", get(ping))
        .route("/predictions/:model_name", post(predict))
        .route("/predictions/:model_name/stream", post(predict_stream))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Routes served on the management port.
pub fn management_router(state: AppState) -> Router {
    let timeout = state.config.management_timeout();

    Router::new()
        .route("/health", get(health_check))
        .route("/models", get(list_models).post(register_model))
        .route(
            "/models/:model_name",
            get(describe_model).delete(unregister_model),
        )
        .route("/shutdown", post(shutdown))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_middleware_error))
                .timeout(timeout),
        )
        .with_state(state)
}

async fn handle_middleware_error(err: BoxError) -> impl IntoResponse {
    let (status, kind) = if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::REQUEST_TIMEOUT, "RequestTimeoutError")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
    };
    tracing::warn!(error = %err, "Management request failed in middleware");

    (
        status,
        Json(ErrorBody {
            code: status.as_u16(),
            kind,
            message: err.to_string(),
        }),
    )
}
