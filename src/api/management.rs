use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::config::{validate_archive_name, validate_model_name, ModelSettings};
use crate::error::ServeError;
use crate::model::{LoadedModel, ModelInfo};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ModelListResponse {
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterModelRequest {
    pub model_name: String,
    /// Archive inside the model store, defaults to `<model_name>.mar`
    #[serde(default)]
    pub archive: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct RegisterModelResponse {
    pub success: bool,
    pub model: ModelInfo,
    pub message: String,
}

#[derive(Serialize)]
pub struct UnregisterModelResponse {
    pub success: bool,
    pub model_name: String,
    pub message: String,
}

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub success: bool,
    pub message: String,
}

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let models = state.registry.list().await;
    (StatusCode::OK, Json(ModelListResponse { models }))
}

pub async fn describe_model(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
) -> Result<Json<ModelInfo>, ServeError> {
    let model = state.registry.get(&model_name).await?;
    Ok(Json(model.info()))
}

#[tracing::instrument(skip(state))]
pub async fn register_model(
    State(state): State<AppState>,
    payload: Result<Json<RegisterModelRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServeError> {
    state.ensure_serving()?;
    let Json(req) = payload.map_err(|e| ServeError::BadRequest(e.body_text()))?;

    let archive = req
        .archive
        .clone()
        .unwrap_or_else(|| format!("{}.mar", req.model_name));
    validate_model_name(&req.model_name).map_err(|e| ServeError::BadRequest(e.to_string()))?;
    validate_archive_name(&archive).map_err(|e| ServeError::BadRequest(e.to_string()))?;
    if req.workers == Some(0) || req.timeout_secs == Some(0) {
        return Err(ServeError::BadRequest(
            "workers and timeout_secs must be at least 1".into(),
        ));
    }

    if state.registry.contains(&req.model_name).await {
        return Err(ServeError::Conflict(format!(
            "model '{}' is already registered",
            req.model_name
        )));
    }

    let spec = state.config.spec_for(
        &req.model_name,
        &ModelSettings {
            archive,
            workers: req.workers,
            timeout_secs: req.timeout_secs,
            required: true,
        },
    );

    let store = state.config.model_store.clone();
    let load_spec = spec.clone();
    let loaded = tokio::task::spawn_blocking(move || LoadedModel::load(&store, &load_spec))
        .await
        .map_err(|e| ServeError::ArtifactLoad {
            model: spec.name.clone(),
            reason: format!("loader task failed: {}", e),
        })??;

    let model = state.registry.insert(loaded).await?;
    tracing::info!(model = %spec.name, archive = %spec.archive, "Model registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterModelResponse {
            success: true,
            model: model.info(),
            message: format!("Model '{}' registered", spec.name),
        }),
    ))
}

#[tracing::instrument(skip(state))]
pub async fn unregister_model(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
) -> Result<Json<UnregisterModelResponse>, ServeError> {
    state.registry.remove(&model_name).await?;
    tracing::info!(model = %model_name, "Model unregistered");

    Ok(Json(UnregisterModelResponse {
        success: true,
        message: format!("Model '{}' unregistered", model_name),
        model_name,
    }))
}

/// Administrative shutdown: stop both listeners and release all models.
pub async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!("Shutdown requested over management interface");
    state.shutdown.cancel();

    (
        StatusCode::ACCEPTED,
        Json(ShutdownResponse {
            success: true,
            message: "Shutting down".to_string(),
        }),
    )
}
