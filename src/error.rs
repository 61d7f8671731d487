use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::handler::HandlerError;

/// Errors raised while starting the endpoint or serving a request.
#[derive(Error, Debug)]
pub enum ServeError {
    /// The named archive does not exist in the model store
    #[error("Model archive for '{model}' not found at {}", path.display())]
    ArtifactNotFound { model: String, path: PathBuf },

    /// The archive exists but is malformed or its handler failed to initialize
    #[error("Failed to load model '{model}': {reason}")]
    ArtifactLoad { model: String, reason: String },

    /// No loaded model answers to this name
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// The handler failed while running a request
    #[error("Inference failed for model '{model}': {source}")]
    Inference {
        model: String,
        #[source]
        source: HandlerError,
    },

    /// The request did not complete within the model's response timeout
    #[error("Inference for model '{model}' timed out after {timeout_ms} ms")]
    InferenceTimeout { model: String, timeout_ms: u64 },

    /// A line of the dependency manifest could not be satisfied
    #[error("Dependency resolution failed: {0}")]
    DependencyResolution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The endpoint is shutting down and accepts no new work
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Result type alias for serving operations
pub type Result<T> = std::result::Result<T, ServeError>;

/// JSON body returned for every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
}

impl ServeError {
    /// Name of the error as reported to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            ServeError::ArtifactNotFound { .. } => "ArtifactNotFoundError",
            ServeError::ArtifactLoad { .. } => "ArtifactLoadError",
            ServeError::ModelNotFound(_) => "ModelNotFoundError",
            ServeError::Inference { .. } => "InferenceError",
            ServeError::InferenceTimeout { .. } => "InferenceTimeoutError",
            ServeError::DependencyResolution(_) => "DependencyResolutionError",
            ServeError::Config(_) => "ConfigError",
            ServeError::Bind { .. } => "BindError",
            ServeError::BadRequest(_) => "BadRequestError",
            ServeError::Conflict(_) => "ConflictError",
            ServeError::Unavailable(_) => "ServiceUnavailableError",
            ServeError::Io(_) => "IoError",
            ServeError::Toml(_) | ServeError::TomlSerialize(_) => "ConfigError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServeError::ArtifactNotFound { .. } | ServeError::ModelNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ServeError::ArtifactLoad { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServeError::Inference { source, .. } if source.is_client_error() => {
                StatusCode::BAD_REQUEST
            }
            ServeError::Inference {
                source: HandlerError::Backend(_),
                ..
            } => StatusCode::BAD_GATEWAY,
            ServeError::InferenceTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ServeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::Conflict(_) => StatusCode::CONFLICT,
            ServeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.status_code().as_u16(),
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Request failed");
        } else {
            tracing::debug!(error = %self, kind = self.kind(), "Request rejected");
        }

        (status, Json(self.to_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServeError::ModelNotFound("llama2-7b-chat".to_string());
        assert_eq!(err.to_string(), "Model not found: llama2-7b-chat");
        assert_eq!(err.kind(), "ModelNotFoundError");
    }

    #[test]
    fn test_status_mapping() {
        let timeout = ServeError::InferenceTimeout {
            model: "m".into(),
            timeout_ms: 10,
        };
        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let bad_input = ServeError::Inference {
            model: "m".into(),
            source: HandlerError::InvalidInput("no text".into()),
        };
        assert_eq!(bad_input.status_code(), StatusCode::BAD_REQUEST);

        let runtime = ServeError::Inference {
            model: "m".into(),
            source: HandlerError::Runtime("boom".into()),
        };
        assert_eq!(runtime.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let load = ServeError::ArtifactLoad {
            model: "m".into(),
            reason: "bad manifest".into(),
        };
        assert_eq!(load.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_error_body_shape() {
        let body = ServeError::Conflict("already registered".into()).to_body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], 409);
        assert_eq!(json["type"], "ConflictError");
        assert_eq!(json["message"], "Conflict: already registered");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ServeError = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }
}
