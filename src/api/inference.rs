use async_stream::stream;
use axum::{
    body::Bytes,
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;

use crate::error::ServeError;
use crate::handler::{FinishReason, Generation, StreamEvent};
use crate::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub model_name: String,
    pub request_id: Uuid,
    pub predictions: Vec<Generation>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamToken {
    pub token: String,
    pub token_id: u32,
    pub complete: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamSummary {
    pub request_id: Uuid,
    pub tokens_generated: u32,
    pub finish_reason: FinishReason,
}

#[tracing::instrument(skip(state, body), fields(request_id = tracing::field::Empty))]
pub async fn predict(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
    body: Bytes,
) -> Result<Json<PredictionResponse>, ServeError> {
    state.ensure_serving()?;
    let request_id = Uuid::new_v4();
    tracing::Span::current().record("request_id", tracing::field::display(request_id));

    let model = state.registry.get(&model_name).await?;
    let predictions = model.predict(&body).await?;

    tracing::debug!(outputs = predictions.len(), "Prediction complete");
    Ok(Json(PredictionResponse {
        model_name,
        request_id,
        predictions,
    }))
}

#[tracing::instrument(skip(state, body), fields(request_id = tracing::field::Empty))]
pub async fn predict_stream(
    State(state): State<AppState>,
    Path(model_name): Path<String>,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServeError> {
    state.ensure_serving()?;
    let request_id = Uuid::new_v4();
    tracing::Span::current().record("request_id", tracing::field::display(request_id));

    let model = state.registry.get(&model_name).await?;
    let deadline = tokio::time::Instant::now() + model.timeout();
    let mut tokens = model.predict_stream(&body).await?;

    let events = stream! {
        let mut token_id = 0u32;

        loop {
            match tokio::time::timeout_at(deadline, tokens.next()).await {
                Ok(Some(Ok(StreamEvent::Token(token)))) => {
                    let stream_token = StreamToken {
                        token,
                        token_id,
                        complete: false,
                    };
                    token_id += 1;

                    if let Ok(json_data) = serde_json::to_string(&stream_token) {
                        yield Ok(Event::default().event("token").data(json_data));
                    }
                }
                Ok(Some(Ok(StreamEvent::Done(finish_reason)))) => {
                    let summary = StreamSummary {
                        request_id,
                        tokens_generated: token_id,
                        finish_reason,
                    };
                    if let Ok(json_data) = serde_json::to_string(&summary) {
                        yield Ok(Event::default().event("done").data(json_data));
                    }
                    break;
                }
                Ok(Some(Err(source))) => {
                    let err = ServeError::Inference {
                        model: model.name().to_string(),
                        source,
                    };
                    tracing::warn!(error = %err, "Stream aborted");
                    yield Ok(error_event(&err));
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    let err = model.timeout_error();
                    tracing::warn!(error = %err, "Stream timed out");
                    yield Ok(error_event(&err));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn error_event(err: &ServeError) -> Event {
    let data = serde_json::to_string(&err.to_body()).unwrap_or_else(|_| err.to_string());
    Event::default().event("error").data(data)
}
