//! Model handlers turn request bodies into predictions.
//!
//! A handler is created once per loaded archive and shared by every request
//! for that model, so implementations keep their weights read-only and build
//! any scratch state per call.

pub mod ngram;
pub mod remote;

use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use crate::artifact::ModelArtifact;

pub use ngram::NgramGenerator;
pub use remote::{Backend, RemoteHandler};

/// Handler runtimes compiled into the server, with their versions.
pub const RUNTIMES: &[(&str, &str)] = &[
    (ngram::RUNTIME, ngram::VERSION),
    (remote::RUNTIME, remote::VERSION),
];

/// Upper bound on `max_new_tokens` unless a handler configures its own.
pub const MAX_NEW_TOKENS_LIMIT: u32 = 4096;

#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    /// The request payload could not be interpreted
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The archive payload is not usable by this handler
    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    #[error("handler initialization failed: {0}")]
    Initialization(String),

    #[error("runtime failure: {0}")]
    Runtime(String),

    /// An upstream inference backend failed
    #[error("backend error: {0}")]
    Backend(String),
}

impl HandlerError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, HandlerError::InvalidInput(_))
    }
}

/// Sampling parameters for one prompt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    /// 0 selects the most likely token at every step
    pub temperature: f32,
    pub top_p: f32,
    /// 0 disables top-k filtering
    pub top_k: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 2048,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            seed: None,
        }
    }
}

/// Per-request or per-archive overrides of [`GenerationParams`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerationParams {
    pub fn with_overrides(self, overrides: &GenerationOverrides) -> Result<Self, HandlerError> {
        let params = Self {
            max_new_tokens: overrides.max_new_tokens.unwrap_or(self.max_new_tokens),
            temperature: overrides.temperature.unwrap_or(self.temperature),
            top_p: overrides.top_p.unwrap_or(self.top_p),
            top_k: overrides.top_k.unwrap_or(self.top_k),
            seed: overrides.seed.or(self.seed),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), HandlerError> {
        if self.max_new_tokens == 0 {
            return Err(HandlerError::InvalidInput(
                "max_new_tokens must be at least 1".into(),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(HandlerError::InvalidInput(
                "temperature must be a non-negative number".into(),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(HandlerError::InvalidInput("top_p must be in (0, 1]".into()));
        }
        Ok(())
    }

    pub fn check_limit(&self, max_new_tokens_limit: u32) -> Result<(), HandlerError> {
        if self.max_new_tokens > max_new_tokens_limit {
            return Err(HandlerError::InvalidInput(format!(
                "max_new_tokens must be at most {}",
                max_new_tokens_limit
            )));
        }
        Ok(())
    }
}

/// One prompt extracted from a request, with its resolved parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub text: String,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model produced an end-of-sequence or ran out of continuations
    Stop,
    /// `max_new_tokens` was reached
    Length,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// The prompt followed by the generated continuation
    pub generated_text: String,
    pub tokens_generated: u32,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    Done(FinishReason),
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, HandlerError>> + Send>>;

/// A worker reserved for one request.
///
/// Handlers keep the lease alive until all work for the request has finished,
/// including work handed to the blocking pool, and stop early once it is
/// cancelled.
pub struct Lease {
    _permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
}

impl Lease {
    pub fn new(permit: OwnedSemaphorePermit, cancel: CancellationToken) -> Self {
        Self {
            _permit: permit,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[async_trait]
pub trait ModelHandler: Send + Sync {
    /// Name of the handler runtime
    fn runtime(&self) -> &'static str;

    /// Parameters used when a request does not override them.
    fn default_params(&self) -> GenerationParams {
        GenerationParams::default()
    }

    fn max_new_tokens_limit(&self) -> u32 {
        MAX_NEW_TOKENS_LIMIT
    }

    fn preprocess(&self, body: &[u8]) -> Result<Vec<Prompt>, HandlerError> {
        parse_prompts(body, self.default_params(), self.max_new_tokens_limit())
    }

    async fn inference(
        &self,
        prompts: Vec<Prompt>,
        lease: Lease,
    ) -> Result<Vec<Generation>, HandlerError>;

    fn postprocess(&self, outputs: Vec<Generation>) -> Vec<Generation> {
        outputs
    }

    /// Stream the continuation of a single prompt.
    ///
    /// Handlers without incremental output emit the whole continuation as one
    /// token.
    async fn inference_stream(
        &self,
        prompt: Prompt,
        lease: Lease,
    ) -> Result<TokenStream, HandlerError> {
        let prompt_text = prompt.text.clone();
        let generation = self
            .inference(vec![prompt], lease)
            .await?
            .pop()
            .ok_or_else(|| HandlerError::Runtime("handler returned no output".into()))?;

        let continuation = generation
            .generated_text
            .strip_prefix(prompt_text.as_str())
            .unwrap_or(&generation.generated_text)
            .trim_start()
            .to_string();

        let mut events = Vec::with_capacity(2);
        if !continuation.is_empty() {
            events.push(Ok(StreamEvent::Token(continuation)));
        }
        events.push(Ok(StreamEvent::Done(generation.finish_reason)));
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

#[derive(Debug, Deserialize)]
struct PromptInput {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    parameters: GenerationOverrides,
}

/// Extract prompts from a request body.
///
/// Accepts `{"text": ..}`, a list of such objects, a JSON string, or a raw
/// UTF-8 body. Objects without `text` are skipped. No prompt may ask for
/// more than `max_new_tokens_limit` tokens.
pub fn parse_prompts(
    body: &[u8],
    defaults: GenerationParams,
    max_new_tokens_limit: u32,
) -> Result<Vec<Prompt>, HandlerError> {
    let prompts = parse_inputs(body, defaults)?;
    for prompt in &prompts {
        prompt.params.check_limit(max_new_tokens_limit)?;
    }
    Ok(prompts)
}

fn parse_inputs(body: &[u8], defaults: GenerationParams) -> Result<Vec<Prompt>, HandlerError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(HandlerError::InvalidInput("empty request body".into()));
    }

    let items = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => vec![Value::Object(map)],
        Ok(Value::Array(items)) => items,
        Ok(Value::String(text)) => return single_prompt(text, defaults),
        _ => {
            let text = std::str::from_utf8(body)
                .map_err(|_| HandlerError::InvalidInput("body is not valid UTF-8".into()))?;
            return single_prompt(text.to_string(), defaults);
        }
    };

    let mut prompts = Vec::with_capacity(items.len());
    for item in items {
        let input: PromptInput = serde_json::from_value(item)
            .map_err(|e| HandlerError::InvalidInput(format!("malformed input: {}", e)))?;
        let Some(text) = input.text else {
            continue;
        };
        if text.trim().is_empty() {
            return Err(HandlerError::InvalidInput("text must not be empty".into()));
        }
        prompts.push(Prompt {
            text,
            params: defaults.with_overrides(&input.parameters)?,
        });
    }

    if prompts.is_empty() {
        return Err(HandlerError::InvalidInput(
            "request contains no 'text' inputs".into(),
        ));
    }
    Ok(prompts)
}

fn single_prompt(text: String, defaults: GenerationParams) -> Result<Vec<Prompt>, HandlerError> {
    if text.trim().is_empty() {
        return Err(HandlerError::InvalidInput("text must not be empty".into()));
    }
    Ok(vec![Prompt {
        text,
        params: defaults,
    }])
}

/// Build the handler named by an archive's manifest.
pub fn initialize(artifact: &ModelArtifact) -> Result<Arc<dyn ModelHandler>, HandlerError> {
    match artifact.handler() {
        ngram::RUNTIME => Ok(Arc::new(NgramGenerator::from_artifact(artifact)?)),
        remote::RUNTIME => Ok(Arc::new(RemoteHandler::from_artifact(artifact)?)),
        other => Err(HandlerError::Initialization(format!(
            "unknown handler '{}', available: {}",
            other,
            RUNTIMES
                .iter()
                .map(|(name, _)| *name)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}
