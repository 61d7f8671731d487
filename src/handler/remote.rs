//! Handler that forwards generation to an external inference backend.
//!
//! The archive carries no weights; its `handlerConfig` names the backend:
//! `{"backend": "ollama", "url": "http://localhost:11434", "model": "llama2:7b-chat"}`.

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    FinishReason, Generation, GenerationOverrides, GenerationParams, HandlerError, Lease,
    ModelHandler, Prompt, StreamEvent, TokenStream, MAX_NEW_TOKENS_LIMIT,
};
use crate::artifact::ModelArtifact;

pub const RUNTIME: &str = "remote";
pub const VERSION: &str = "1.0.0";

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const LLAMA_CPP_DEFAULT_URL: &str = "http://localhost:8080";
const HUGGINGFACE_DEFAULT_URL: &str = "https://api-inference.huggingface.co";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Ollama,
    Llama,
    #[serde(rename = "huggingface")]
    HuggingFace,
    #[serde(rename = "openai")]
    OpenAI,
}

impl Backend {
    /// Base URL from the environment, falling back to the public default.
    pub fn default_url(self) -> String {
        let (var, default) = match self {
            Backend::Ollama => ("OLLAMA_URL", OLLAMA_DEFAULT_URL),
            Backend::Llama => ("LLAMA_CPP_URL", LLAMA_CPP_DEFAULT_URL),
            Backend::HuggingFace => ("HUGGINGFACE_URL", HUGGINGFACE_DEFAULT_URL),
            Backend::OpenAI => ("OPENAI_URL", OPENAI_DEFAULT_URL),
        };
        std::env::var(var).unwrap_or_else(|_| default.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RemoteConfig {
    backend: Backend,
    #[serde(default)]
    url: Option<String>,
    /// Upstream model name, defaults to the served model name
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    defaults: GenerationOverrides,
    #[serde(default = "default_request_timeout")]
    request_timeout_secs: u64,
    #[serde(default = "default_max_new_tokens_limit")]
    max_new_tokens_limit: u32,
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_new_tokens_limit() -> u32 {
    MAX_NEW_TOKENS_LIMIT
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    done_reason: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OpenAIChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIChatCompletionResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    completion_tokens: u32,
}

#[derive(Serialize)]
struct HuggingFaceRequest<'a> {
    inputs: &'a str,
    parameters: HuggingFaceParameters,
}

#[derive(Serialize)]
struct HuggingFaceParameters {
    max_new_tokens: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    return_full_text: bool,
}

/// Continuation text as returned by a backend.
struct Completion {
    text: String,
    tokens: u32,
    finish_reason: FinishReason,
}

pub struct RemoteHandler {
    client: reqwest::Client,
    backend: Backend,
    base_url: String,
    model: String,
    defaults: GenerationParams,
    max_new_tokens_limit: u32,
}

impl RemoteHandler {
    pub fn new(
        backend: Backend,
        base_url: impl Into<String>,
        model: impl Into<String>,
        defaults: GenerationParams,
        request_timeout: Duration,
    ) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| HandlerError::Initialization(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            backend,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            defaults,
            max_new_tokens_limit: MAX_NEW_TOKENS_LIMIT,
        })
    }

    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self, HandlerError> {
        let config: RemoteConfig = serde_json::from_value(artifact.manifest.handler_config.clone())
            .map_err(|e| HandlerError::Initialization(format!("bad handlerConfig: {}", e)))?;

        let defaults = GenerationParams::default()
            .with_overrides(&config.defaults)
            .map_err(|e| HandlerError::Initialization(e.to_string()))?;

        defaults
            .check_limit(config.max_new_tokens_limit)
            .map_err(|e| HandlerError::Initialization(e.to_string()))?;

        let base_url = config.url.unwrap_or_else(|| config.backend.default_url());
        let model = config.model.unwrap_or_else(|| artifact.name.clone());

        tracing::info!(
            model = %artifact.name,
            backend = ?config.backend,
            url = %base_url,
            upstream_model = %model,
            "Configured remote backend"
        );

        let mut handler = Self::new(
            config.backend,
            base_url,
            model,
            defaults,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        handler.max_new_tokens_limit = config.max_new_tokens_limit;
        Ok(handler)
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion, HandlerError> {
        match self.backend {
            Backend::Ollama => self.ollama_generate(prompt).await,
            Backend::Llama => self.llama_cpp_completion(prompt).await,
            Backend::HuggingFace => self.huggingface_inference(prompt).await,
            Backend::OpenAI => self.openai_chat_completion(prompt).await,
        }
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, HandlerError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| HandlerError::Backend(format!("{:?} request failed: {}", self.backend, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(HandlerError::Backend(format!(
                "{:?} API error: {} {}",
                self.backend, status, error_text
            )));
        }
        Ok(response)
    }

    async fn ollama_send(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response, HandlerError> {
        let body = OllamaGenerateRequest {
            model: &self.model,
            prompt: &prompt.text,
            stream,
            options: OllamaOptions {
                num_predict: prompt.params.max_new_tokens,
                temperature: prompt.params.temperature,
                top_p: prompt.params.top_p,
                top_k: prompt.params.top_k,
                seed: prompt.params.seed,
            },
        };
        self.post_json("/api/generate", &body, None).await
    }

    async fn llama_cpp_send(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response, HandlerError> {
        let body = serde_json::json!({
            "prompt": prompt.text,
            "n_predict": prompt.params.max_new_tokens,
            "temperature": prompt.params.temperature,
            "top_p": prompt.params.top_p,
            "top_k": prompt.params.top_k,
            "stream": stream
        });
        self.post_json("/v1/completions", &body, None).await
    }

    async fn openai_send(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response, HandlerError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| HandlerError::Backend("OPENAI_API_KEY not set".into()))?;

        let body = OpenAIChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.text.clone(),
            }],
            max_tokens: prompt.params.max_new_tokens,
            temperature: prompt.params.temperature,
            top_p: prompt.params.top_p,
            seed: prompt.params.seed,
            stream,
        };
        self.post_json("/chat/completions", &body, Some(&api_key)).await
    }

    async fn ollama_generate(&self, prompt: &Prompt) -> Result<Completion, HandlerError> {
        let resp: OllamaGenerateResponse = self
            .ollama_send(prompt, false)
            .await?
            .json()
            .await
            .map_err(|e| HandlerError::Backend(format!("cannot parse Ollama response: {}", e)))?;

        let tokens = resp
            .eval_count
            .unwrap_or_else(|| word_count(&resp.response));
        Ok(Completion {
            finish_reason: finish_reason(resp.done_reason.as_deref()),
            text: resp.response,
            tokens,
        })
    }

    async fn llama_cpp_completion(&self, prompt: &Prompt) -> Result<Completion, HandlerError> {
        let resp: serde_json::Value = self
            .llama_cpp_send(prompt, false)
            .await?
            .json()
            .await
            .map_err(|e| HandlerError::Backend(format!("cannot parse llama.cpp response: {}", e)))?;

        let choice = &resp["choices"][0];
        let text = choice["text"]
            .as_str()
            .ok_or_else(|| HandlerError::Backend("invalid llama.cpp response format".into()))?
            .to_string();

        Ok(Completion {
            tokens: word_count(&text),
            finish_reason: finish_reason(choice["finish_reason"].as_str()),
            text,
        })
    }

    async fn huggingface_inference(&self, prompt: &Prompt) -> Result<Completion, HandlerError> {
        let token = std::env::var("HUGGINGFACE_TOKEN")
            .map_err(|_| HandlerError::Backend("HUGGINGFACE_TOKEN not set".into()))?;

        let body = HuggingFaceRequest {
            inputs: &prompt.text,
            parameters: HuggingFaceParameters {
                max_new_tokens: prompt.params.max_new_tokens,
                temperature: prompt.params.temperature,
                top_p: prompt.params.top_p,
                top_k: prompt.params.top_k,
                return_full_text: false,
            },
        };

        let resp: serde_json::Value = self
            .post_json(&format!("/models/{}", self.model), &body, Some(&token))
            .await?
            .json()
            .await
            .map_err(|e| HandlerError::Backend(format!("cannot parse HuggingFace response: {}", e)))?;

        let text = resp[0]["generated_text"]
            .as_str()
            .or(resp[0].as_str())
            .ok_or_else(|| HandlerError::Backend("invalid HuggingFace response format".into()))?
            .to_string();

        Ok(Completion {
            tokens: word_count(&text),
            finish_reason: FinishReason::Stop,
            text,
        })
    }

    async fn openai_chat_completion(&self, prompt: &Prompt) -> Result<Completion, HandlerError> {
        let mut resp: OpenAIChatCompletionResponse = self
            .openai_send(prompt, false)
            .await?
            .json()
            .await
            .map_err(|e| HandlerError::Backend(format!("cannot parse OpenAI response: {}", e)))?;

        if resp.choices.is_empty() {
            return Err(HandlerError::Backend("OpenAI response has no choices".into()));
        }
        let choice = resp.choices.swap_remove(0);
        let tokens = resp
            .usage
            .map(|u| u.completion_tokens)
            .unwrap_or_else(|| word_count(&choice.message.content));

        Ok(Completion {
            finish_reason: finish_reason(choice.finish_reason.as_deref()),
            text: choice.message.content,
            tokens,
        })
    }
}

/// One decoded line of a streamed backend response.
#[derive(Debug, PartialEq)]
struct StreamChunk {
    text: String,
    finish: Option<FinishReason>,
}

/// Decode a line of a streamed response.
///
/// Ollama sends newline-delimited JSON objects; llama.cpp and OpenAI send
/// server-sent events whose `data: ` payload is JSON, closed by `[DONE]`.
fn decode_line(backend: Backend, line: &str) -> Option<StreamChunk> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if backend == Backend::Ollama {
        let resp: OllamaGenerateResponse = serde_json::from_str(line).ok()?;
        return Some(StreamChunk {
            finish: resp.done.then(|| finish_reason(resp.done_reason.as_deref())),
            text: resp.response,
        });
    }

    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(StreamChunk {
            text: String::new(),
            finish: Some(FinishReason::Stop),
        });
    }

    let resp: serde_json::Value = serde_json::from_str(data).ok()?;
    let choice = resp["choices"].as_array()?.first()?;
    let text = match backend {
        Backend::OpenAI => choice["delta"]["content"].as_str(),
        _ => choice["text"].as_str(),
    };
    Some(StreamChunk {
        text: text.unwrap_or_default().to_string(),
        finish: choice["finish_reason"]
            .as_str()
            .map(|reason| finish_reason(Some(reason))),
    })
}

/// Turn a streamed backend response into token events.
///
/// The lease is held until the upstream response is finished or the stream
/// is dropped.
fn token_events(backend: Backend, response: reqwest::Response, lease: Lease) -> TokenStream {
    Box::pin(stream! {
        let _lease = lease;
        let mut byte_stream = response.bytes_stream();
        let mut buffer = Vec::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(HandlerError::Backend(format!("{:?} read error: {}", backend, e)));
                    return;
                }
            };

            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line = String::from_utf8_lossy(&buffer[..pos]).to_string();
                buffer.drain(..=pos);

                let Some(decoded) = decode_line(backend, &line) else {
                    continue;
                };
                if !decoded.text.is_empty() {
                    yield Ok(StreamEvent::Token(decoded.text));
                }
                if let Some(reason) = decoded.finish {
                    yield Ok(StreamEvent::Done(reason));
                    return;
                }
            }
        }

        // upstream closed without a final marker
        yield Ok(StreamEvent::Done(FinishReason::Stop));
    })
}

fn word_count(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

#[async_trait]
impl ModelHandler for RemoteHandler {
    fn runtime(&self) -> &'static str {
        RUNTIME
    }

    fn default_params(&self) -> GenerationParams {
        self.defaults
    }

    fn max_new_tokens_limit(&self) -> u32 {
        self.max_new_tokens_limit
    }

    async fn inference(
        &self,
        prompts: Vec<Prompt>,
        _lease: Lease,
    ) -> Result<Vec<Generation>, HandlerError> {
        let completions =
            futures::future::try_join_all(prompts.iter().map(|p| self.complete(p))).await?;

        Ok(prompts
            .iter()
            .zip(completions)
            .map(|(prompt, completion)| {
                let continuation = completion.text.trim();
                let generated_text = if continuation.is_empty() {
                    prompt.text.clone()
                } else {
                    format!("{} {}", prompt.text.trim_end(), continuation)
                };
                Generation {
                    generated_text,
                    tokens_generated: completion.tokens,
                    finish_reason: completion.finish_reason,
                }
            })
            .collect())
    }

    async fn inference_stream(
        &self,
        prompt: Prompt,
        lease: Lease,
    ) -> Result<TokenStream, HandlerError> {
        let response = match self.backend {
            Backend::Ollama => self.ollama_send(&prompt, true).await?,
            Backend::Llama => self.llama_cpp_send(&prompt, true).await?,
            Backend::OpenAI => self.openai_send(&prompt, true).await?,
            Backend::HuggingFace => {
                // the hosted inference API has no incremental output
                let completion = self.huggingface_inference(&prompt).await?;
                drop(lease);
                let mut events = Vec::with_capacity(2);
                let text = completion.text.trim();
                if !text.is_empty() {
                    events.push(Ok(StreamEvent::Token(text.to_string())));
                }
                events.push(Ok(StreamEvent::Done(completion.finish_reason)));
                return Ok(Box::pin(futures::stream::iter(events)));
            }
        };

        Ok(token_events(self.backend, response, lease))
    }
}
