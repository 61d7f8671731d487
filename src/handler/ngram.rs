//! In-process text generation from an n-gram transition table.
//!
//! The serialized file is JSON of the form
//! `{"transitions": {"<s>": {"the": 3}, "the": {"model": 2, "</s>": 1}}}`:
//! for every token, the tokens that may follow it with their counts.
//! Generation continues from the last token of the prompt, or from `<s>`
//! when that token is unknown, until `</s>`, a dead end, or the token limit.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    FinishReason, Generation, GenerationOverrides, GenerationParams, HandlerError, Lease,
    ModelHandler, Prompt, StreamEvent, TokenStream, MAX_NEW_TOKENS_LIMIT,
};
use crate::artifact::ModelArtifact;

pub const RUNTIME: &str = "text_generation";
pub const VERSION: &str = "1.0.0";

const BOS: &str = "<s>";
const EOS: &str = "</s>";

#[derive(Debug, Deserialize)]
struct Weights {
    transitions: BTreeMap<String, BTreeMap<String, u32>>,
}

#[derive(Debug, Deserialize)]
struct NgramConfig {
    #[serde(default)]
    defaults: GenerationOverrides,
    #[serde(default = "default_max_new_tokens_limit")]
    max_new_tokens_limit: u32,
}

fn default_max_new_tokens_limit() -> u32 {
    MAX_NEW_TOKENS_LIMIT
}

impl Default for NgramConfig {
    fn default() -> Self {
        Self {
            defaults: GenerationOverrides::default(),
            max_new_tokens_limit: default_max_new_tokens_limit(),
        }
    }
}

/// Candidates per token, most frequent first, ties broken alphabetically.
#[derive(Debug)]
struct TransitionTable {
    next: HashMap<String, Vec<(String, u32)>>,
}

impl TransitionTable {
    fn from_json(bytes: &[u8]) -> Result<Self, HandlerError> {
        let weights: Weights = serde_json::from_slice(bytes)
            .map_err(|e| HandlerError::InvalidWeights(format!("cannot parse weights: {}", e)))?;

        if weights.transitions.is_empty() {
            return Err(HandlerError::InvalidWeights("transition table is empty".into()));
        }

        let mut next = HashMap::with_capacity(weights.transitions.len());
        for (token, followers) in weights.transitions {
            if let Some((bad, _)) = followers.iter().find(|(_, count)| **count == 0) {
                return Err(HandlerError::InvalidWeights(format!(
                    "zero count for transition '{}' -> '{}'",
                    token, bad
                )));
            }
            let mut candidates: Vec<(String, u32)> = followers.into_iter().collect();
            candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            next.insert(token, candidates);
        }

        Ok(Self { next })
    }

    fn candidates(&self, token: &str) -> &[(String, u32)] {
        self.next.get(token).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Token generation starts from.
    fn start_token<'a>(&self, prompt: &'a str) -> Option<&'a str> {
        match prompt.split_whitespace().last() {
            Some(last) if self.next.contains_key(last) => Some(last),
            _ if self.next.contains_key(BOS) => Some(BOS),
            _ => None,
        }
    }

    /// Generate a continuation, calling `emit` for each token.
    ///
    /// Stops early when `emit` returns false or `cancel` fires.
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        params: &GenerationParams,
        cancel: &CancellationToken,
        mut emit: impl FnMut(&str) -> bool,
    ) -> (Vec<&'a str>, FinishReason) {
        let mut rng = StdRng::seed_from_u64(params.seed.unwrap_or_else(rand::random));
        let mut output = Vec::new();

        let Some(mut current) = self.start_token(prompt) else {
            return (output, FinishReason::Stop);
        };

        while output.len() < params.max_new_tokens as usize {
            if cancel.is_cancelled() {
                return (output, FinishReason::Stop);
            }
            let Some(next) = sample(self.candidates(current), params, &mut rng) else {
                return (output, FinishReason::Stop);
            };
            if next == EOS {
                return (output, FinishReason::Stop);
            }
            if !emit(next) {
                return (output, FinishReason::Stop);
            }
            output.push(next);
            current = next;
        }

        (output, FinishReason::Length)
    }
}

/// Pick the next token with temperature, top-k and nucleus filtering.
fn sample<'a>(
    candidates: &'a [(String, u32)],
    params: &GenerationParams,
    rng: &mut StdRng,
) -> Option<&'a str> {
    let first = candidates.first()?;
    if params.temperature <= f32::EPSILON {
        return Some(&first.0);
    }

    let limit = match params.top_k {
        0 => candidates.len(),
        k => candidates.len().min(k as usize),
    };
    let kept = &candidates[..limit];

    // count^(1/T), scaled by the largest count to stay in range
    let max = f64::from(first.1);
    let inv_t = 1.0 / f64::from(params.temperature);
    let weights: Vec<f64> = kept
        .iter()
        .map(|(_, count)| (f64::from(*count) / max).powf(inv_t))
        .collect();
    let total: f64 = weights.iter().sum();

    let mut nucleus = 0;
    let mut cumulative = 0.0;
    for w in &weights {
        nucleus += 1;
        cumulative += w / total;
        if cumulative >= f64::from(params.top_p) {
            break;
        }
    }

    let mass: f64 = weights[..nucleus].iter().sum();
    if mass <= 0.0 || !mass.is_finite() {
        return Some(&first.0);
    }

    let mut draw = rng.gen_range(0.0..mass);
    for (i, w) in weights[..nucleus].iter().enumerate() {
        if draw < *w {
            return Some(&kept[i].0);
        }
        draw -= w;
    }
    Some(&kept[nucleus - 1].0)
}

fn to_generation(prompt: &str, tokens: Vec<&str>, finish_reason: FinishReason) -> Generation {
    let generated_text = if tokens.is_empty() {
        prompt.to_string()
    } else {
        format!("{} {}", prompt.trim_end(), tokens.join(" "))
    };
    Generation {
        generated_text,
        tokens_generated: tokens.len() as u32,
        finish_reason,
    }
}

pub struct NgramGenerator {
    table: Arc<TransitionTable>,
    defaults: GenerationParams,
    max_new_tokens_limit: u32,
}

impl NgramGenerator {
    pub fn from_artifact(artifact: &ModelArtifact) -> Result<Self, HandlerError> {
        let payload = artifact.payload.as_deref().ok_or_else(|| {
            HandlerError::Initialization(format!("{} requires a serializedFile", RUNTIME))
        })?;

        let config: NgramConfig = if artifact.manifest.handler_config.is_null() {
            NgramConfig::default()
        } else {
            serde_json::from_value(artifact.manifest.handler_config.clone())
                .map_err(|e| HandlerError::Initialization(format!("bad handlerConfig: {}", e)))?
        };

        let defaults = GenerationParams::default()
            .with_overrides(&config.defaults)
            .and_then(|params| {
                params.check_limit(config.max_new_tokens_limit)?;
                Ok(params)
            })
            .map_err(|e| HandlerError::Initialization(e.to_string()))?;

        Ok(Self::from_weights(payload, defaults)?
            .with_max_new_tokens_limit(config.max_new_tokens_limit))
    }

    pub fn from_weights(weights: &[u8], defaults: GenerationParams) -> Result<Self, HandlerError> {
        let table = TransitionTable::from_json(weights)?;
        tracing::debug!(tokens = table.next.len(), "Loaded transition table");
        Ok(Self {
            table: Arc::new(table),
            defaults,
            max_new_tokens_limit: MAX_NEW_TOKENS_LIMIT,
        })
    }

    pub fn with_max_new_tokens_limit(mut self, limit: u32) -> Self {
        self.max_new_tokens_limit = limit;
        self
    }
}

#[async_trait]
impl ModelHandler for NgramGenerator {
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
        lease: Lease,
    ) -> Result<Vec<Generation>, HandlerError> {
        let table = Arc::clone(&self.table);

        // the lease moves with the work, so the worker stays taken until it ends
        tokio::task::spawn_blocking(move || {
            let mut outputs = Vec::with_capacity(prompts.len());
            for prompt in &prompts {
                let (tokens, reason) =
                    table.generate(&prompt.text, &prompt.params, lease.token(), |_| true);
                if lease.is_cancelled() {
                    return Err(HandlerError::Runtime("generation cancelled".into()));
                }
                outputs.push(to_generation(&prompt.text, tokens, reason));
            }
            Ok(outputs)
        })
        .await
        .map_err(|e| HandlerError::Runtime(format!("generation task failed: {}", e)))?
    }

    async fn inference_stream(
        &self,
        prompt: Prompt,
        lease: Lease,
    ) -> Result<TokenStream, HandlerError> {
        let table = Arc::clone(&self.table);
        let (tx, rx) = mpsc::channel(32);

        tokio::task::spawn_blocking(move || {
            let (_, reason) = table.generate(&prompt.text, &prompt.params, lease.token(), |token| {
                tx.blocking_send(Ok(StreamEvent::Token(token.to_string())))
                    .is_ok()
            });
            let _ = tx.blocking_send(Ok(StreamEvent::Done(reason)));
            drop(lease);
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
