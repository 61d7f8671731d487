use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::artifact::ModelArtifact;
use crate::config::ModelSpec;
use crate::error::{Result, ServeError};
use crate::handler::{self, Generation, HandlerError, Lease, ModelHandler, TokenStream};

/// Request counters for one model
#[derive(Debug, Default)]
pub struct ModelStats {
    pub requests: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
    /// Requests that got past input parsing; latency is averaged over these
    pub handled: AtomicU64,
    pub total_latency_us: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub avg_latency_ms: f64,
}

impl ModelStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let handled = self.handled.load(Ordering::Relaxed);
        let total_us = self.total_latency_us.load(Ordering::Relaxed);
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_latency_ms: if handled == 0 {
                0.0
            } else {
                total_us as f64 / handled as f64 / 1000.0
            },
        }
    }
}

/// Public description of a loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub model_version: String,
    pub archive: String,
    pub handler: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub workers: usize,
    pub available_workers: usize,
    pub timeout_secs: u64,
    pub loaded_at: DateTime<Utc>,
    pub stats: StatsSnapshot,
}

/// A model archive with its initialized handler and worker pool.
///
/// The artifact and handler are never mutated after load; requests only
/// borrow them.
pub struct LoadedModel {
    artifact: ModelArtifact,
    handler: Arc<dyn ModelHandler>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    timeout: Duration,
    loaded_at: DateTime<Utc>,
    stats: ModelStats,
}

impl LoadedModel {
    /// Read an archive from the store and initialize its handler.
    pub fn load(model_store: &Path, spec: &ModelSpec) -> Result<Self> {
        let artifact = ModelArtifact::load(model_store, &spec.name, &spec.archive)?;
        let handler = handler::initialize(&artifact).map_err(|e| ServeError::ArtifactLoad {
            model: spec.name.clone(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            model = %spec.name,
            archive = %spec.archive,
            handler = handler.runtime(),
            workers = spec.workers,
            timeout_secs = spec.timeout.as_secs(),
            "Model loaded"
        );

        Ok(Self::new(artifact, handler, spec.workers, spec.timeout))
    }

    pub fn new(
        artifact: ModelArtifact,
        handler: Arc<dyn ModelHandler>,
        workers: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            artifact,
            handler,
            workers: Arc::new(Semaphore::new(workers)),
            worker_count: workers,
            timeout,
            loaded_at: Utc::now(),
            stats: ModelStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.artifact.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            model_name: self.artifact.name.clone(),
            model_version: self.artifact.version().to_string(),
            archive: self.artifact.archive.clone(),
            handler: self.artifact.handler().to_string(),
            size_bytes: self.artifact.size_bytes(),
            sha256: self.artifact.checksum.clone(),
            workers: self.worker_count,
            available_workers: self.workers.available_permits(),
            timeout_secs: self.timeout.as_secs(),
            loaded_at: self.loaded_at,
            stats: self.stats.snapshot(),
        }
    }

    /// Run a request body through the handler.
    ///
    /// The timeout covers waiting for a worker as well as the handler itself.
    /// Once the request times out or is dropped, the handler is told to stop,
    /// and the worker stays taken until it has.
    pub async fn predict(&self, body: &[u8]) -> Result<Vec<Generation>> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let prompts = self
            .handler
            .preprocess(body)
            .map_err(|source| self.failed(self.inference_error(source)))?;

        self.stats.handled.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let work = async {
            let permit = self.acquire_worker().await?;
            let outputs = self
                .handler
                .inference(prompts, Lease::new(permit, cancel.clone()))
                .await
                .map_err(|source| self.inference_error(source))?;
            Ok(self.handler.postprocess(outputs))
        };

        let result = match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        };

        self.stats
            .total_latency_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        result.map_err(|e| self.failed(e))
    }

    /// Start streaming the continuation of the first prompt in `body`.
    ///
    /// The stream owns the worker until the handler has finished producing it.
    pub async fn predict_stream(&self, body: &[u8]) -> Result<TokenStream> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let prompt = self
            .handler
            .preprocess(body)
            .map_err(|source| self.inference_error(source))
            .and_then(|prompts| {
                prompts
                    .into_iter()
                    .next()
                    .ok_or_else(|| ServeError::BadRequest("no prompt to stream".into()))
            })
            .map_err(|e| self.failed(e))?;

        let work = async {
            let permit = self.acquire_worker().await?;
            self.handler
                .inference_stream(prompt, Lease::new(permit, CancellationToken::new()))
                .await
                .map_err(|source| self.inference_error(source))
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result.map_err(|e| self.failed(e)),
            Err(_) => Err(self.failed(self.timeout_error())),
        }
    }

    fn inference_error(&self, source: HandlerError) -> ServeError {
        ServeError::Inference {
            model: self.name().to_string(),
            source,
        }
    }

    /// Count a failed request.
    fn failed(&self, err: ServeError) -> ServeError {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        if matches!(err, ServeError::InferenceTimeout { .. }) {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        err
    }

    pub fn timeout_error(&self) -> ServeError {
        ServeError::InferenceTimeout {
            model: self.name().to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    async fn acquire_worker(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| ServeError::Unavailable(format!("model '{}' is unloading", self.name())))
    }

    /// Refuse new work; requests already holding a worker finish normally.
    pub fn close(&self) {
        self.workers.close();
    }
}
