use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub mod api;
pub mod artifact;
pub mod config;
pub mod deps;
pub mod error;
pub mod handler;
pub mod logging;
pub mod model;
pub mod registry;
pub mod server;

pub use config::ServingConfig;
pub use error::{Result, ServeError};
pub use registry::ModelRegistry;
pub use server::{start, RunningEndpoint};

/// Lifecycle of the serving endpoint. There is no partially serving state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointState {
    /// Loading artifacts; no listener is serving yet
    Starting,
    /// Both interfaces are live
    Serving,
    /// Listeners closed and artifacts released
    Stopped,
}

pub struct Lifecycle {
    tx: watch::Sender<EndpointState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        let (tx, _) = watch::channel(EndpointState::Starting);
        Self { tx }
    }
}

impl Lifecycle {
    pub fn current(&self) -> EndpointState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: EndpointState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "Endpoint state changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<EndpointState> {
        self.tx.subscribe()
    }

    pub fn is_serving(&self) -> bool {
        self.current() == EndpointState::Serving
    }
}

/// State shared by the inference and management routers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServingConfig>,
    pub registry: Arc<ModelRegistry>,
    pub lifecycle: Arc<Lifecycle>,
    /// Cancelled by an administrative shutdown; stops both listeners
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: ServingConfig, registry: ModelRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            lifecycle: Arc::new(Lifecycle::default()),
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    /// Reject work unless the endpoint is serving.
    pub fn ensure_serving(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ServeError::Unavailable("endpoint is shutting down".into()));
        }
        match self.lifecycle.current() {
            EndpointState::Serving => Ok(()),
            other => Err(ServeError::Unavailable(format!("endpoint is {:?}", other))),
        }
    }
}
