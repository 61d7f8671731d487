use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::{ModelSpec, ServingConfig};
use crate::error::{Result, ServeError};
use crate::model::LoadedModel;
use crate::registry::ModelRegistry;
use crate::{api, deps, AppState, EndpointState};

/// Start the endpoint: resolve dependencies, load every declared model, then
/// bind both interfaces.
///
/// Nothing is bound unless all required models loaded, and the endpoint only
/// reports `Serving` once both listeners are up.
pub async fn start(config: ServingConfig) -> Result<RunningEndpoint> {
    config.validate()?;
    tracing::info!(state = ?EndpointState::Starting, "Starting model server");

    if let Some(manifest) = &config.dependency_manifest {
        deps::resolve_manifest(manifest)?;
    }

    let models = load_models(&config).await?;
    let registry = ModelRegistry::new(models);

    let inference_listener = bind(config.inference_addr()?).await?;
    let management_listener = bind(config.management_addr()?).await?;
    let inference_addr = inference_listener.local_addr()?;
    let management_addr = management_listener.local_addr()?;

    let state = AppState::new(config, registry);

    let servers = vec![
        serve(
            "inference",
            inference_listener,
            api::inference_router(state.clone()),
            &state,
        ),
        serve(
            "management",
            management_listener,
            api::management_router(state.clone()),
            &state,
        ),
    ];

    state.lifecycle.set(EndpointState::Serving);
    tracing::info!(
        inference = %inference_addr,
        management = %management_addr,
        models = state.registry.len().await,
        "Model server ready"
    );

    Ok(RunningEndpoint {
        state,
        inference_addr,
        management_addr,
        servers,
    })
}

/// Load all declared models concurrently on the blocking pool.
async fn load_models(config: &ServingConfig) -> Result<Vec<LoadedModel>> {
    let specs = config.model_specs();
    if specs.is_empty() {
        tracing::warn!("No models declared; serving an empty registry");
    }

    let tasks: Vec<(ModelSpec, JoinHandle<Result<LoadedModel>>)> = specs
        .into_iter()
        .map(|spec| {
            let store = config.model_store.clone();
            let task_spec = spec.clone();
            let handle = tokio::task::spawn_blocking(move || LoadedModel::load(&store, &task_spec));
            (spec, handle)
        })
        .collect();

    let mut loaded = Vec::with_capacity(tasks.len());
    let mut first_error = None;

    for (spec, handle) in tasks {
        let result = handle.await.unwrap_or_else(|e| {
            Err(ServeError::ArtifactLoad {
                model: spec.name.clone(),
                reason: format!("loader task failed: {}", e),
            })
        });

        match result {
            Ok(model) => loaded.push(model),
            Err(e) if !spec.required => {
                tracing::warn!(model = %spec.name, error = %e, "Skipping optional model");
            }
            Err(e) => {
                tracing::error!(model = %spec.name, error = %e, "Required model failed to load");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(loaded),
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| {
        tracing::error!(address = %addr, error = %source, "Failed to bind");
        ServeError::Bind {
            addr: addr.to_string(),
            source,
        }
    })
}

fn serve(
    name: &'static str,
    listener: TcpListener,
    router: axum::Router,
    state: &AppState,
) -> JoinHandle<std::io::Result<()>> {
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await;
        if let Err(e) = &result {
            tracing::error!(interface = name, error = %e, "Server failed");
        }
        // one interface going down takes the other with it
        shutdown.cancel();
        tracing::info!(interface = name, "Listener closed");
        result
    })
}

/// Handle to a serving endpoint.
pub struct RunningEndpoint {
    state: AppState,
    inference_addr: SocketAddr,
    management_addr: SocketAddr,
    servers: Vec<JoinHandle<std::io::Result<()>>>,
}

impl RunningEndpoint {
    pub fn inference_addr(&self) -> SocketAddr {
        self.inference_addr
    }

    pub fn management_addr(&self) -> SocketAddr {
        self.management_addr
    }

    pub fn state(&self) -> EndpointState {
        self.state.lifecycle.current()
    }

    pub fn app_state(&self) -> &AppState {
        &self.state
    }

    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::clone(&self.state.registry)
    }

    /// Ask both interfaces to stop accepting connections.
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
    }

    /// Wait for both listeners to close, then release every model.
    pub async fn wait(self) -> Result<()> {
        let mut failure = None;
        for handle in self.servers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failure.get_or_insert(ServeError::Io(e));
                }
                Err(e) => {
                    failure.get_or_insert(ServeError::Io(std::io::Error::other(e)));
                }
            }
        }

        let released = self.state.registry.clear().await;
        self.state.lifecycle.set(EndpointState::Stopped);
        tracing::info!(released, "Model server stopped");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        self.wait().await
    }
}
