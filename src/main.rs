use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use model_server::config::{parse_model_arg, ModelEntry};
use model_server::logging::{bootstrap_subscriber, init_logging};
use model_server::{Result, ServingConfig};

/// Serve packaged models over separate inference and management ports
#[derive(Parser, Debug)]
#[command(name = "model-server")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/config.toml")]
    config: PathBuf,

    /// Override the model store directory
    #[arg(long)]
    model_store: Option<PathBuf>,

    /// Models to load as NAME=ARCHIVE (or NAME for NAME.mar); replaces the configured models
    #[arg(long, value_name = "NAME=ARCHIVE", num_args = 1..)]
    models: Vec<String>,

    /// Override the inference port
    #[arg(long)]
    inference_port: Option<u16>,

    /// Override the management port
    #[arg(long)]
    management_port: Option<u16>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Write a default configuration to --config and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, kind = e.kind(), "Model server failed");
            eprintln!("model-server: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.generate_config {
        ServingConfig::default().save(&cli.config)?;
        println!("Generated default configuration at: {}", cli.config.display());
        return Ok(());
    }

    // records from config loading go to a console subscriber until the
    // configured one is installed
    let config = tracing::subscriber::with_default(
        bootstrap_subscriber(cli.log_level.as_deref()),
        || load_config(&cli),
    )?;
    init_logging(&config.logging)?;

    let endpoint = model_server::start(config).await?;

    tracing::info!("Inference API on http://{}", endpoint.inference_addr());
    tracing::info!("  - GET  /ping                            - Liveness");
    tracing::info!("  - POST /predictions/{{model}}            - Run inference");
    tracing::info!("  - POST /predictions/{{model}}/stream     - Streaming inference (SSE)");
    tracing::info!("Management API on http://{}", endpoint.management_addr());
    tracing::info!("  - GET    /health                       - Endpoint health");
    tracing::info!("  - GET    /models                       - List models");
    tracing::info!("  - GET    /models/{{model}}               - Describe a model");
    tracing::info!("  - POST   /models                       - Register a model");
    tracing::info!("  - DELETE /models/{{model}}               - Unregister a model");
    tracing::info!("  - POST   /shutdown                     - Stop the server");

    let shutdown = endpoint.app_state().shutdown.clone();
    tokio::spawn(shutdown_on_signal(shutdown));

    endpoint.wait().await
}

fn load_config(cli: &Cli) -> Result<ServingConfig> {
    let mut config = ServingConfig::load(&cli.config)?;

    if let Some(store) = &cli.model_store {
        config.model_store = store.clone();
    }

    if !cli.models.is_empty() {
        config.models.clear();
        for arg in &cli.models {
            let (name, archive) = parse_model_arg(arg)?;
            config.models.insert(name, ModelEntry::Archive(archive));
        }
    }

    if let Some(port) = cli.inference_port {
        let mut addr = config.inference_addr()?;
        addr.set_port(port);
        config.inference_address = addr.to_string();
    }

    if let Some(port) = cli.management_port {
        let mut addr = config.management_addr()?;
        addr.set_port(port);
        config.management_address = addr.to_string();
    }

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Cancel the endpoint on Ctrl+C or SIGTERM.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => return,
    }

    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
