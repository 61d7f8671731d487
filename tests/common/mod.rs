#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use axum::{routing::post, Json, Router};
use model_server::artifact::{Manifest, ManifestModel, MANIFEST_PATH};
use model_server::config::ModelEntry;
use model_server::handler::{ngram, remote};
use model_server::ServingConfig;
use serde_json::{json, Value};
use tempfile::TempDir;

pub const WEIGHTS: &str = r#"{
    "transitions": {
        "<s>": {"the": 5, "a": 1},
        "the": {"model": 4, "server": 2},
        "a": {"model": 1},
        "model": {"serves": 3, "</s>": 1},
        "server": {"listens": 1},
        "serves": {"requests": 2},
        "requests": {"</s>": 1}
    }
}"#;

fn write_manifest(
    dir: &Path,
    model_name: &str,
    handler: &str,
    serialized_file: Option<&str>,
    handler_config: Value,
) {
    std::fs::create_dir_all(dir.join("MAR-INF")).unwrap();

    let manifest = Manifest {
        created_on: Some("2024-03-01T00:00:00Z".to_string()),
        runtime: Some(handler.to_string()),
        archiver_version: Some("1.0".to_string()),
        model: ManifestModel {
            model_name: model_name.to_string(),
            model_version: "1.0".to_string(),
            handler: handler.to_string(),
            serialized_file: serialized_file.map(str::to_string),
            sha256: None,
        },
        handler_config,
    };

    std::fs::write(
        dir.join(MANIFEST_PATH),
        serde_json::to_vec_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

/// Write an unpacked text generation archive into `store`.
pub fn write_archive(store: &Path, model_name: &str, archive: &str) {
    let dir = store.join(archive);
    write_manifest(
        &dir,
        model_name,
        ngram::RUNTIME,
        Some("weights.json"),
        json!({ "defaults": { "max_new_tokens": 16 } }),
    );
    std::fs::write(dir.join("weights.json"), WEIGHTS).unwrap();
}

/// Write an archive that forwards generation to the Ollama backend at `url`.
pub fn write_remote_archive(store: &Path, model_name: &str, archive: &str, url: &str) {
    write_manifest(
        &store.join(archive),
        model_name,
        remote::RUNTIME,
        None,
        json!({ "backend": "ollama", "url": url, "model": "stand-in" }),
    );
}

/// Serve an Ollama `/api/generate` stand-in on an ephemeral port.
///
/// It answers `echo: <prompt>`, after holding the request for `delay` when
/// the prompt is `slow`.
pub async fn spawn_ollama(delay: Duration) -> String {
    let router = Router::new().route(
        "/api/generate",
        post(move |Json(body): Json<Value>| async move {
            let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
            if prompt == "slow" {
                tokio::time::sleep(delay).await;
            }
            Json(json!({
                "response": format!("echo: {}", prompt),
                "done": true,
                "done_reason": "stop"
            }))
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A loopback address that was free a moment ago.
pub fn free_addr() -> std::net::SocketAddr {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    reserved.local_addr().unwrap()
}

/// A model store holding one archive per `(name, archive)` pair.
pub fn model_store(models: &[(&str, &str)]) -> TempDir {
    let store = tempfile::tempdir().unwrap();
    for (name, archive) in models {
        write_archive(store.path(), name, archive);
    }
    store
}

/// Configuration on ephemeral loopback ports serving `models` from `store`.
pub fn test_config(store: &Path, models: &[(&str, &str)]) -> ServingConfig {
    let models: BTreeMap<String, ModelEntry> = models
        .iter()
        .map(|(name, archive)| (name.to_string(), ModelEntry::Archive(archive.to_string())))
        .collect();

    ServingConfig {
        inference_address: "127.0.0.1:0".to_string(),
        management_address: "127.0.0.1:0".to_string(),
        model_store: store.to_path_buf(),
        default_response_timeout_secs: 10,
        models,
        ..ServingConfig::default()
    }
}
