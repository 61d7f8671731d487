mod common;

use std::time::{Duration, Instant};

use futures::future::join_all;
use model_server::config::{ModelEntry, ModelSettings};
use model_server::{EndpointState, ServeError, ServingConfig};
use serde_json::{json, Value};

use common::{free_addr, model_store, spawn_ollama, test_config, write_remote_archive};

const LLAMA: (&str, &str) = ("llama2-7b-chat", "llama2-7b-chat.mar");

#[tokio::test]
async fn test_serves_llama_archive() {
    let store = model_store(&[LLAMA]);
    let endpoint = model_server::start(test_config(store.path(), &[LLAMA]))
        .await
        .unwrap();
    assert_eq!(endpoint.state(), EndpointState::Serving);

    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{}/health", endpoint.management_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health["state"], "Serving");
    assert_eq!(health["models_loaded"], 1);

    let ping = client
        .get(format!("http://{}/ping", endpoint.inference_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(ping.status(), 200);

    let response = client
        .post(format!(
            "http://{}/predictions/llama2-7b-chat",
            endpoint.inference_addr()
        ))
        .json(&json!({ "text": "Describe the" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["model_name"], "llama2-7b-chat");
    let text = body["predictions"][0]["generated_text"].as_str().unwrap();
    assert!(text.starts_with("Describe the"));
    assert!(text.len() > "Describe the".len());

    endpoint.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_artifact_fails_startup() {
    let store = model_store(&[]);
    let inference = free_addr();
    let mut config = test_config(store.path(), &[LLAMA]);
    config.inference_address = inference.to_string();

    let err = model_server::start(config).await.err().unwrap();
    assert!(matches!(err, ServeError::ArtifactNotFound { ref model, .. } if model == "llama2-7b-chat"));

    // nothing was left listening
    std::net::TcpListener::bind(inference).unwrap();
}

#[tokio::test]
async fn test_bind_failure_releases_ports() {
    let store = model_store(&[LLAMA]);
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let inference = free_addr();

    let mut config = test_config(store.path(), &[LLAMA]);
    config.inference_address = inference.to_string();
    config.management_address = occupied.local_addr().unwrap().to_string();

    let err = model_server::start(config).await.err().unwrap();
    assert!(matches!(err, ServeError::Bind { .. }));

    std::net::TcpListener::bind(inference).unwrap();
}

#[tokio::test]
async fn test_unknown_model_keeps_serving() {
    let store = model_store(&[LLAMA]);
    let endpoint = model_server::start(test_config(store.path(), &[LLAMA]))
        .await
        .unwrap();
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/predictions/gpt-2", endpoint.inference_addr()))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "ModelNotFoundError");
    assert_eq!(endpoint.state(), EndpointState::Serving);

    let response = client
        .post(format!(
            "http://{}/predictions/llama2-7b-chat",
            endpoint.inference_addr()
        ))
        .body("")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(endpoint.state(), EndpointState::Serving);

    endpoint.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_are_paired() {
    let store = model_store(&[LLAMA]);
    let endpoint = model_server::start(test_config(store.path(), &[LLAMA]))
        .await
        .unwrap();
    let client = reqwest::Client::new();
    let url = format!(
        "http://{}/predictions/llama2-7b-chat",
        endpoint.inference_addr()
    );

    let requests = (0..50).map(|i| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let prompt = format!("request-{} the", i);
            let body: Value = client
                .post(&url)
                .json(&json!({ "text": &prompt, "parameters": { "temperature": 0.0 } }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            (prompt, body)
        }
    });

    for (prompt, body) in join_all(requests).await {
        assert_eq!(
            body["predictions"][0]["generated_text"],
            format!("{} model serves requests", prompt)
        );
        assert_eq!(body["predictions"][0]["finish_reason"], "stop");
    }

    endpoint.stop().await.unwrap();
}

/// Serve one remote model backed by an Ollama stand-in.
fn proxy_config(store: &std::path::Path, workers: usize, timeout_secs: u64) -> ServingConfig {
    let mut config = test_config(store, &[]);
    config.models.insert(
        "proxy".to_string(),
        ModelEntry::Detailed(ModelSettings {
            archive: "proxy.mar".to_string(),
            workers: Some(workers),
            timeout_secs: Some(timeout_secs),
            required: true,
        }),
    );
    config
}

#[tokio::test]
async fn test_timeout_then_next_request_succeeds() {
    let backend = spawn_ollama(Duration::from_secs(3)).await;
    let store = model_store(&[]);
    write_remote_archive(store.path(), "proxy", "proxy.mar", &backend);

    let endpoint = model_server::start(proxy_config(store.path(), 1, 1))
        .await
        .unwrap();
    let client = reqwest::Client::new();
    let url = format!("http://{}/predictions/proxy", endpoint.inference_addr());

    let response = client
        .post(&url)
        .json(&json!({ "text": "slow" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["type"], "InferenceTimeoutError");

    let response = client
        .post(&url)
        .json(&json!({ "text": "fast" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["predictions"][0]["generated_text"], "fast echo: fast");
    assert_eq!(endpoint.state(), EndpointState::Serving);

    endpoint.stop().await.unwrap();
}

#[tokio::test]
async fn test_management_answers_while_workers_are_busy() {
    let backend = spawn_ollama(Duration::from_secs(5)).await;
    let store = model_store(&[]);
    write_remote_archive(store.path(), "proxy", "proxy.mar", &backend);

    let endpoint = model_server::start(proxy_config(store.path(), 2, 30))
        .await
        .unwrap();
    let client = reqwest::Client::new();
    let url = format!("http://{}/predictions/proxy", endpoint.inference_addr());

    let busy: Vec<_> = (0..2)
        .map(|_| {
            let request = client.post(&url).json(&json!({ "text": "slow" }));
            tokio::spawn(async move { request.send().await })
        })
        .collect();

    let model = endpoint.registry().get("proxy").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while model.info().available_workers > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let management = endpoint.management_addr();
    for path in ["/health", "/models", "/models/proxy"] {
        let started = Instant::now();
        let response = client
            .get(format!("http://{}{}", management, path))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200, "{}", path);
        assert!(started.elapsed() < Duration::from_millis(500), "{}", path);
    }

    for request in busy {
        request.abort();
    }
    endpoint.stop().await.unwrap();
}

#[tokio::test]
async fn test_seeded_requests_are_reproducible() {
    let store = model_store(&[LLAMA]);
    let endpoint = model_server::start(test_config(store.path(), &[LLAMA]))
        .await
        .unwrap();
    let client = reqwest::Client::new();
    let url = format!(
        "http://{}/predictions/llama2-7b-chat",
        endpoint.inference_addr()
    );
    let request = json!({ "text": "a", "parameters": { "temperature": 1.2, "seed": 42 } });

    let mut outputs = Vec::new();
    for _ in 0..3 {
        let body: Value = client
            .post(&url)
            .json(&request)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        outputs.push(body["predictions"][0]["generated_text"].clone());
    }
    assert!(outputs.windows(2).all(|w| w[0] == w[1]));

    endpoint.stop().await.unwrap();
}

#[tokio::test]
async fn test_stream_predictions() {
    let store = model_store(&[LLAMA]);
    let endpoint = model_server::start(test_config(store.path(), &[LLAMA]))
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .post(format!(
            "http://{}/predictions/llama2-7b-chat/stream",
            endpoint.inference_addr()
        ))
        .json(&json!({ "text": "the", "parameters": { "temperature": 0.0 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body = response.text().await.unwrap();
    assert_eq!(body.matches("event: token").count(), 3);
    assert!(body.contains("event: done"));
    assert!(body.contains(r#""finish_reason":"stop""#));

    endpoint.stop().await.unwrap();
}

#[tokio::test]
async fn test_register_and_unregister() {
    let store = model_store(&[LLAMA, ("tiny", "tiny.mar")]);
    let endpoint = model_server::start(test_config(store.path(), &[LLAMA]))
        .await
        .unwrap();
    let client = reqwest::Client::new();
    let management = endpoint.management_addr();

    let response = client
        .post(format!("http://{}/models", management))
        .json(&json!({ "model_name": "tiny", "workers": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["model"]["workers"], 2);

    let models: Value = client
        .get(format!("http://{}/models", management))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = models["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["model_name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["llama2-7b-chat", "tiny"]);

    let response = client
        .post(format!("http://{}/predictions/tiny", endpoint.inference_addr()))
        .body("server")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .delete(format!("http://{}/models/tiny", management))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("http://{}/predictions/tiny", endpoint.inference_addr()))
        .body("server")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    endpoint.stop().await.unwrap();
}

#[tokio::test]
async fn test_management_shutdown() {
    let store = model_store(&[LLAMA]);
    let endpoint = model_server::start(test_config(store.path(), &[LLAMA]))
        .await
        .unwrap();
    let state = endpoint.app_state().clone();

    let response = reqwest::Client::new()
        .post(format!("http://{}/shutdown", endpoint.management_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    tokio::time::timeout(Duration::from_secs(10), endpoint.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.lifecycle.current(), EndpointState::Stopped);
    assert!(state.registry.is_empty().await);
}

#[tokio::test]
async fn test_unsatisfied_dependency_fails_startup() {
    let store = model_store(&[LLAMA]);
    let manifest = store.path().join("requirements.txt");
    std::fs::write(&manifest, "# runtimes\ntext_generation>=9.0\n").unwrap();

    let mut config = test_config(store.path(), &[LLAMA]);
    config.dependency_manifest = Some(manifest);

    let err = model_server::start(config).await.err().unwrap();
    assert!(matches!(err, ServeError::DependencyResolution(_)));
}

#[tokio::test]
async fn test_optional_model_failure_is_skipped() {
    let store = model_store(&[LLAMA]);
    let mut config = test_config(store.path(), &[LLAMA]);
    config.models.insert(
        "ghost".to_string(),
        ModelEntry::Detailed(ModelSettings {
            archive: "ghost.mar".to_string(),
            workers: None,
            timeout_secs: None,
            required: false,
        }),
    );

    let endpoint = model_server::start(config).await.unwrap();
    let registry = endpoint.registry();
    assert_eq!(registry.len().await, 1);
    assert!(!registry.contains("ghost").await);

    endpoint.stop().await.unwrap();
}
