//! Shared helpers: free ports, a gateway on a background task, and a fake NLU runtime.

#![allow(dead_code)]

use axum::{extract::State, routing::post, Json, Router};
use lib::config::Config;
use lib::gateway;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

pub fn temp_config_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("botrelay-gateway-test-{}", uuid::Uuid::new_v4()))
        .join("config.json")
}

/// Loopback config on a free port with an in-memory store.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.gateway.port = free_port();
    config.gateway.bind = "127.0.0.1".to_string();
    config
}

/// Spawn the gateway and wait until `GET /` answers.
pub async fn start_gateway(config: Config) -> String {
    let base = format!("http://127.0.0.1:{}", config.gateway.port);
    let config_path = temp_config_path();
    tokio::spawn(async move {
        if let Err(e) = gateway::run_gateway(config, config_path).await {
            eprintln!("gateway exited: {:#}", e);
        }
    });

    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(resp) = client.get(format!("{}/", base)).send().await {
            if resp.status().is_success() {
                return base;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway at {} did not come up within 5s", base);
}

/// Requests seen by the fake NLU runtime as (sender, message).
pub type Seen = Arc<Mutex<Vec<(String, String)>>>;

/// Fake NLU runtime answering `[{"text": "echo: <message>"}, {"text": ""}]`.
pub async fn start_fake_nlu() -> (String, Seen) {
    async fn webhook(
        State(seen): State<Seen>,
        Json(body): Json<serde_json::Value>,
    ) -> Json<serde_json::Value> {
        let sender = body["sender"].as_str().unwrap_or_default().to_string();
        let message = body["message"].as_str().unwrap_or_default().to_string();
        seen.lock().unwrap().push((sender, message.clone()));
        Json(json!([{ "text": format!("echo: {}", message) }, { "text": "" }]))
    }

    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/webhooks/rest/webhook", post(webhook))
        .with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake nlu");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}", addr), seen)
}
