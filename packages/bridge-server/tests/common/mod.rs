#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::util::ServiceExt;

use lmarena_bridge::config::BridgeConfig;
use lmarena_bridge::models::{EndpointEntry, ModelInfo, ModelKind, ModelRegistry, SessionTuple};
use lmarena_bridge::pending;
use lmarena_bridge::router::{
    build_router, dispatch_agent_frame, handle_peer_loss, spawn_background_tasks, BridgeState,
};

pub struct TestApp {
    pub app: Router,
    pub state: Arc<BridgeState>,
    _data_dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let data_dir = tempfile::tempdir().expect("create temp data dir");
        let registry = ModelRegistry::new(test_models(), test_endpoints());
        let (state, pending_rx) = BridgeState::new(config, registry, data_dir.path());
        spawn_background_tasks(state.clone(), pending_rx);
        let app = build_router(state.clone());
        Self {
            app,
            state,
            _data_dir: data_dir,
        }
    }

    pub async fn connect_agent(&self) -> FakeAgent {
        FakeAgent::connect(&self.state).await
    }

    /// Fire a request through the router, driving it to completion.
    pub async fn request(&self, request: Request<Body>) -> (StatusCode, String) {
        let response = self.app.clone().oneshot(request).await.expect("router call");
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&body).to_string())
    }
}

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        session_id: Some("test-session".to_string()),
        message_id: Some("test-message".to_string()),
        ..BridgeConfig::default()
    }
}

fn test_models() -> HashMap<String, ModelInfo> {
    let mut models = HashMap::new();
    models.insert(
        "m-text".to_string(),
        ModelInfo {
            id: Some("model-text-id".to_string()),
            kind: ModelKind::Text,
        },
    );
    models.insert(
        "m-image".to_string(),
        ModelInfo {
            id: Some("model-image-id".to_string()),
            kind: ModelKind::Image,
        },
    );
    models
}

fn test_endpoints() -> HashMap<String, EndpointEntry> {
    let mut endpoints = HashMap::new();
    endpoints.insert(
        "m-rr".to_string(),
        EndpointEntry::Pool(
            (0..3)
                .map(|n| SessionTuple {
                    session_id: Some(format!("pool-session-{n}")),
                    message_id: Some(format!("pool-message-{n}")),
                    mode: None,
                    battle_target: None,
                    kind: None,
                })
                .collect(),
        ),
    );
    endpoints
}

/// An in-process stand-in for the browser agent: attached straight to the
/// transport slot, no socket required.
pub struct FakeAgent {
    pub outbound: mpsc::Receiver<String>,
    pub generation: u64,
    state: Arc<BridgeState>,
}

impl FakeAgent {
    pub async fn connect(state: &Arc<BridgeState>) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let generation = state.link.attach(tx).await;
        pending::spawn_recovery(state.clone());
        Self {
            outbound: rx,
            generation,
            state: state.clone(),
        }
    }

    /// The next task frame (commands are skipped), as `(request_id, payload)`.
    pub async fn next_task(&mut self) -> (String, Value) {
        let deadline = Duration::from_secs(10);
        loop {
            let text = tokio::time::timeout(deadline, self.outbound.recv())
                .await
                .expect("agent frame within the deadline")
                .expect("agent channel open");
            let message: Value = serde_json::from_str(&text).expect("agent frame is JSON");
            if let Some(request_id) = message.get("request_id").and_then(Value::as_str) {
                return (request_id.to_string(), message["payload"].clone());
            }
        }
    }

    /// The next command frame, e.g. `{"command":"refresh"}`.
    pub async fn next_command(&mut self) -> String {
        let text = tokio::time::timeout(Duration::from_secs(10), self.outbound.recv())
            .await
            .expect("agent frame within the deadline")
            .expect("agent channel open");
        let message: Value = serde_json::from_str(&text).expect("agent frame is JSON");
        message["command"]
            .as_str()
            .expect("frame is a command")
            .to_string()
    }

    pub async fn send(&self, request_id: &str, data: Value) {
        let message = json!({"request_id": request_id, "data": data}).to_string();
        dispatch_agent_frame(&self.state, &message).await;
    }

    pub async fn send_fragment(&self, request_id: &str, fragment: &str) {
        self.send(request_id, Value::String(fragment.to_string()))
            .await;
    }

    pub async fn send_done(&self, request_id: &str) {
        self.send(request_id, Value::String("[DONE]".to_string()))
            .await;
    }

    pub async fn disconnect(&self) {
        if self.state.link.detach(self.generation).await {
            handle_peer_loss(&self.state).await;
        }
    }
}

pub fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("build request")
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build request")
}

/// Wait for the request's processor to finish its terminal bookkeeping.
pub async fn wait_for_cleanup(app: &TestApp) {
    for _ in 0..100 {
        if app.state.registry.is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry still holds entries after the request finished");
}

/// The `data:` payloads of an SSE body, in order.
pub fn sse_data_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|line| line.to_string())
        .collect()
}

/// Concatenated `choices[0].delta.content` across SSE chunks.
pub fn concat_content(lines: &[String]) -> String {
    lines
        .iter()
        .filter(|line| *line != "[DONE]")
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|chunk| {
            chunk["choices"][0]["delta"]["content"]
                .as_str()
                .map(|text| text.to_string())
        })
        .collect()
}
