//! HTTP surface: the OpenAI-compatible API, the agent websocket, and the
//! internal utility endpoints.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use lmarena_bridge_error::{BridgeError, ErrorBody, ErrorDetail, ErrorKind};
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::archive::ImageArchive;
use crate::config::BridgeConfig;
use crate::dispatch;
use crate::downloads::{self, DownloadPool};
use crate::filebed::FileBed;
use crate::models::ModelRegistry;
use crate::openai::{self, ImageGenerationRequest, ImageGenerationResponse, ModelEntry, ModelList};
use crate::pending::{self, PendingEntry, PendingQueue};
use crate::registry::{self, RequestRegistry};
use crate::request_log::RequestLog;
use crate::stream::StreamContext;
use crate::transport::{self, AgentCommand, AgentLink, OutboundFrame};

pub struct BridgeState {
    pub config: Arc<BridgeConfig>,
    pub model_registry: ModelRegistry,
    pub registry: Arc<RequestRegistry>,
    pub link: Arc<AgentLink>,
    pub pending: PendingQueue,
    pub downloads: Arc<DownloadPool>,
    pub archive: Arc<ImageArchive>,
    pub file_bed: FileBed,
    pub request_log: Arc<RequestLog>,
    pub stream_context: Arc<StreamContext>,
}

impl BridgeState {
    /// Build the shared state. The returned receiver feeds the pending-queue
    /// worker; hand it to [`spawn_background_tasks`].
    pub fn new(
        config: BridgeConfig,
        model_registry: ModelRegistry,
        data_dir: &Path,
    ) -> (Arc<Self>, mpsc::Receiver<PendingEntry>) {
        let config = Arc::new(config);
        let registry = Arc::new(RequestRegistry::new());
        let link = Arc::new(AgentLink::new());
        let downloads = Arc::new(DownloadPool::new(&config));
        let archive = Arc::new(ImageArchive::new(
            data_dir.join("downloaded_images"),
            config.local_save_format.clone(),
        ));
        let request_log = Arc::new(RequestLog::new(data_dir.join("logs")));
        let file_bed = FileBed::new(&config);
        let (pending, pending_rx) = PendingQueue::new();

        let stream_context = Arc::new(StreamContext {
            config: config.clone(),
            registry: registry.clone(),
            link: link.clone(),
            downloads: downloads.clone(),
            archive: archive.clone(),
            request_log: request_log.clone(),
        });

        let state = Arc::new(Self {
            config,
            model_registry,
            registry,
            link,
            pending,
            downloads,
            archive,
            file_bed,
            request_log,
            stream_context,
        });
        (state, pending_rx)
    }
}

/// The long-lived tasks behind the server: the pending-queue worker, the
/// metadata sweeper, and the image-cache sweeper.
pub fn spawn_background_tasks(state: Arc<BridgeState>, pending_rx: mpsc::Receiver<PendingEntry>) {
    tokio::spawn(pending::run_worker(state.clone(), pending_rx));
    registry::spawn_sweeper(state.registry.clone(), state.config.metadata_timeout_minutes);
    downloads::spawn_cache_sweeper(state.downloads.clone());
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub BridgeError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_error_body())).into_response()
    }
}

pub fn build_router(state: Arc<BridgeState>) -> Router {
    let mut v1 = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/models", get(get_models))
        .route("/images/generations", post(images_generations))
        .with_state(state.clone());
    if state.config.api_key.is_some() {
        v1 = v1.layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));
    }

    let internal = Router::new()
        .route("/start_id_capture", post(start_id_capture))
        .route("/request_model_update", post(request_model_update))
        .with_state(state.clone());

    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/ws", get(agent_ws))
        .nest("/v1", v1)
        .nest("/internal", internal)
        .fallback(not_found)
        .with_state(state);

    let http_logging = match std::env::var("LMARENA_BRIDGE_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_response(|res: &Response, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }
    router
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_root,
        get_health,
        get_models,
        chat_completions,
        images_generations,
        start_id_capture,
        request_model_update
    ),
    components(schemas(
        HealthResponse,
        ModelList,
        ModelEntry,
        ImageGenerationRequest,
        ImageGenerationResponse,
        ErrorBody,
        ErrorDetail,
        ErrorKind
    )),
    tags(
        (name = "openai", description = "OpenAI-compatible API"),
        (name = "agent", description = "Browser agent channel"),
        (name = "meta", description = "Service metadata")
    )
)]
pub struct ApiDoc;

async fn require_api_key(
    State(state): State<Arc<BridgeState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = match &state.config.api_key {
        Some(key) => key.as_str(),
        None => return Ok(next.run(req).await),
    };
    match bearer_token(req.headers()) {
        Some(provided) if provided == expected => Ok(next.run(req).await),
        Some(_) => Err(BridgeError::AuthFailed {
            message: Some("the provided API key is not valid".to_string()),
        }
        .into()),
        None => Err(BridgeError::AuthFailed {
            message: Some(
                "provide the API key as 'Authorization: Bearer <key>'".to_string(),
            ),
        }
        .into()),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, rest) = value.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| rest.trim().to_string())
}

#[utoipa::path(get, path = "/", responses((status = 200)), tag = "meta")]
async fn get_root() -> Json<Value> {
    Json(json!({
        "service": "lmarena-bridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Serialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub peer_connected: bool,
    pub verifying: bool,
    pub in_flight: usize,
    pub pending: usize,
}

#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)), tag = "meta")]
async fn get_health(State(state): State<Arc<BridgeState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        peer_connected: state.link.is_connected(),
        verifying: state.link.is_verifying(),
        in_flight: state.registry.len().await,
        pending: state.pending.depth(),
    })
}

#[utoipa::path(
    get,
    path = "/v1/models",
    responses((status = 200, body = ModelList)),
    tag = "openai"
)]
async fn get_models(State(state): State<Arc<BridgeState>>) -> Json<ModelList> {
    let created = openai::now_unix();
    let data = state
        .model_registry
        .model_names()
        .into_iter()
        .map(|id| ModelEntry {
            id,
            object: "model",
            created,
            owned_by: "lmarena-bridge",
        })
        .collect();
    Json(ModelList {
        object: "list",
        data,
    })
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    responses(
        (status = 200, description = "Chat completion or SSE stream"),
        (status = 400, body = ErrorBody),
        (status = 503, body = ErrorBody),
        (status = 504, body = ErrorBody)
    ),
    tag = "openai"
)]
async fn chat_completions(
    State(state): State<Arc<BridgeState>>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    dispatch::chat_completion(state, body).await
}

#[utoipa::path(
    post,
    path = "/v1/images/generations",
    request_body = ImageGenerationRequest,
    responses(
        (status = 200, body = ImageGenerationResponse),
        (status = 503, body = ErrorBody)
    ),
    tag = "openai"
)]
async fn images_generations(
    State(state): State<Arc<BridgeState>>,
    Json(request): Json<ImageGenerationRequest>,
) -> Result<Json<ImageGenerationResponse>, ApiError> {
    let response = dispatch::image_generation(state, request).await?;
    Ok(Json(response))
}

#[utoipa::path(post, path = "/internal/start_id_capture", responses((status = 200), (status = 503, body = ErrorBody)), tag = "agent")]
async fn start_id_capture(State(state): State<Arc<BridgeState>>) -> Result<Json<Value>, ApiError> {
    state
        .link
        .send(&OutboundFrame::command(AgentCommand::ActivateIdCapture))
        .await?;
    Ok(Json(json!({"status": "ok"})))
}

#[utoipa::path(post, path = "/internal/request_model_update", responses((status = 200), (status = 503, body = ErrorBody)), tag = "agent")]
async fn request_model_update(
    State(state): State<Arc<BridgeState>>,
) -> Result<Json<Value>, ApiError> {
    state
        .link
        .send(&OutboundFrame::command(AgentCommand::SendPageSource))
        .await?;
    Ok(Json(json!({"status": "ok"})))
}

async fn not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "not found".to_string())
}

async fn agent_ws(
    State(state): State<Arc<BridgeState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_agent_session(state, socket))
}

/// Owns one peer connection: a writer task drains the serialized outbound
/// queue, the read loop demultiplexes data frames into per-request channels.
pub async fn run_agent_session(state: Arc<BridgeState>, socket: WebSocket) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
    let generation = state.link.attach(outbound_tx).await;
    pending::spawn_recovery(state.clone());

    let (mut sink, mut inbound) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Text(text)) => dispatch_agent_frame(&state, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "agent socket error");
                break;
            }
        }
    }

    writer.abort();
    if state.link.detach(generation).await {
        handle_peer_loss(&state).await;
    }
}

/// Route one agent message into the matching response channel.
pub async fn dispatch_agent_frame(state: &BridgeState, text: &str) {
    if let Some((request_id, frame)) = transport::parse_inbound(text) {
        if !state.registry.deliver(&request_id, frame).await {
            tracing::warn!(request_id, "dropping frame for an unknown or closed request");
        }
    }
}

/// Without auto-retry, in-flight requests cannot outlive their peer.
pub async fn handle_peer_loss(state: &BridgeState) {
    let open = state.registry.len().await;
    tracing::warn!(in_flight = open, "agent disconnected");
    if state.config.enable_auto_retry {
        return;
    }
    for (request_id, _) in state.registry.snapshot().await {
        pending::drain_with_error(state, &request_id, &BridgeError::NoPeer).await;
    }
}
