//! Request dispatch: from a validated OpenAI body to a running upstream turn.

use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use axum::Json;
use lmarena_bridge_error::BridgeError;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

use crate::openai::{
    self, ChatCompletion, ImageDatum, ImageGenerationRequest, ImageGenerationResponse,
};
use crate::pending::PendingEntry;
use crate::registry::RequestMeta;
use crate::router::{ApiError, BridgeState};
use crate::stream::{self, StreamEvent};
use crate::translate;
use crate::transport::OutboundFrame;

/// The chat-completion entry point: dispatch immediately when a peer is live,
/// park the request when it is not (and auto-retry allows it).
pub async fn chat_completion(state: Arc<BridgeState>, body: Value) -> Result<Response, ApiError> {
    if !state.link.is_connected() {
        if !state.config.enable_auto_retry {
            return Err(BridgeError::NoPeer.into());
        }
        return park_and_wait(state, body).await;
    }
    match handle_single(state.clone(), body.clone()).await {
        Err(BridgeError::NoPeer) if state.config.enable_auto_retry => {
            park_and_wait(state, body).await
        }
        other => other.map_err(ApiError::from),
    }
}

async fn park_and_wait(state: Arc<BridgeState>, body: Value) -> Result<Response, ApiError> {
    let deadline = Duration::from_secs(state.config.retry_timeout_seconds);
    let (respond, rx) = oneshot::channel();
    state
        .pending
        .offer(PendingEntry::Fresh { body, respond }, deadline)
        .await?;
    tracing::info!(
        depth = state.pending.depth(),
        timeout_s = deadline.as_secs(),
        "no agent connected, request parked"
    );
    match timeout(deadline, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(BridgeError::internal("replay worker dropped the request").into()),
        Err(_) => Err(BridgeError::RecoveryTimeout {
            seconds: deadline.as_secs(),
        }
        .into()),
    }
}

struct Dispatched {
    events: mpsc::Receiver<StreamEvent>,
    model: String,
    prompt_tokens: u64,
    stream: bool,
}

/// The shared per-request pipeline: resolve, register, translate, send, and
/// start the stream processor.
async fn dispatch_to_agent(
    state: &Arc<BridgeState>,
    mut body: Value,
) -> Result<Dispatched, BridgeError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_string();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let resolved = state.model_registry.resolve(&model, &state.config)?;

    if state.config.file_bed_enabled {
        translate::upload_inline_images(&mut body, &state.file_bed).await?;
    }

    let prompt_tokens = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| openai::estimate_prompt_tokens(messages))
        .unwrap_or(0);

    let request_id = Uuid::new_v4().to_string();
    let rx = state
        .registry
        .open(
            &request_id,
            RequestMeta {
                model: model.clone(),
                stream,
                openai_body: body.clone(),
                resolved: resolved.clone(),
                created_at: chrono::Utc::now(),
            },
        )
        .await;
    let meta = state
        .registry
        .meta(&request_id)
        .await
        .ok_or_else(|| BridgeError::internal("request metadata vanished on open"))?;

    let payload = match translate::translate(&body, &state.config, &resolved) {
        Ok(payload) => payload,
        Err(err) => {
            state.registry.close(&request_id).await;
            return Err(err);
        }
    };
    let frame = OutboundFrame::Task {
        request_id: request_id.clone(),
        payload: serde_json::to_value(&payload)
            .map_err(|err| BridgeError::internal(format!("payload serialization: {err}")))?,
    };
    if let Err(err) = state.link.send(&frame).await {
        state.registry.close(&request_id).await;
        return Err(err);
    }
    tracing::info!(request_id, model, stream, "request dispatched to the agent");

    let events = stream::spawn_processor(
        state.stream_context.clone(),
        request_id,
        meta,
        rx,
    );
    Ok(Dispatched {
        events,
        model,
        prompt_tokens,
        stream,
    })
}

/// Run one request end to end. Used both by the HTTP handler and by the
/// replay worker for parked requests.
pub async fn handle_single(state: Arc<BridgeState>, body: Value) -> Result<Response, BridgeError> {
    let dispatched = dispatch_to_agent(&state, body).await?;
    if dispatched.stream {
        Ok(stream::sse_response(
            dispatched.events,
            dispatched.model,
            state.config.clone(),
        )
        .into_response())
    } else {
        let completion = stream::collect(
            dispatched.events,
            &dispatched.model,
            &state.config,
            dispatched.prompt_tokens,
        )
        .await?;
        Ok(Json(completion).into_response())
    }
}

async fn run_non_stream(
    state: &Arc<BridgeState>,
    mut body: Value,
) -> Result<ChatCompletion, BridgeError> {
    body["stream"] = Value::Bool(false);
    let dispatched = dispatch_to_agent(state, body).await?;
    stream::collect(
        dispatched.events,
        &dispatched.model,
        &state.config,
        dispatched.prompt_tokens,
    )
    .await
}

/// `POST /v1/images/generations`: the prompt rides the ordinary chat path
/// against an image-classified model, then the rendered markdown images are
/// reshaped into the images API response.
pub async fn image_generation(
    state: Arc<BridgeState>,
    request: ImageGenerationRequest,
) -> Result<ImageGenerationResponse, BridgeError> {
    if !state.link.is_connected() {
        return Err(BridgeError::NoPeer);
    }
    let model = request.model.unwrap_or_else(|| "default".to_string());
    let body = serde_json::json!({
        "model": model,
        "stream": false,
        "messages": [{"role": "user", "content": request.prompt}],
        "n": request.n,
    });
    let completion = run_non_stream(&state, body).await?;
    let content = completion
        .choices
        .first()
        .map(|choice| choice.message.content.as_str())
        .unwrap_or_default();

    let data: Vec<ImageDatum> = openai::extract_markdown_images(content)
        .into_iter()
        .map(|target| {
            if let Some((_, payload)) = target
                .strip_prefix("data:")
                .and_then(|rest| rest.split_once(','))
            {
                ImageDatum {
                    url: None,
                    b64_json: Some(payload.to_string()),
                }
            } else {
                ImageDatum {
                    url: Some(target),
                    b64_json: None,
                }
            }
        })
        .collect();

    if data.is_empty() {
        return Err(BridgeError::Internal {
            message: "the model returned no image".to_string(),
        });
    }
    Ok(ImageGenerationResponse {
        created: openai::now_unix(),
        data,
    })
}
