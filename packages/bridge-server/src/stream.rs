//! The per-request stream processor and its OpenAI projections.
//!
//! A processor task consumes the request's inbound agent frames, runs the wire
//! parser over raw fragments, and emits a flat event stream. Two projections
//! consume those events: an SSE chunk stream for `stream: true` clients and an
//! aggregator for single-object responses. The processor owns terminal
//! bookkeeping: whatever happens, the response channel and metadata are
//! removed together and the request is logged.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::sse::{Event, KeepAlive, Sse};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use futures::Stream;
use lmarena_bridge_error::BridgeError;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::archive::ImageArchive;
use crate::config::{BridgeConfig, ImageReturnMode, ReasoningOutputMode};
use crate::downloads::DownloadPool;
use crate::openai::{
    self, completion, content_chunk, finish_chunk, reasoning_chunk, ChatCompletion,
};
use crate::registry::{AgentFrame, RequestMeta, RequestRegistry};
use crate::request_log::{CompletionRecord, RequestLog};
use crate::transport::{AgentCommand, AgentLink, OutboundFrame};
use crate::wire::{contains_interstitial, RecordParser, UpstreamRecord};

/// One event produced by the processor, in upstream order.
#[derive(Debug)]
pub enum StreamEvent {
    Reasoning(String),
    ReasoningEnd,
    Content(String),
    RetryInfo(Value),
    Finish(String),
    Interstitial,
    Error(BridgeError),
}

/// Shared collaborators the processor needs besides the request itself.
pub struct StreamContext {
    pub config: Arc<BridgeConfig>,
    pub registry: Arc<RequestRegistry>,
    pub link: Arc<AgentLink>,
    pub downloads: Arc<DownloadPool>,
    pub archive: Arc<ImageArchive>,
    pub request_log: Arc<RequestLog>,
}

/// Start the processor for one request. The returned receiver yields events
/// until the request reaches a terminal state; cleanup happens even if the
/// receiver is dropped early (client disconnect).
pub fn spawn_processor(
    ctx: Arc<StreamContext>,
    request_id: String,
    meta: Arc<RequestMeta>,
    rx: mpsc::Receiver<AgentFrame>,
) -> mpsc::Receiver<StreamEvent> {
    let (events_tx, events_rx) = mpsc::channel(64);
    tokio::spawn(async move {
        run_processor(ctx, request_id, meta, rx, events_tx).await;
    });
    events_rx
}

async fn run_processor(
    ctx: Arc<StreamContext>,
    request_id: String,
    meta: Arc<RequestMeta>,
    mut rx: mpsc::Receiver<AgentFrame>,
    events: mpsc::Sender<StreamEvent>,
) {
    let started = Instant::now();
    let read_timeout = Duration::from_secs(ctx.config.stream_response_timeout_seconds);
    let mut parser = RecordParser::new();
    let mut saw_reasoning = false;
    let mut reasoning_ended = false;
    let mut seen_images: HashSet<String> = HashSet::new();
    let mut content_chars: u64 = 0;
    let mut failure: Option<String> = None;

    // Dropped receivers must not stop the drain: the client may be gone while
    // the upstream request is still completing.
    macro_rules! emit {
        ($event:expr) => {
            let _ = events.send($event).await;
        };
    }

    'outer: loop {
        let frame = match timeout(read_timeout, rx.recv()).await {
            Err(_) => {
                tracing::warn!(request_id, timeout_s = read_timeout.as_secs(), "no upstream data before the channel timeout");
                failure = Some(format!("timed out after {}s", read_timeout.as_secs()));
                emit!(StreamEvent::Error(BridgeError::ChannelTimeout {
                    seconds: read_timeout.as_secs(),
                }));
                break;
            }
            Ok(None) => {
                // The registry entry was removed underneath us (sweeper).
                failure = Some("response channel was closed".to_string());
                emit!(StreamEvent::Error(BridgeError::Cancelled));
                break;
            }
            Ok(Some(frame)) => frame,
        };

        match frame {
            AgentFrame::Advisory(info) => {
                tracing::info!(
                    request_id,
                    attempt = info.get("attempt").and_then(serde_json::Value::as_u64),
                    max_attempts = info.get("max_attempts").and_then(serde_json::Value::as_u64),
                    "agent retry advisory"
                );
                emit!(StreamEvent::RetryInfo(info));
            }
            AgentFrame::Error { message, .. } => {
                let text = error_text(&message);
                let error = classify_agent_error(&text);
                if matches!(error, BridgeError::UpstreamInterstitial) {
                    request_refresh(&ctx, &request_id).await;
                    emit!(StreamEvent::Interstitial);
                } else {
                    emit!(StreamEvent::Error(error));
                }
                failure = Some(text);
                break;
            }
            AgentFrame::Done => break,
            AgentFrame::Fragment(raw) => {
                parser.append(&raw);
                if parser.detect_interstitial() {
                    request_refresh(&ctx, &request_id).await;
                    failure = Some("verification page in upstream stream".to_string());
                    emit!(StreamEvent::Interstitial);
                    break;
                }
                for record in parser.drain() {
                    match record {
                        UpstreamRecord::Reasoning(text) => {
                            if reasoning_ended {
                                tracing::warn!(request_id, "reasoning resumed after content");
                            }
                            saw_reasoning = true;
                            emit!(StreamEvent::Reasoning(text));
                        }
                        UpstreamRecord::Text(text) => {
                            if saw_reasoning && !reasoning_ended {
                                reasoning_ended = true;
                                emit!(StreamEvent::ReasoningEnd);
                            }
                            content_chars += text.len() as u64;
                            emit!(StreamEvent::Content(text));
                        }
                        UpstreamRecord::Images(refs) => {
                            for image in refs {
                                if !seen_images.insert(image.url.clone()) {
                                    continue;
                                }
                                let markdown =
                                    render_image(&ctx, &image.url, &request_id).await;
                                content_chars += markdown.len() as u64;
                                emit!(StreamEvent::Content(markdown));
                            }
                        }
                        UpstreamRecord::Finish { reason } => {
                            emit!(StreamEvent::Finish(reason));
                        }
                        UpstreamRecord::ErrorDescriptor(value) => {
                            let text = value
                                .get("error")
                                .map(error_text)
                                .unwrap_or_else(|| value.to_string());
                            failure = Some(text.clone());
                            emit!(StreamEvent::Error(classify_agent_error(&text)));
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    if saw_reasoning && !reasoning_ended {
        emit!(StreamEvent::ReasoningEnd);
    }

    ctx.registry.close(&request_id).await;
    let input_tokens = meta
        .openai_body
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| openai::estimate_prompt_tokens(messages))
        .unwrap_or(0);
    ctx.request_log
        .record(CompletionRecord {
            request_id: request_id.clone(),
            model: meta.model.clone(),
            stream: meta.stream,
            success: failure.is_none(),
            error: failure,
            input_tokens,
            output_tokens: content_chars / 4,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now().to_rfc3339(),
        })
        .await;
    tracing::info!(
        request_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request finished, channel and metadata removed"
    );
}

/// One refresh command per detection, process-wide.
async fn request_refresh(ctx: &StreamContext, request_id: &str) {
    if ctx.link.begin_verifying() {
        tracing::warn!(request_id, "verification page detected, asking the agent to refresh");
        if let Err(err) = ctx
            .link
            .send(&OutboundFrame::command(AgentCommand::Refresh))
            .await
        {
            tracing::warn!(error = %err, "could not deliver the refresh command");
        }
    } else {
        tracing::info!(request_id, "verification already in progress, waiting");
    }
}

fn error_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn classify_agent_error(text: &str) -> BridgeError {
    let lowered = text.to_lowercase();
    if text.contains("413") || lowered.contains("too large") {
        BridgeError::AttachmentTooLarge
    } else if contains_interstitial(text) {
        BridgeError::UpstreamInterstitial
    } else {
        BridgeError::Internal {
            message: text.to_string(),
        }
    }
}

async fn render_image(ctx: &StreamContext, url: &str, request_id: &str) -> String {
    match ctx.config.image_return_format.mode {
        ImageReturnMode::Url => {
            if ctx.config.save_images_locally {
                archive_in_background(ctx, url.to_string(), request_id.to_string());
            }
            format!("![Image]({url})")
        }
        ImageReturnMode::Base64 => match ctx.downloads.fetch_as_data_url(url).await {
            Ok(data_url) => {
                if ctx.config.save_images_locally {
                    if let Some(bytes) = decode_data_url(&data_url) {
                        let archive = ctx.archive.clone();
                        let url = url.to_string();
                        let request_id = request_id.to_string();
                        tokio::spawn(async move {
                            if let Err(err) = archive.save(&bytes, &url, &request_id).await {
                                tracing::warn!(error = %err, "image archive write failed");
                            }
                        });
                    }
                }
                format!("![Image]({data_url})")
            }
            Err(err) => {
                tracing::warn!(url, error = %err, "image download failed, returning the source url");
                format!("![Image]({url})")
            }
        },
    }
}

fn archive_in_background(ctx: &StreamContext, url: String, request_id: String) {
    let downloads = ctx.downloads.clone();
    let archive = ctx.archive.clone();
    tokio::spawn(async move {
        match downloads.fetch(&url).await {
            Ok(bytes) => {
                if let Err(err) = archive.save(&bytes, &url, &request_id).await {
                    tracing::warn!(error = %err, "image archive write failed");
                }
            }
            Err(err) => tracing::warn!(url, error = %err, "background image download failed"),
        }
    });
}

fn decode_data_url(data_url: &str) -> Option<Vec<u8>> {
    let (_, payload) = data_url.split_once(',')?;
    BASE64.decode(payload).ok()
}

/// Project the event stream onto OpenAI SSE chunks.
pub fn sse_response(
    events: mpsc::Receiver<StreamEvent>,
    model: String,
    config: Arc<BridgeConfig>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        emit_sse(events, model, config, tx).await;
    });
    Sse::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn emit_sse(
    mut events: mpsc::Receiver<StreamEvent>,
    model: String,
    config: Arc<BridgeConfig>,
    tx: mpsc::Sender<Event>,
) {
    let response_id = openai::new_response_id();
    let stream_reasoning = config.enable_reasoning
        && config.reasoning_output_mode == ReasoningOutputMode::Openai
        && config.preserve_streaming;
    let mut pending_reasoning: Vec<String> = Vec::new();
    let mut finish_reason = "stop".to_string();

    macro_rules! send_json {
        ($value:expr) => {
            let data = serde_json::to_string(&$value).unwrap_or_default();
            if tx.send(Event::default().data(data)).await.is_err() {
                tracing::debug!("client went away, continuing to drain");
            }
        };
    }

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Reasoning(text) => {
                if stream_reasoning {
                    send_json!(reasoning_chunk(&response_id, &model, text));
                } else {
                    pending_reasoning.push(text);
                }
            }
            StreamEvent::ReasoningEnd => {
                flush_reasoning(&tx, &response_id, &model, &config, &mut pending_reasoning).await;
            }
            StreamEvent::Content(text) => {
                flush_reasoning(&tx, &response_id, &model, &config, &mut pending_reasoning).await;
                send_json!(content_chunk(&response_id, &model, text));
            }
            StreamEvent::RetryInfo(info) => {
                if config.empty_response_retry.show_retry_info_to_client {
                    let note = format!(
                        "\n[retrying] attempt {}/{}\n",
                        info.get("attempt").and_then(Value::as_u64).unwrap_or(0),
                        info.get("max_attempts").and_then(Value::as_u64).unwrap_or(0),
                    );
                    send_json!(content_chunk(&response_id, &model, note));
                }
            }
            StreamEvent::Finish(reason) => finish_reason = reason,
            StreamEvent::Interstitial => {
                send_json!(finish_chunk(&response_id, &model, "content_filter"));
                let _ = tx.send(Event::default().data("[DONE]")).await;
                return;
            }
            StreamEvent::Error(error) => {
                send_json!(error.to_error_body());
                let _ = tx.send(Event::default().data("[DONE]")).await;
                return;
            }
        }
    }

    flush_reasoning(&tx, &response_id, &model, &config, &mut pending_reasoning).await;
    let data = serde_json::to_string(&finish_chunk(&response_id, &model, &finish_reason))
        .unwrap_or_default();
    let _ = tx.send(Event::default().data(data)).await;
    let _ = tx.send(Event::default().data("[DONE]")).await;
}

async fn flush_reasoning(
    tx: &mpsc::Sender<Event>,
    response_id: &str,
    model: &str,
    config: &BridgeConfig,
    pending: &mut Vec<String>,
) {
    if pending.is_empty() || !config.enable_reasoning {
        pending.clear();
        return;
    }
    let joined = pending.join("");
    pending.clear();
    let chunk = match config.reasoning_output_mode {
        ReasoningOutputMode::Openai => reasoning_chunk(response_id, model, joined),
        ReasoningOutputMode::ThinkTag => {
            content_chunk(response_id, model, format!("<think>{joined}</think>\n\n"))
        }
    };
    let data = serde_json::to_string(&chunk).unwrap_or_default();
    let _ = tx.send(Event::default().data(data)).await;
}

/// Aggregate the event stream into a single chat completion.
pub async fn collect(
    mut events: mpsc::Receiver<StreamEvent>,
    model: &str,
    config: &BridgeConfig,
    prompt_tokens: u64,
) -> Result<ChatCompletion, BridgeError> {
    let response_id = openai::new_response_id();
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut finish_reason = "stop".to_string();

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Reasoning(text) => reasoning.push_str(&text),
            StreamEvent::ReasoningEnd => {}
            StreamEvent::Content(text) => content.push_str(&text),
            StreamEvent::RetryInfo(_) => {}
            StreamEvent::Finish(reason) => finish_reason = reason,
            StreamEvent::Interstitial => return Err(BridgeError::UpstreamInterstitial),
            StreamEvent::Error(error) => return Err(error),
        }
    }

    let reasoning_out = if config.enable_reasoning && !reasoning.is_empty() {
        match config.reasoning_output_mode {
            ReasoningOutputMode::Openai => Some(reasoning),
            ReasoningOutputMode::ThinkTag => {
                content = format!("<think>{reasoning}</think>\n\n{content}");
                None
            }
        }
    } else {
        None
    };

    Ok(completion(
        &response_id,
        model,
        content,
        reasoning_out,
        &finish_reason,
        prompt_tokens,
    ))
}
