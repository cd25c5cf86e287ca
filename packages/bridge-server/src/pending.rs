//! Pending queue and disconnect recovery.
//!
//! Requests that arrive with no live peer are parked here; in-flight requests
//! whose peer dropped are re-offered here on reconnect. A single worker task
//! consumes the queue, which breaks the producer/consumer cycle the reconnect
//! path would otherwise create: every put carries a deadline, and the producer
//! falls through (draining the channel with an error) when the put times out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use lmarena_bridge_error::BridgeError;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::registry::AgentFrame;
use crate::router::{ApiError, BridgeState};
use crate::translate;
use crate::transport::OutboundFrame;

const QUEUE_CAPACITY: usize = 64;
const REPLAY_PACING: Duration = Duration::from_millis(1_000);

/// Work parked for the replay worker.
pub enum PendingEntry {
    /// A fresh HTTP request whose caller is blocked on `respond`.
    Fresh {
        body: Value,
        respond: oneshot::Sender<Response>,
    },
    /// An in-flight request to re-send under its original id.
    Replay { request_id: String },
}

pub struct PendingQueue {
    tx: mpsc::Sender<PendingEntry>,
    depth: AtomicUsize,
}

impl PendingQueue {
    pub fn new() -> (Self, mpsc::Receiver<PendingEntry>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Self {
                tx,
                depth: AtomicUsize::new(0),
            },
            rx,
        )
    }

    /// Bounded put. The deadline keeps the reconnect path from deadlocking on
    /// a full queue.
    pub async fn offer(&self, entry: PendingEntry, deadline: Duration) -> Result<(), BridgeError> {
        match self.tx.send_timeout(entry, deadline).await {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => Err(BridgeError::NoPeer),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn note_taken(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| {
                depth.checked_sub(1)
            });
    }
}

/// The single queue consumer. Waits for a live peer, then replays entries in
/// arrival order with a small gap between sends.
pub async fn run_worker(state: Arc<BridgeState>, mut rx: mpsc::Receiver<PendingEntry>) {
    let mut connected = state.link.subscribe();
    loop {
        // Wake on peer-connect; the backlog stays queued during outages.
        while !*connected.borrow() {
            if connected.changed().await.is_err() {
                return;
            }
        }
        let Some(entry) = rx.recv().await else {
            return;
        };
        state.pending.note_taken();

        match entry {
            PendingEntry::Fresh { body, respond } => {
                tracing::info!("replaying a parked request");
                let response = match crate::dispatch::handle_single(state.clone(), body).await {
                    Ok(response) => response,
                    Err(err) => ApiError::from(err).into_response(),
                };
                if respond.send(response).is_err() {
                    tracing::warn!("parked caller gave up before the replay finished");
                }
            }
            PendingEntry::Replay { request_id } => {
                replay_in_flight(&state, &request_id).await;
            }
        }

        tokio::time::sleep(REPLAY_PACING).await;
    }
}

/// Re-send an interrupted request under its original id so the upstream
/// response lands in the channel the original caller is still draining.
async fn replay_in_flight(state: &Arc<BridgeState>, request_id: &str) {
    let Some(meta) = state.registry.meta(request_id).await else {
        tracing::info!(request_id, "request finished before replay, nothing to do");
        return;
    };

    let payload = match translate::translate(&meta.openai_body, &state.config, &meta.resolved) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(request_id, error = %err, "could not rebuild the task payload");
            drain_with_error(state, request_id, &err).await;
            return;
        }
    };
    let frame = OutboundFrame::Task {
        request_id: request_id.to_string(),
        payload: serde_json::to_value(payload).unwrap_or(Value::Null),
    };
    match state.link.send(&frame).await {
        Ok(()) => tracing::info!(request_id, "in-flight request replayed to the new peer"),
        Err(err) => {
            tracing::warn!(request_id, error = %err, "replay send failed, draining the channel");
            drain_with_error(state, request_id, &err).await;
        }
    }
}

/// Deliver one error frame plus the terminal sentinel; the request's processor
/// does the actual cleanup.
pub async fn drain_with_error(state: &BridgeState, request_id: &str, error: &BridgeError) {
    state
        .registry
        .deliver(
            request_id,
            AgentFrame::Error {
                message: Value::String(error.to_string()),
                terminal: true,
            },
        )
        .await;
    state.registry.deliver(request_id, AgentFrame::Done).await;
}

/// Runs on every peer attach: drain the backlog (the worker wakes on the
/// connectivity watch) and re-offer every still-open request.
pub fn spawn_recovery(state: Arc<BridgeState>) {
    tokio::spawn(async move {
        if !state.config.enable_auto_retry {
            return;
        }
        let snapshot = state.registry.snapshot().await;
        if snapshot.is_empty() {
            return;
        }
        tracing::info!(count = snapshot.len(), "recovering in-flight requests");
        let put_deadline = Duration::from_secs(state.config.pending_put_timeout_seconds);
        for (request_id, _meta) in snapshot {
            let entry = PendingEntry::Replay {
                request_id: request_id.clone(),
            };
            if state.pending.offer(entry, put_deadline).await.is_err() {
                tracing::warn!(request_id, "pending queue full, failing the request");
                drain_with_error(
                    &state,
                    &request_id,
                    &BridgeError::RecoveryTimeout {
                        seconds: put_deadline.as_secs(),
                    },
                )
                .await;
            }
        }
    });
}
