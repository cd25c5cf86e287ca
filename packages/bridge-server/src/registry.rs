//! Request registry: per-request response channels plus the metadata needed
//! to replay a request after an agent disconnect.
//!
//! Channel and metadata live under one mutex so that removal is a single
//! critical section. Senders are cloned out under the lock and awaited outside
//! it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::models::ResolvedSession;

const CHANNEL_CAPACITY: usize = 256;

/// One inbound frame routed from the agent to a request's channel.
#[derive(Debug, Clone)]
pub enum AgentFrame {
    /// Raw upstream stream fragment.
    Fragment(String),
    /// `{retry_info: {...}}` advisory from the agent's empty-response loop.
    Advisory(Value),
    /// `{error, final_error?}` descriptor.
    Error { message: Value, terminal: bool },
    /// The `"[DONE]"` sentinel.
    Done,
}

#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub model: String,
    pub stream: bool,
    pub openai_body: Value,
    pub resolved: ResolvedSession,
    pub created_at: DateTime<Utc>,
}

struct RequestEntry {
    tx: mpsc::Sender<AgentFrame>,
    meta: Arc<RequestMeta>,
}

#[derive(Default)]
pub struct RequestRegistry {
    inner: Mutex<HashMap<String, RequestEntry>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for a new request. Replaces any stale entry under the
    /// same id.
    pub async fn open(&self, request_id: &str, meta: RequestMeta) -> mpsc::Receiver<AgentFrame> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().await;
        if inner
            .insert(
                request_id.to_string(),
                RequestEntry {
                    tx,
                    meta: Arc::new(meta),
                },
            )
            .is_some()
        {
            tracing::warn!(request_id, "replaced an existing response channel");
        }
        rx
    }

    /// Route a frame to the request's channel. Returns false when no channel
    /// matches (stale frame).
    pub async fn deliver(&self, request_id: &str, frame: AgentFrame) -> bool {
        let tx = {
            let inner = self.inner.lock().await;
            match inner.get(request_id) {
                Some(entry) => entry.tx.clone(),
                None => return false,
            }
        };
        if tx.send(frame).await.is_err() {
            tracing::debug!(request_id, "response channel receiver already dropped");
        }
        true
    }

    pub async fn sender(&self, request_id: &str) -> Option<mpsc::Sender<AgentFrame>> {
        let inner = self.inner.lock().await;
        inner.get(request_id).map(|entry| entry.tx.clone())
    }

    pub async fn meta(&self, request_id: &str) -> Option<Arc<RequestMeta>> {
        let inner = self.inner.lock().await;
        inner.get(request_id).map(|entry| entry.meta.clone())
    }

    /// Remove channel and metadata together.
    pub async fn close(&self, request_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.remove(request_id).is_some() {
            tracing::debug!(request_id, "response channel closed");
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Every open request with its metadata, for disconnect recovery.
    pub async fn snapshot(&self) -> Vec<(String, Arc<RequestMeta>)> {
        let inner = self.inner.lock().await;
        inner
            .iter()
            .map(|(id, entry)| (id.clone(), entry.meta.clone()))
            .collect()
    }

    /// Drop entries older than `max_age_minutes`, returning the swept ids.
    pub async fn sweep(&self, max_age_minutes: u64) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::minutes(max_age_minutes as i64);
        let mut inner = self.inner.lock().await;
        let stale: Vec<String> = inner
            .iter()
            .filter(|(_, entry)| entry.meta.created_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.remove(id);
        }
        stale
    }
}

/// Periodic sweeper for requests whose metadata outlived the timeout.
pub fn spawn_sweeper(registry: Arc<RequestRegistry>, max_age_minutes: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let swept = registry.sweep(max_age_minutes).await;
            if !swept.is_empty() {
                tracing::info!(
                    count = swept.len(),
                    request_ids = ?swept,
                    "swept stale request metadata"
                );
            }
        }
    });
}
