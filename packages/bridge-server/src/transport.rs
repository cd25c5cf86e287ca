//! The duplex link to the browser agent.
//!
//! At most one peer is live at a time; a new handshake displaces the previous
//! one. Outbound frames are serialized through a single writer channel owned
//! by the socket task, so concurrent senders never interleave partial writes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use lmarena_bridge_error::BridgeError;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};

use crate::registry::AgentFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCommand {
    Refresh,
    Reconnect,
    ActivateIdCapture,
    SendPageSource,
}

/// A server→agent frame.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Command { command: AgentCommand },
    Task { request_id: String, payload: Value },
}

impl OutboundFrame {
    pub fn command(command: AgentCommand) -> Self {
        Self::Command { command }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("outbound frames are always serializable")
    }
}

struct PeerHandle {
    tx: mpsc::Sender<String>,
    generation: u64,
}

pub struct AgentLink {
    peer: Mutex<Option<PeerHandle>>,
    generation: AtomicU64,
    verifying: AtomicBool,
    connected_tx: watch::Sender<bool>,
}

impl Default for AgentLink {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentLink {
    pub fn new() -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            peer: Mutex::new(None),
            generation: AtomicU64::new(0),
            verifying: AtomicBool::new(false),
            connected_tx,
        }
    }

    /// Accept a peer, displacing any previous one. Returns the generation the
    /// socket task must present to `detach`.
    pub async fn attach(&self, tx: mpsc::Sender<String>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.peer.lock().await;
        if slot.is_some() {
            tracing::warn!("a new agent connected, replacing the previous peer");
        }
        *slot = Some(PeerHandle { tx, generation });
        drop(slot);

        if self.verifying.swap(false, Ordering::SeqCst) {
            tracing::info!("agent reconnected, verification state cleared");
        }
        let _ = self.connected_tx.send(true);
        tracing::info!(generation, "agent peer attached");
        generation
    }

    /// Release the slot, but only if it still holds the caller's peer. A
    /// replacement peer must never be torn down by the old socket's exit path.
    /// Returns whether the slot was actually cleared.
    pub async fn detach(&self, generation: u64) -> bool {
        let mut slot = self.peer.lock().await;
        match slot.as_ref() {
            Some(peer) if peer.generation == generation => {
                *slot = None;
                drop(slot);
                let _ = self.connected_tx.send(false);
                tracing::warn!(generation, "agent peer detached");
                true
            }
            _ => false,
        }
    }

    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), BridgeError> {
        let tx = {
            let slot = self.peer.lock().await;
            match slot.as_ref() {
                Some(peer) => peer.tx.clone(),
                None => return Err(BridgeError::NoPeer),
            }
        };
        tx.send(frame.to_text())
            .await
            .map_err(|_| BridgeError::NoPeer)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Mark the process as waiting on a verification refresh. Returns true if
    /// this call made the transition (exactly one refresh per detection).
    pub fn begin_verifying(&self) -> bool {
        !self.verifying.swap(true, Ordering::SeqCst)
    }

    pub fn is_verifying(&self) -> bool {
        self.verifying.load(Ordering::SeqCst)
    }
}

/// Decode an agent→server message into its target request and frame.
pub fn parse_inbound(text: &str) -> Option<(String, AgentFrame)> {
    let message: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "discarding unparseable agent message");
            return None;
        }
    };
    let request_id = message.get("request_id")?.as_str()?.to_string();
    let data = message.get("data")?;

    let frame = match data {
        Value::String(text) if text == "[DONE]" => AgentFrame::Done,
        Value::String(fragment) => AgentFrame::Fragment(fragment.clone()),
        Value::Array(items) => AgentFrame::Fragment(
            items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect(),
        ),
        Value::Object(object) => {
            if let Some(retry_info) = object.get("retry_info") {
                AgentFrame::Advisory(retry_info.clone())
            } else if let Some(error) = object.get("error") {
                AgentFrame::Error {
                    message: error.clone(),
                    terminal: object
                        .get("final_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                }
            } else {
                tracing::warn!("discarding agent object frame with no known field");
                return None;
            }
        }
        _ => return None,
    };
    Some((request_id, frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_peer_fails() {
        let link = AgentLink::new();
        let err = link
            .send(&OutboundFrame::command(AgentCommand::Refresh))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoPeer));
    }

    #[tokio::test]
    async fn attach_replaces_the_previous_peer() {
        let link = AgentLink::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let gen1 = link.attach(tx1).await;
        let gen2 = link.attach(tx2).await;
        assert!(gen2 > gen1);

        link.send(&OutboundFrame::command(AgentCommand::Refresh))
            .await
            .unwrap();
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.recv().await.unwrap(), r#"{"command":"refresh"}"#);
    }

    #[tokio::test]
    async fn stale_detach_does_not_clear_a_replacement() {
        let link = AgentLink::new();
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        let gen1 = link.attach(tx1).await;
        let _gen2 = link.attach(tx2).await;
        link.detach(gen1).await;
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn attach_clears_the_verifying_flag() {
        let link = AgentLink::new();
        assert!(link.begin_verifying());
        assert!(!link.begin_verifying());
        let (tx, _rx) = mpsc::channel(4);
        link.attach(tx).await;
        assert!(!link.is_verifying());
    }

    #[test]
    fn task_frames_serialize_with_request_id_and_payload() {
        let frame = OutboundFrame::Task {
            request_id: "r1".into(),
            payload: serde_json::json!({"session_id": "s"}),
        };
        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(value["request_id"], "r1");
        assert_eq!(value["payload"]["session_id"], "s");
    }

    #[test]
    fn inbound_frames_are_classified() {
        let (id, frame) = parse_inbound(r#"{"request_id":"r","data":"a0:\"x\""}"#).unwrap();
        assert_eq!(id, "r");
        assert!(matches!(frame, AgentFrame::Fragment(_)));

        let (_, frame) = parse_inbound(r#"{"request_id":"r","data":"[DONE]"}"#).unwrap();
        assert!(matches!(frame, AgentFrame::Done));

        let (_, frame) =
            parse_inbound(r#"{"request_id":"r","data":{"retry_info":{"attempt":1}}}"#).unwrap();
        assert!(matches!(frame, AgentFrame::Advisory(_)));

        let (_, frame) =
            parse_inbound(r#"{"request_id":"r","data":{"error":"boom","final_error":true}}"#)
                .unwrap();
        assert!(matches!(frame, AgentFrame::Error { terminal: true, .. }));

        assert!(parse_inbound(r#"{"data":"x"}"#).is_none());
        assert!(parse_inbound("not json").is_none());
    }
}
