//! Model registry and session resolution.
//!
//! Maps public model names to upstream model ids and to the session tuples the
//! browser agent needs to retry a chat turn. Models with several configured
//! tuples are balanced round-robin; the cursor is per-process and resets on
//! restart.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;

use lmarena_bridge_error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{BattleTarget, BridgeConfig, SessionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Text,
    Image,
    Search,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Search => "search",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "image" => Self::Image,
            "search" => Self::Search,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: Option<String>,
    pub kind: ModelKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionTuple {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub mode: Option<SessionMode>,
    #[serde(default)]
    pub battle_target: Option<BattleTarget>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EndpointEntry {
    Pool(Vec<SessionTuple>),
    Single(SessionTuple),
}

/// The fully resolved handle for one upstream turn.
#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub session_id: String,
    pub message_id: String,
    pub mode: SessionMode,
    pub battle_target: BattleTarget,
    pub kind: ModelKind,
    pub target_model_id: Option<String>,
}

pub struct ModelRegistry {
    models: HashMap<String, ModelInfo>,
    endpoints: HashMap<String, EndpointEntry>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl ModelRegistry {
    pub fn new(
        models: HashMap<String, ModelInfo>,
        endpoints: HashMap<String, EndpointEntry>,
    ) -> Self {
        Self {
            models,
            endpoints,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Load `models.json` (name -> "id:type" | "id" | null) and the endpoint
    /// map. Missing files yield an empty registry with a warning.
    pub fn load(models_path: &Path, endpoints_path: &Path) -> Self {
        let models = match std::fs::read_to_string(models_path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, Value>>(&raw) {
                Ok(map) => parse_model_map(map),
                Err(err) => {
                    tracing::error!(error = %err, path = %models_path.display(), "failed to parse model map");
                    HashMap::new()
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, path = %models_path.display(), "model map not loaded");
                HashMap::new()
            }
        };

        let endpoints = match std::fs::read_to_string(endpoints_path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => match serde_json::from_str::<HashMap<String, EndpointEntry>>(&raw) {
                Ok(map) => map,
                Err(err) => {
                    tracing::error!(error = %err, path = %endpoints_path.display(), "failed to parse endpoint map");
                    HashMap::new()
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, path = %endpoints_path.display(), "endpoint map not loaded");
                HashMap::new()
            }
        };

        tracing::info!(
            models = models.len(),
            endpoints = endpoints.len(),
            "model registry loaded"
        );
        Self::new(models, endpoints)
    }

    /// Union of configured model names, for `GET /v1/models`.
    pub fn model_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.models.keys().cloned().collect();
        names.extend(self.endpoints.keys().cloned());
        names.into_iter().collect()
    }

    pub fn kind_of(&self, model: &str) -> ModelKind {
        if let Some(kind) = self.endpoint_kind(model) {
            return kind;
        }
        self.models
            .get(model)
            .map(|info| info.kind)
            .unwrap_or(ModelKind::Text)
    }

    fn endpoint_kind(&self, model: &str) -> Option<ModelKind> {
        let entry = self.endpoints.get(model)?;
        let raw = match entry {
            EndpointEntry::Single(tuple) => tuple.kind.as_deref(),
            EndpointEntry::Pool(pool) => pool.first().and_then(|tuple| tuple.kind.as_deref()),
        }?;
        Some(ModelKind::parse(raw))
    }

    /// Resolve a model name to a session tuple, advancing the round-robin
    /// cursor exactly once when the model has a tuple pool.
    pub fn resolve(
        &self,
        model: &str,
        config: &BridgeConfig,
    ) -> Result<ResolvedSession, BridgeError> {
        let mut session_id = None;
        let mut message_id = None;
        let mut mode_override = None;
        let mut battle_override = None;

        if let Some(entry) = self.endpoints.get(model) {
            let selected = match entry {
                EndpointEntry::Single(tuple) => Some(tuple.clone()),
                EndpointEntry::Pool(pool) if pool.is_empty() => None,
                EndpointEntry::Pool(pool) => {
                    let index = self.advance_cursor(model, pool.len());
                    tracing::debug!(
                        model,
                        index,
                        pool = pool.len(),
                        "selected session tuple round-robin"
                    );
                    Some(pool[index].clone())
                }
            };
            if let Some(tuple) = selected {
                session_id = tuple.session_id;
                message_id = tuple.message_id;
                mode_override = tuple.mode;
                battle_override = tuple.battle_target;
            }
        }

        if session_id.is_none() {
            if config.use_default_ids_if_mapping_not_found {
                session_id = config.session_id.clone();
                message_id = config.message_id.clone();
                mode_override = None;
                battle_override = None;
            } else {
                return Err(BridgeError::InvalidSession {
                    message: format!("model '{model}' has no configured session mapping"),
                });
            }
        }

        let session_id = validate_id(session_id, model, "session_id")?;
        let message_id = validate_id(message_id, model, "message_id")?;

        Ok(ResolvedSession {
            session_id,
            message_id,
            mode: mode_override.unwrap_or(config.id_updater_last_mode),
            battle_target: battle_override.unwrap_or(config.id_updater_battle_target),
            kind: self.kind_of(model),
            target_model_id: self.models.get(model).and_then(|info| info.id.clone()),
        })
    }

    fn advance_cursor(&self, model: &str, len: usize) -> usize {
        let mut cursors = self.cursors.lock().expect("round-robin cursor lock");
        let cursor = cursors.entry(model.to_string()).or_insert(0);
        let index = *cursor % len;
        *cursor = (index + 1) % len;
        index
    }
}

fn validate_id(
    id: Option<String>,
    model: &str,
    field: &'static str,
) -> Result<String, BridgeError> {
    match id {
        Some(value) if !value.trim().is_empty() && !value.contains("YOUR_") => Ok(value),
        _ => Err(BridgeError::InvalidSession {
            message: format!("model '{model}' resolved to an invalid {field}"),
        }),
    }
}

fn parse_model_map(raw: HashMap<String, Value>) -> HashMap<String, ModelInfo> {
    raw.into_iter()
        .map(|(name, value)| {
            let info = match value {
                Value::String(text) => match text.split_once(':') {
                    Some((id, kind)) => ModelInfo {
                        id: (id.to_lowercase() != "null").then(|| id.to_string()),
                        kind: ModelKind::parse(kind),
                    },
                    None => ModelInfo {
                        id: Some(text),
                        kind: ModelKind::Text,
                    },
                },
                _ => ModelInfo {
                    id: None,
                    kind: ModelKind::Text,
                },
            };
            (name, info)
        })
        .collect()
}
