//! OpenAI chat-completion wire types and chunk construction.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, JsonSchema, ToSchema)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct ChatCompletion {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct ImageGenerationResponse {
    pub created: i64,
    pub data: Vec<ImageDatum>,
}

#[derive(Debug, Clone, Serialize, JsonSchema, ToSchema)]
pub struct ImageDatum {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema, ToSchema)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_image_count")]
    pub n: u32,
}

fn default_image_count() -> u32 {
    1
}

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

pub fn new_response_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

/// The upstream gives no token accounting, so mirror the original's
/// four-bytes-per-token estimate.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

pub fn content_chunk(id: &str, model: &str, content: impl Into<String>) -> ChatCompletionChunk {
    chunk_with_delta(
        id,
        model,
        Delta {
            content: Some(content.into()),
            ..Delta::default()
        },
        None,
    )
}

pub fn reasoning_chunk(id: &str, model: &str, reasoning: impl Into<String>) -> ChatCompletionChunk {
    chunk_with_delta(
        id,
        model,
        Delta {
            reasoning_content: Some(reasoning.into()),
            ..Delta::default()
        },
        None,
    )
}

pub fn finish_chunk(id: &str, model: &str, reason: &str) -> ChatCompletionChunk {
    chunk_with_delta(id, model, Delta::default(), Some(normalize_finish_reason(reason)))
}

fn chunk_with_delta(
    id: &str,
    model: &str,
    delta: Delta,
    finish_reason: Option<String>,
) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created: now_unix(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
    }
}

/// Upstream reports `content-filter`; OpenAI clients expect `content_filter`.
pub fn normalize_finish_reason(reason: &str) -> String {
    reason.replace('-', "_")
}

pub fn completion(
    id: &str,
    model: &str,
    content: String,
    reasoning: Option<String>,
    finish_reason: &str,
    prompt_tokens: u64,
) -> ChatCompletion {
    let completion_tokens = estimate_tokens(&content);
    ChatCompletion {
        id: id.to_string(),
        object: "chat.completion",
        created: now_unix(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content,
                reasoning_content: reasoning,
            },
            finish_reason: normalize_finish_reason(finish_reason),
        }],
        usage: Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    }
}

/// Rough prompt-token estimate over an OpenAI `messages` array.
pub fn estimate_prompt_tokens(messages: &[Value]) -> u64 {
    messages
        .iter()
        .map(|message| match message.get("content") {
            Some(Value::String(text)) => estimate_tokens(text),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .map(estimate_tokens)
                .sum(),
            _ => 0,
        })
        .sum()
}

/// Markdown image references (`![...](target)`) in a rendered response.
pub fn extract_markdown_images(content: &str) -> Vec<String> {
    let mut targets = Vec::new();
    let mut rest = content;
    while let Some(start) = rest.find("![") {
        let after = &rest[start..];
        let Some(close) = after.find("](") else {
            break;
        };
        let Some(end) = after[close + 2..].find(')') else {
            break;
        };
        targets.push(after[close + 2..close + 2 + end].to_string());
        rest = &rest[start + close + 2 + end + 1..];
    }
    targets
}
