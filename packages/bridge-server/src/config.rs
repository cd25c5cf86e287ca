//! Typed configuration with explicit defaults for every recognized key.

use std::collections::HashMap;
use std::path::Path;

use lmarena_bridge_error::BridgeError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,

    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub id_updater_last_mode: SessionMode,
    pub id_updater_battle_target: BattleTarget,
    pub use_default_ids_if_mapping_not_found: bool,

    pub enable_auto_retry: bool,
    pub retry_timeout_seconds: u64,
    pub pending_put_timeout_seconds: u64,
    pub stream_response_timeout_seconds: u64,
    pub empty_response_retry: EmptyResponseRetry,

    pub tavern_mode_enabled: bool,
    pub bypass_enabled: bool,
    pub bypass_settings: HashMap<String, bool>,
    pub bypass_injection: BypassInjection,
    pub image_attachment_bypass_enabled: bool,

    pub enable_reasoning: bool,
    pub reasoning_output_mode: ReasoningOutputMode,
    pub preserve_streaming: bool,
    pub strip_reasoning_from_history: bool,

    pub save_images_locally: bool,
    pub local_save_format: String,
    pub image_return_format: ImageReturnFormat,

    pub file_bed_enabled: bool,
    pub file_bed_selection_strategy: FileBedStrategy,
    pub file_bed_endpoints: Vec<FileBedEndpoint>,

    pub max_concurrent_downloads: usize,
    pub download_timeout: DownloadTimeout,
    pub connection_pool: ConnectionPool,

    pub memory_management: MemoryManagement,
    pub metadata_timeout_minutes: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5102,
            api_key: None,
            session_id: None,
            message_id: None,
            id_updater_last_mode: SessionMode::DirectChat,
            id_updater_battle_target: BattleTarget::A,
            use_default_ids_if_mapping_not_found: true,
            enable_auto_retry: true,
            retry_timeout_seconds: 60,
            pending_put_timeout_seconds: 10,
            stream_response_timeout_seconds: 360,
            empty_response_retry: EmptyResponseRetry::default(),
            tavern_mode_enabled: false,
            bypass_enabled: false,
            bypass_settings: HashMap::new(),
            bypass_injection: BypassInjection::default(),
            image_attachment_bypass_enabled: false,
            enable_reasoning: false,
            reasoning_output_mode: ReasoningOutputMode::Openai,
            preserve_streaming: true,
            strip_reasoning_from_history: true,
            save_images_locally: false,
            local_save_format: "png".to_string(),
            image_return_format: ImageReturnFormat::default(),
            file_bed_enabled: false,
            file_bed_selection_strategy: FileBedStrategy::RoundRobin,
            file_bed_endpoints: Vec::new(),
            max_concurrent_downloads: 50,
            download_timeout: DownloadTimeout::default(),
            connection_pool: ConnectionPool::default(),
            memory_management: MemoryManagement::default(),
            metadata_timeout_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    DirectChat,
    Battle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub enum BattleTarget {
    A,
    B,
}

impl BattleTarget {
    pub fn as_participant(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningOutputMode {
    Openai,
    ThinkTag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmptyResponseRetry {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub show_retry_info_to_client: bool,
}

impl Default for EmptyResponseRetry {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            show_retry_info_to_client: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassInjection {
    pub active_preset: String,
    pub presets: HashMap<String, BypassTemplate>,
}

impl Default for BypassInjection {
    fn default() -> Self {
        let mut presets = HashMap::new();
        presets.insert("default".to_string(), BypassTemplate::default());
        Self {
            active_preset: "default".to_string(),
            presets,
        }
    }
}

impl BypassInjection {
    /// The active preset, falling back to a blank user template when the
    /// configured name does not exist.
    pub fn active_template(&self) -> BypassTemplate {
        match self.presets.get(&self.active_preset) {
            Some(template) => template.clone(),
            None => {
                tracing::warn!(
                    preset = %self.active_preset,
                    "bypass preset not found, using the default template"
                );
                BypassTemplate::default()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassTemplate {
    pub role: String,
    pub content: String,
    #[serde(alias = "participantPosition")]
    pub participant_position: String,
}

impl Default for BypassTemplate {
    fn default() -> Self {
        Self {
            role: "user".to_string(),
            content: " ".to_string(),
            participant_position: "a".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageReturnFormat {
    pub mode: ImageReturnMode,
}

impl Default for ImageReturnFormat {
    fn default() -> Self {
        Self {
            mode: ImageReturnMode::Url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageReturnMode {
    Url,
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileBedStrategy {
    Random,
    RoundRobin,
    Failover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBedEndpoint {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_file_field")]
    pub form_file_field: String,
    #[serde(default)]
    pub form_data_fields: HashMap<String, String>,
    #[serde(default = "default_response_type")]
    pub response_type: String,
    #[serde(default = "default_json_url_key")]
    pub json_url_key: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_field")]
    pub api_key_field: String,
}

fn default_true() -> bool {
    true
}

fn default_file_field() -> String {
    "file".to_string()
}

fn default_response_type() -> String {
    "json".to_string()
}

fn default_json_url_key() -> String {
    "url".to_string()
}

fn default_api_key_field() -> String {
    "key".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadTimeout {
    pub connect: u64,
    pub sock_read: u64,
    pub total: u64,
    pub max_retries: u32,
}

impl Default for DownloadTimeout {
    fn default() -> Self {
        Self {
            connect: 5,
            sock_read: 10,
            total: 30,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPool {
    pub total_limit: usize,
    pub per_host_limit: usize,
    pub keepalive_timeout: u64,
    pub dns_cache_ttl: u64,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self {
            total_limit: 100,
            per_host_limit: 30,
            keepalive_timeout: 30,
            dns_cache_ttl: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryManagement {
    pub gc_threshold_mb: u64,
    pub image_cache_max_size: usize,
    pub image_cache_ttl_seconds: u64,
}

impl Default for MemoryManagement {
    fn default() -> Self {
        Self {
            gc_threshold_mb: 500,
            image_cache_max_size: 1_000,
            image_cache_ttl_seconds: 3_600,
        }
    }
}

impl BridgeConfig {
    /// Load from a JSONC file, warn about unrecognized keys, and validate.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let raw = std::fs::read_to_string(path).map_err(|err| BridgeError::Internal {
            message: format!("failed to read {}: {err}", path.display()),
        })?;
        Self::from_jsonc(&raw)
    }

    pub fn from_jsonc(raw: &str) -> Result<Self, BridgeError> {
        let stripped = strip_jsonc_comments(raw);
        let value: Value =
            serde_json::from_str(&stripped).map_err(|err| BridgeError::Internal {
                message: format!("invalid configuration JSON: {err}"),
            })?;
        warn_unknown_keys(&value);
        let config: BridgeConfig =
            serde_json::from_value(value).map_err(|err| BridgeError::Internal {
                message: format!("invalid configuration: {err}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.file_bed_enabled && self.file_bed_endpoints.is_empty() {
            return Err(BridgeError::Internal {
                message: "file_bed_enabled is set but file_bed_endpoints is empty".to_string(),
            });
        }
        if self.max_concurrent_downloads == 0 {
            return Err(BridgeError::Internal {
                message: "max_concurrent_downloads must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn battle_participant(&self) -> &'static str {
        self.id_updater_battle_target.as_participant()
    }
}

fn warn_unknown_keys(value: &Value) {
    let known = [
        "host",
        "port",
        "api_key",
        "session_id",
        "message_id",
        "id_updater_last_mode",
        "id_updater_battle_target",
        "use_default_ids_if_mapping_not_found",
        "enable_auto_retry",
        "retry_timeout_seconds",
        "pending_put_timeout_seconds",
        "stream_response_timeout_seconds",
        "empty_response_retry",
        "tavern_mode_enabled",
        "bypass_enabled",
        "bypass_settings",
        "bypass_injection",
        "image_attachment_bypass_enabled",
        "enable_reasoning",
        "reasoning_output_mode",
        "preserve_streaming",
        "strip_reasoning_from_history",
        "save_images_locally",
        "local_save_format",
        "image_return_format",
        "file_bed_enabled",
        "file_bed_selection_strategy",
        "file_bed_endpoints",
        "max_concurrent_downloads",
        "download_timeout",
        "connection_pool",
        "memory_management",
        "metadata_timeout_minutes",
    ];
    if let Value::Object(map) = value {
        for key in map.keys() {
            if !known.contains(&key.as_str()) {
                tracing::warn!(key = %key, "ignoring unrecognized configuration key");
            }
        }
    }
}

/// Remove `//` and `/* */` comments without touching string contents.
pub fn strip_jsonc_comments(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(ch) = chars.next() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    for next in chars.by_ref() {
                        if next == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for next in chars.by_ref() {
                        if prev == '*' && next == '/' {
                            break;
                        }
                        prev = next;
                    }
                }
                _ => out.push(ch),
            },
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_key() {
        let config = BridgeConfig::default();
        assert_eq!(config.port, 5102);
        assert_eq!(config.retry_timeout_seconds, 60);
        assert_eq!(config.pending_put_timeout_seconds, 10);
        assert_eq!(config.stream_response_timeout_seconds, 360);
        assert_eq!(config.metadata_timeout_minutes, 30);
        assert_eq!(config.empty_response_retry.max_retries, 5);
        assert_eq!(config.empty_response_retry.base_delay_ms, 1_000);
        assert_eq!(config.empty_response_retry.max_delay_ms, 30_000);
        assert_eq!(config.max_concurrent_downloads, 50);
        assert_eq!(config.memory_management.image_cache_ttl_seconds, 3_600);
        assert!(matches!(
            config.image_return_format.mode,
            ImageReturnMode::Url
        ));
    }

    #[test]
    fn jsonc_comments_are_stripped() {
        let raw = r#"
        {
            // line comment
            "port": 6000, /* inline */
            "session_id": "not // a comment",
            /* block
               comment */
            "enable_auto_retry": false
        }
        "#;
        let config = BridgeConfig::from_jsonc(raw).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.session_id.as_deref(), Some("not // a comment"));
        assert!(!config.enable_auto_retry);
    }

    #[test]
    fn file_bed_without_endpoints_is_rejected() {
        let raw = r#"{"file_bed_enabled": true}"#;
        let err = BridgeConfig::from_jsonc(raw).unwrap_err();
        assert!(err.to_string().contains("file_bed_endpoints"));
    }

    #[test]
    fn unknown_keys_do_not_fail_the_load() {
        let raw = r#"{"port": 7000, "definitely_not_a_key": 1}"#;
        let config = BridgeConfig::from_jsonc(raw).unwrap();
        assert_eq!(config.port, 7000);
    }

    #[test]
    fn active_preset_falls_back_to_default_template() {
        let mut injection = BypassInjection::default();
        injection.active_preset = "missing".to_string();
        let template = injection.active_template();
        assert_eq!(template.role, "user");
        assert_eq!(template.participant_position, "a");
    }
}
