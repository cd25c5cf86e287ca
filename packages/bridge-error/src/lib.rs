use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    InvalidSession,
    AuthFailed,
    NoPeer,
    UpstreamEmpty,
    UpstreamInterstitial,
    UpstreamMalformed,
    TranslatorFailed,
    RecoveryTimeout,
    ChannelTimeout,
    DownloadFailed,
    AttachmentTooLarge,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidSession => "invalid_session",
            Self::AuthFailed => "auth_failed",
            Self::NoPeer => "no_peer",
            Self::UpstreamEmpty => "upstream_empty",
            Self::UpstreamInterstitial => "upstream_interstitial",
            Self::UpstreamMalformed => "upstream_malformed",
            Self::TranslatorFailed => "translator_failed",
            Self::RecoveryTimeout => "recovery_timeout",
            Self::ChannelTimeout => "channel_timeout",
            Self::DownloadFailed => "download_failed",
            Self::AttachmentTooLarge => "attachment_too_large",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::InvalidSession => 400,
            Self::AuthFailed => 401,
            Self::NoPeer => 503,
            Self::UpstreamEmpty => 502,
            Self::UpstreamInterstitial => 502,
            Self::UpstreamMalformed => 502,
            Self::TranslatorFailed => 400,
            Self::RecoveryTimeout => 504,
            Self::ChannelTimeout => 504,
            Self::DownloadFailed => 502,
            Self::AttachmentTooLarge => 413,
            Self::Cancelled => 499,
            Self::Internal => 500,
        }
    }

    /// The OpenAI wire `error.type` bucket for this kind.
    pub fn openai_type(&self) -> &'static str {
        if self.status_code() < 500 {
            "invalid_request_error"
        } else {
            "api_error"
        }
    }
}

/// The `{"error": {...}}` body OpenAI clients parse.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<Value>,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                type_: kind.openai_type().to_string(),
                code: kind.code().to_string(),
                param: None,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("invalid session: {message}")]
    InvalidSession { message: String },
    #[error("missing or invalid API key")]
    AuthFailed { message: Option<String> },
    #[error("no browser agent is connected")]
    NoPeer,
    #[error("upstream returned an empty response after {attempts} attempts")]
    UpstreamEmpty { attempts: u32 },
    #[error("upstream verification page detected; the agent was asked to refresh")]
    UpstreamInterstitial,
    #[error("malformed upstream record: {message}")]
    UpstreamMalformed { message: String },
    #[error("failed to translate request: {message}")]
    TranslatorFailed { message: String },
    #[error("agent did not reconnect within {seconds} seconds")]
    RecoveryTimeout { seconds: u64 },
    #[error("no upstream data within {seconds} seconds")]
    ChannelTimeout { seconds: u64 },
    #[error("download failed: {message}")]
    DownloadFailed { message: String },
    #[error("attachment exceeds the upstream size limit (around 5 MB)")]
    AttachmentTooLarge,
    #[error("request cancelled")]
    Cancelled,
    #[error("{message}")]
    Internal { message: String },
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::InvalidSession { .. } => ErrorKind::InvalidSession,
            Self::AuthFailed { .. } => ErrorKind::AuthFailed,
            Self::NoPeer => ErrorKind::NoPeer,
            Self::UpstreamEmpty { .. } => ErrorKind::UpstreamEmpty,
            Self::UpstreamInterstitial => ErrorKind::UpstreamInterstitial,
            Self::UpstreamMalformed { .. } => ErrorKind::UpstreamMalformed,
            Self::TranslatorFailed { .. } => ErrorKind::TranslatorFailed,
            Self::RecoveryTimeout { .. } => ErrorKind::RecoveryTimeout,
            Self::ChannelTimeout { .. } => ErrorKind::ChannelTimeout,
            Self::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            Self::AttachmentTooLarge => ErrorKind::AttachmentTooLarge,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        let mut body = ErrorBody::new(self.kind(), self.to_string());
        if let Self::AuthFailed {
            message: Some(message),
        } = self
        {
            body.error.message = message.clone();
        }
        body
    }
}

impl From<BridgeError> for ErrorBody {
    fn from(value: BridgeError) -> Self {
        value.to_error_body()
    }
}

impl From<&BridgeError> for ErrorBody {
    fn from(value: &BridgeError) -> Self {
        value.to_error_body()
    }
}
