use axum::http::StatusCode;
use thiserror::Error;

use crate::gateway::store::StoreError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{message}")]
    Auth { message: String },
    #[error("{reason}")]
    InvalidRequest { code: &'static str, reason: String },
    #[error("user quota is not enough")]
    InsufficientQuota,
    #[error("no available channel for model {model}")]
    ChannelNotFound { model: String },
    #[error("model config not found for {model} on channel {channel_id}")]
    ModelConfigNotFound { model: String, channel_id: i64 },
    #[error("invalid api type: {api_type}")]
    UnsupportedApiType { api_type: String },
    #[error("{message}")]
    Upstream {
        status: StatusCode,
        message: String,
        kind: String,
        code: Option<String>,
    },
    #[error("{message}")]
    Internal { code: &'static str, message: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            code: "invalid_text_request",
            reason: reason.into(),
        }
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
            kind: "upstream_error".to_string(),
            code: Some("bad_response_status_code".to_string()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth { .. } => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::InsufficientQuota => StatusCode::FORBIDDEN,
            Self::ChannelNotFound { .. }
            | Self::ModelConfigNotFound { .. }
            | Self::UnsupportedApiType { .. } => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => *status,
            Self::Internal { .. } | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Auth { .. } => Some("invalid_token"),
            Self::InvalidRequest { code, .. } => Some(code),
            Self::InsufficientQuota => Some("insufficient_user_quota"),
            Self::ChannelNotFound { .. } => Some("channel_not_found"),
            Self::ModelConfigNotFound { .. } => Some("model_config_not_found"),
            Self::UnsupportedApiType { .. } => Some("invalid_api_type"),
            Self::Upstream { code, .. } => code.as_deref(),
            Self::Internal { code, .. } => Some(code),
            Self::Store(_) => Some("store_error"),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Upstream { kind, .. } => kind,
            Self::Auth { .. } => "authentication_error",
            Self::InvalidRequest { .. } => "invalid_request_error",
            _ => "llm_relay_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
