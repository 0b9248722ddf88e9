use axum::http::{HeaderMap, StatusCode};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use super::meta::{RelayMeta, RelayMode};
use super::store_types::{ApiType, ModelAbility, ModelPricing};
use crate::error::RelayError;
use crate::types::{GeneralRequest, Usage};

pub mod openai;

pub type BodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Debug, Error)]
pub enum AdaptorError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to encode request: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header value for {name}")]
    InvalidHeader { name: &'static str },
    #[error("{message}")]
    Upstream {
        status: StatusCode,
        message: String,
        kind: String,
        code: Option<String>,
    },
}

impl From<AdaptorError> for RelayError {
    fn from(err: AdaptorError) -> Self {
        match err {
            AdaptorError::Http(err) if err.is_timeout() => RelayError::Upstream {
                status: StatusCode::GATEWAY_TIMEOUT,
                message: "upstream request timed out".to_string(),
                kind: "llm_relay_error".to_string(),
                code: Some("request_timeout".to_string()),
            },
            AdaptorError::Http(err) => RelayError::Upstream {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: err.to_string(),
                kind: "llm_relay_error".to_string(),
                code: Some("do_request_failed".to_string()),
            },
            AdaptorError::Json(err) => RelayError::Internal {
                code: "convert_request_failed",
                message: err.to_string(),
            },
            AdaptorError::InvalidHeader { name } => RelayError::Internal {
                code: "convert_request_failed",
                message: format!("invalid header value for {name}"),
            },
            AdaptorError::Upstream {
                status,
                message,
                kind,
                code,
            } => RelayError::Upstream {
                status,
                message,
                kind,
                code,
            },
        }
    }
}

pub trait StreamTracker: Send {
    fn ingest(&mut self, chunk: &[u8]);

    fn finish(&mut self) -> Usage;
}

pub enum AdaptorResponse {
    Complete {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        usage: Usage,
    },
    Stream {
        status: StatusCode,
        headers: HeaderMap,
        body: BodyStream,
        tracker: Box<dyn StreamTracker>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelDescriptor {
    pub id: String,
    pub pricing: ModelPricing,
    pub tokenizer: Option<String>,
}

impl ModelDescriptor {
    pub fn into_ability(self, channel_id: i64) -> ModelAbility {
        let mut ability = ModelAbility::new(channel_id, self.id.clone());
        ability.mapped_name = Some(self.id);
        ability.pricing = Some(self.pricing);
        ability.tokenizer = self.tokenizer.filter(|tokenizer| !tokenizer.is_empty());
        ability
    }
}

#[async_trait]
pub trait Adaptor: Send + Sync {
    fn initialize(&mut self, meta: &RelayMeta);

    fn build_request_url(&self, meta: &RelayMeta) -> String;

    fn build_request_headers(&self, meta: &RelayMeta) -> Result<HeaderMap, AdaptorError>;

    fn translate_request(
        &self,
        mode: RelayMode,
        request: GeneralRequest,
    ) -> Result<Value, AdaptorError>;

    async fn execute(&self, meta: &RelayMeta, body: Bytes)
    -> Result<reqwest::Response, AdaptorError>;

    async fn translate_response(
        &self,
        meta: &RelayMeta,
        response: reqwest::Response,
    ) -> Result<AdaptorResponse, AdaptorError>;

    async fn list_remote_models(
        &self,
        base_url: &str,
        key: &str,
    ) -> Result<Vec<ModelDescriptor>, AdaptorError>;
}

pub fn get_adaptor(
    api_type: ApiType,
    http: reqwest::Client,
) -> Result<Box<dyn Adaptor>, RelayError> {
    match api_type {
        ApiType::OpenAi => Ok(Box::new(openai::OpenAiAdaptor::new(http))),
        other => Err(RelayError::UnsupportedApiType {
            api_type: other.to_string(),
        }),
    }
}

/// Missing or all-zero usage is replaced by local counts; a total without a
/// prompt split is divided using the local prompt estimate.
pub fn backfill_usage(
    usage: Option<Usage>,
    prompt_tokens: i64,
    completion_estimate: impl FnOnce() -> i64,
) -> Usage {
    let mut usage = match usage {
        Some(usage) if usage.total_tokens != 0 => usage,
        _ => Usage::new(prompt_tokens, completion_estimate()),
    };
    if usage.total_tokens != 0 && usage.prompt_tokens == 0 {
        usage.prompt_tokens = prompt_tokens;
        usage.completion_tokens = usage.total_tokens - prompt_tokens;
    }
    usage
}
