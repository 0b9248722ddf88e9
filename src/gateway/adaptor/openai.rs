use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt as _;
use serde::Deserialize;
use serde_json::Value;

use super::{
    Adaptor, AdaptorError, AdaptorResponse, ModelDescriptor, StreamTracker, backfill_usage,
};
use crate::gateway::meta::{RelayMeta, RelayMode};
use crate::gateway::store_types::{ChannelType, ModelPricing};
use crate::gateway::token_count::count_text_tokens;
use crate::types::{GeneralRequest, StreamOptions, UpstreamErrorBody, Usage};
use crate::utils::sse::SseDataBuffer;

const APP_TITLE: &str = "llm-relay";

pub struct OpenAiAdaptor {
    http: reqwest::Client,
    channel_type: ChannelType,
}

impl OpenAiAdaptor {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            channel_type: ChannelType::OpenAi,
        }
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn initialize(&mut self, meta: &RelayMeta) {
        self.channel_type = meta.channel_type;
    }

    fn build_request_url(&self, meta: &RelayMeta) -> String {
        let path = meta
            .request_path
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(&meta.request_path);

        if self.channel_type == ChannelType::Azure {
            // {endpoint}/openai/deployments/{deployment}/chat/completions?api-version=...
            let task = path.trim_start_matches("/v1/");
            let deployment = meta.actual_model.replace('.', "");
            return format!(
                "{}/openai/deployments/{deployment}/{task}?api-version={}",
                meta.base_url, meta.config.api_version
            );
        }

        let base = meta.base_url.trim_end_matches('/');
        match (base.strip_suffix("/v1"), meta.request_path.strip_prefix("/v1/")) {
            (Some(base), Some(_)) => format!("{base}{}", meta.request_path),
            _ => format!("{base}{}", meta.request_path),
        }
    }

    fn build_request_headers(&self, meta: &RelayMeta) -> Result<HeaderMap, AdaptorError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let accept = if meta.is_stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        headers.insert(ACCEPT, HeaderValue::from_static(accept));

        if self.channel_type == ChannelType::Azure {
            headers.insert(
                HeaderName::from_static("api-key"),
                header_value("api-key", &meta.api_key)?,
            );
            return Ok(headers);
        }

        headers.insert(
            AUTHORIZATION,
            header_value("authorization", &format!("Bearer {}", meta.api_key))?,
        );
        if self.channel_type == ChannelType::OpenRouter {
            headers.insert(
                HeaderName::from_static("http-referer"),
                HeaderValue::from_static(APP_TITLE),
            );
            headers.insert(
                HeaderName::from_static("x-title"),
                HeaderValue::from_static(APP_TITLE),
            );
        }
        Ok(headers)
    }

    fn translate_request(
        &self,
        _mode: RelayMode,
        mut request: GeneralRequest,
    ) -> Result<Value, AdaptorError> {
        if request.stream {
            request
                .stream_options
                .get_or_insert_with(StreamOptions::default)
                .include_usage = true;
        }
        Ok(serde_json::to_value(request)?)
    }

    async fn execute(
        &self,
        meta: &RelayMeta,
        body: Bytes,
    ) -> Result<reqwest::Response, AdaptorError> {
        let url = self.build_request_url(meta);
        let headers = self.build_request_headers(meta)?;
        let response = self.http.post(url).headers(headers).body(body).send().await?;
        Ok(response)
    }

    async fn translate_response(
        &self,
        meta: &RelayMeta,
        response: reqwest::Response,
    ) -> Result<AdaptorResponse, AdaptorError> {
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().starts_with("application/json"));

        let failed = !(status == StatusCode::OK || status == StatusCode::CREATED)
            || (meta.is_stream && is_json);
        if failed {
            // A stream request answered with a JSON body is an error even
            // under a 2xx status.
            let status = if status.is_success() {
                StatusCode::BAD_GATEWAY
            } else {
                status
            };
            let body = response.bytes().await.unwrap_or_default();
            return Err(parse_upstream_error(status, &body));
        }

        let headers = forwardable_headers(response.headers());
        if meta.is_stream {
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other))
                .boxed();
            return Ok(AdaptorResponse::Stream {
                status,
                headers,
                body,
                tracker: Box::new(OpenAiStreamTracker::new(
                    meta.actual_model.clone(),
                    meta.prompt_tokens,
                )),
            });
        }

        let body = response.bytes().await?;
        let usage = completion_usage(&body, &meta.actual_model, meta.prompt_tokens);
        Ok(AdaptorResponse::Complete {
            status,
            headers,
            body,
            usage,
        })
    }

    async fn list_remote_models(
        &self,
        base_url: &str,
        key: &str,
    ) -> Result<Vec<ModelDescriptor>, AdaptorError> {
        let base = base_url.trim();
        let base = if base.is_empty() {
            self.channel_type.default_base_url()
        } else {
            base
        };
        let url = format!("{}/v1/models", base.trim_end_matches('/'));

        let response = self
            .http
            .get(url)
            .header(
                AUTHORIZATION,
                header_value("authorization", &format!("Bearer {key}"))?,
            )
            .send()
            .await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.bytes().await.unwrap_or_default();
            return Err(parse_upstream_error(status, &body));
        }

        let list = response.json::<RemoteModelList>().await?;
        Ok(list
            .data
            .into_iter()
            .map(RemoteModel::into_descriptor)
            .collect())
    }
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, AdaptorError> {
    HeaderValue::from_str(value).map_err(|_| AdaptorError::InvalidHeader { name })
}

fn forwardable_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in ["content-length", "transfer-encoding", "connection", "keep-alive"] {
        headers.remove(name);
    }
    headers
}

pub(crate) fn parse_upstream_error(status: StatusCode, body: &[u8]) -> AdaptorError {
    let detail = serde_json::from_slice::<UpstreamErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.error)
        .filter(|detail| !detail.message.is_empty());

    match detail {
        Some(detail) => AdaptorError::Upstream {
            status,
            message: detail.message,
            kind: if detail.kind.is_empty() {
                "upstream_error".to_string()
            } else {
                detail.kind
            },
            code: match detail.code {
                Value::String(code) => Some(code),
                Value::Number(code) => Some(code.to_string()),
                _ => None,
            },
        },
        None => AdaptorError::Upstream {
            status,
            message: format!("bad response status code {}", status.as_u16()),
            kind: "upstream_error".to_string(),
            code: Some("bad_response_status_code".to_string()),
        },
    }
}

#[derive(Debug, Default, Deserialize)]
struct CompletionEnvelope {
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    choices: Vec<Value>,
}

fn completion_usage(body: &[u8], model: &str, prompt_tokens: i64) -> Usage {
    let envelope = serde_json::from_slice::<CompletionEnvelope>(body).unwrap_or_default();
    backfill_usage(envelope.usage, prompt_tokens, || {
        let text: String = envelope
            .choices
            .iter()
            .filter_map(|choice| {
                choice
                    .pointer("/message/content")
                    .or_else(|| choice.get("text"))
                    .and_then(Value::as_str)
            })
            .collect();
        count_text_tokens(model, &text)
    })
}

pub struct OpenAiStreamTracker {
    buffer: SseDataBuffer,
    usage: Option<Usage>,
    text: String,
    model: String,
    prompt_tokens: i64,
}

impl OpenAiStreamTracker {
    pub fn new(model: String, prompt_tokens: i64) -> Self {
        Self {
            buffer: SseDataBuffer::new(),
            usage: None,
            text: String::new(),
            model,
            prompt_tokens,
        }
    }

    fn ingest_event(&mut self, data: &[u8]) {
        if data == b"[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_slice::<Value>(data) else {
            return;
        };
        if let Some(usage) = event
            .get("usage")
            .filter(|usage| usage.is_object())
            .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok())
        {
            self.usage = Some(usage);
        }
        let Some(choices) = event.get("choices").and_then(Value::as_array) else {
            return;
        };
        for choice in choices {
            let piece = choice
                .pointer("/delta/content")
                .or_else(|| choice.get("text"))
                .and_then(Value::as_str);
            if let Some(piece) = piece {
                self.text.push_str(piece);
            }
        }
    }
}

impl StreamTracker for OpenAiStreamTracker {
    fn ingest(&mut self, chunk: &[u8]) {
        for data in self.buffer.push(chunk) {
            self.ingest_event(&data);
        }
    }

    fn finish(&mut self) -> Usage {
        if let Some(data) = self.buffer.finish() {
            self.ingest_event(&data);
        }
        let text = std::mem::take(&mut self.text);
        let model = &self.model;
        backfill_usage(self.usage.take(), self.prompt_tokens, || {
            count_text_tokens(model, &text)
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RemoteModelList {
    #[serde(default)]
    data: Vec<RemoteModel>,
}

#[derive(Debug, Deserialize)]
struct RemoteModel {
    id: String,
    #[serde(default)]
    context_length: Option<i64>,
    #[serde(default)]
    pricing: RemotePricing,
    #[serde(default)]
    architecture: RemoteArchitecture,
}

#[derive(Debug, Default, Deserialize)]
struct RemotePricing {
    #[serde(default)]
    prompt: Value,
    #[serde(default)]
    completion: Value,
    #[serde(default)]
    input_cache_read: Value,
    #[serde(default)]
    input_cache_write: Value,
    #[serde(default)]
    internal_reasoning: Value,
    #[serde(default)]
    web_search: Value,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteArchitecture {
    #[serde(default)]
    tokenizer: Option<String>,
}

fn price(value: &Value) -> f64 {
    match value {
        Value::String(raw) => raw.trim().parse().unwrap_or(0.0),
        Value::Number(number) => number.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

impl RemoteModel {
    fn into_descriptor(self) -> ModelDescriptor {
        ModelDescriptor {
            pricing: ModelPricing {
                context_length: self.context_length.unwrap_or(0),
                prompt: price(&self.pricing.prompt),
                completion: price(&self.pricing.completion),
                input_cache_read: price(&self.pricing.input_cache_read),
                input_cache_write: price(&self.pricing.input_cache_write),
                reasoning: price(&self.pricing.internal_reasoning),
                additional: price(&self.pricing.web_search),
            },
            tokenizer: self.architecture.tokenizer,
            id: self.id,
        }
    }
}

#[cfg(test)]
mod tests;
