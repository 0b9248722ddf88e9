use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use serde_json::json;

use super::*;
use crate::gateway::store_types::{Channel, ChannelCandidate, ModelAbility, Token};
use crate::utils::test_support::should_skip_httpmock;

fn meta_for(channel: Channel, path: &str, stream: bool) -> RelayMeta {
    let token = Token::new(1, 1, "client", 100.0);
    let mut meta = RelayMeta::new("req-1", path, &token, None);
    meta.origin_model = "gpt-4o-mini".to_string();
    meta.is_stream = stream;
    meta.prompt_tokens = 9;
    let ability = ModelAbility::new(channel.id, "gpt-4o-mini");
    meta.assign_channel(&ChannelCandidate {
        channel: std::sync::Arc::new(channel),
        ability: std::sync::Arc::new(ability),
    });
    meta
}

fn openai_channel(base_url: String) -> Channel {
    let mut channel = Channel::new(1, "primary", ChannelType::OpenAi);
    channel.base_url = Some(base_url);
    channel.key = "sk-upstream".to_string();
    channel
}

fn adaptor_for(meta: &RelayMeta) -> OpenAiAdaptor {
    let mut adaptor = OpenAiAdaptor::new(reqwest::Client::new());
    adaptor.initialize(meta);
    adaptor
}

#[test]
fn azure_uses_deployment_url_and_api_key_header() {
    let mut channel = Channel::new(2, "azure", ChannelType::Azure);
    channel.base_url = Some("https://east.openai.azure.com".to_string());
    channel.key = "azure-secret".to_string();
    channel.config.api_version = "2024-06-01".to_string();
    let mut meta = meta_for(channel, "/v1/chat/completions", false);
    meta.actual_model = "gpt-3.5-turbo".to_string();
    let adaptor = adaptor_for(&meta);

    assert_eq!(
        adaptor.build_request_url(&meta),
        "https://east.openai.azure.com/openai/deployments/gpt-35-turbo/chat/completions?api-version=2024-06-01"
    );
    let headers = adaptor.build_request_headers(&meta).expect("headers");
    assert_eq!(headers.get("api-key").expect("api-key"), "azure-secret");
    assert!(headers.get(AUTHORIZATION).is_none());
}

#[test]
fn openrouter_adds_attribution_headers() {
    let mut channel = Channel::new(3, "router", ChannelType::OpenRouter);
    channel.key = "or-key".to_string();
    let meta = meta_for(channel, "/v1/chat/completions", true);
    let adaptor = adaptor_for(&meta);

    assert_eq!(
        adaptor.build_request_url(&meta),
        "https://openrouter.ai/api/v1/chat/completions"
    );
    let headers = adaptor.build_request_headers(&meta).expect("headers");
    assert_eq!(headers.get(AUTHORIZATION).expect("auth"), "Bearer or-key");
    assert_eq!(headers.get(ACCEPT).expect("accept"), "text/event-stream");
    assert!(headers.contains_key("http-referer"));
    assert!(headers.contains_key("x-title"));
}

#[test]
fn base_url_ending_in_v1_is_not_doubled() {
    let meta = meta_for(
        openai_channel("http://127.0.0.1:9/v1".to_string()),
        "/v1/embeddings",
        false,
    );
    let adaptor = adaptor_for(&meta);
    assert_eq!(
        adaptor.build_request_url(&meta),
        "http://127.0.0.1:9/v1/embeddings"
    );
}

#[test]
fn translate_request_forces_usage_on_streams() {
    let adaptor = OpenAiAdaptor::new(reqwest::Client::new());
    let request: GeneralRequest = serde_json::from_value(json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true,
        "temperature": 0.5
    }))
    .expect("request");

    let body = adaptor
        .translate_request(RelayMode::ChatCompletions, request)
        .expect("translate");
    assert_eq!(body["stream_options"]["include_usage"], json!(true));
    assert_eq!(body["temperature"], json!(0.5));

    let plain: GeneralRequest = serde_json::from_value(json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}]
    }))
    .expect("request");
    let body = adaptor
        .translate_request(RelayMode::ChatCompletions, plain)
        .expect("translate");
    assert!(body.get("stream_options").is_none());
}

#[test]
fn stream_tracker_reads_final_usage_chunk() {
    let mut tracker = OpenAiStreamTracker::new("gpt-4o-mini".to_string(), 9);
    tracker.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n");
    tracker.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\ndata: {\"choices\":[],");
    tracker.ingest(
        b"\"usage\":{\"prompt_tokens\":11,\"completion_tokens\":2,\"total_tokens\":13}}\n\ndata: [DONE]\n\n",
    );
    assert_eq!(tracker.finish(), Usage::new(11, 2));
}

#[test]
fn stream_tracker_counts_text_without_usage() {
    let mut tracker = OpenAiStreamTracker::new("gpt-4o-mini".to_string(), 9);
    tracker.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello there\"}}]}\n\n");
    tracker.ingest(b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n");
    let usage = tracker.finish();
    assert_eq!(usage.prompt_tokens, 9);
    assert_eq!(
        usage.completion_tokens,
        count_text_tokens("gpt-4o-mini", "Hello there")
    );
}

#[test]
fn upstream_error_body_is_passed_through() {
    let body = br#"{"error":{"message":"Rate limit reached","type":"requests","code":"rate_limit_exceeded"}}"#;
    match parse_upstream_error(StatusCode::TOO_MANY_REQUESTS, body) {
        AdaptorError::Upstream {
            status,
            message,
            kind,
            code,
        } => {
            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(message, "Rate limit reached");
            assert_eq!(kind, "requests");
            assert_eq!(code.as_deref(), Some("rate_limit_exceeded"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    match parse_upstream_error(StatusCode::BAD_GATEWAY, b"<html>bad gateway</html>") {
        AdaptorError::Upstream { message, code, .. } => {
            assert_eq!(message, "bad response status code 502");
            assert_eq!(code.as_deref(), Some("bad_response_status_code"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn executes_and_parses_non_stream_usage() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-upstream");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "chatcmpl-1",
                    "choices": [{"message": {"role": "assistant", "content": "hi"}}],
                    "usage": {"prompt_tokens": 20, "completion_tokens": 4, "total_tokens": 24}
                }));
        })
        .await;

    let meta = meta_for(openai_channel(upstream.base_url()), "/v1/chat/completions", false);
    let adaptor = adaptor_for(&meta);
    let response = adaptor
        .execute(&meta, Bytes::from_static(br#"{"model":"gpt-4o-mini"}"#))
        .await
        .expect("execute");
    let translated = adaptor
        .translate_response(&meta, response)
        .await
        .expect("translate");

    match translated {
        AdaptorResponse::Complete { status, body, usage, .. } => {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(usage, Usage::new(20, 4));
            let value: Value = serde_json::from_slice(&body).expect("json");
            assert_eq!(value["id"], json!("chatcmpl-1"));
        }
        AdaptorResponse::Stream { .. } => panic!("expected a complete response"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn non_stream_without_usage_is_backfilled() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/completions");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"choices": [{"text": "Hello there"}]}));
        })
        .await;

    let meta = meta_for(openai_channel(upstream.base_url()), "/v1/completions", false);
    let adaptor = adaptor_for(&meta);
    let response = adaptor
        .execute(&meta, Bytes::from_static(b"{}"))
        .await
        .expect("execute");
    let AdaptorResponse::Complete { usage, .. } = adaptor
        .translate_response(&meta, response)
        .await
        .expect("translate")
    else {
        panic!("expected a complete response");
    };
    assert_eq!(usage.prompt_tokens, 9);
    assert_eq!(
        usage.completion_tokens,
        count_text_tokens("gpt-4o-mini", "Hello there")
    );
}

#[tokio::test]
async fn stream_request_answered_with_json_is_an_error() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"error": {"message": "model overloaded", "type": "server_error"}}));
        })
        .await;

    let meta = meta_for(openai_channel(upstream.base_url()), "/v1/chat/completions", true);
    let adaptor = adaptor_for(&meta);
    let response = adaptor
        .execute(&meta, Bytes::from_static(b"{}"))
        .await
        .expect("execute");
    let err = adaptor
        .translate_response(&meta, response)
        .await
        .err()
        .expect("error");
    match err {
        AdaptorError::Upstream { status, message, .. } => {
            assert_eq!(status, StatusCode::BAD_GATEWAY);
            assert_eq!(message, "model overloaded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn stream_response_is_forwarded_and_tracked() {
    if should_skip_httpmock() {
        return;
    }
    let sse = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":1,\"total_tokens\":6}}\n\n",
        "data: [DONE]\n\n",
    );
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("accept", "text/event-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse);
        })
        .await;

    let meta = meta_for(openai_channel(upstream.base_url()), "/v1/chat/completions", true);
    let adaptor = adaptor_for(&meta);
    let response = adaptor
        .execute(&meta, Bytes::from_static(b"{}"))
        .await
        .expect("execute");
    let AdaptorResponse::Stream {
        mut body,
        mut tracker,
        ..
    } = adaptor
        .translate_response(&meta, response)
        .await
        .expect("translate")
    else {
        panic!("expected a stream");
    };

    let mut forwarded = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.expect("chunk");
        tracker.ingest(&chunk);
        forwarded.extend_from_slice(&chunk);
    }
    assert_eq!(forwarded, sse.as_bytes());
    assert_eq!(tracker.finish(), Usage::new(5, 1));
}

#[tokio::test]
async fn lists_remote_models_with_string_prices() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(GET)
                .path("/v1/models")
                .header("authorization", "Bearer sk-upstream");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": [
                        {
                            "id": "openai/gpt-4o",
                            "context_length": 128000,
                            "architecture": {"tokenizer": "GPT"},
                            "pricing": {
                                "prompt": "0.0000025",
                                "completion": "0.00001",
                                "input_cache_read": "0.00000125",
                                "web_search": "0.01"
                            }
                        },
                        {"id": "bare-model"}
                    ]
                }));
        })
        .await;

    let adaptor = OpenAiAdaptor::new(reqwest::Client::new());
    let models = adaptor
        .list_remote_models(&format!("{}/", upstream.base_url()), "sk-upstream")
        .await
        .expect("models");
    assert_eq!(models.len(), 2);
    assert_eq!(models[0].id, "openai/gpt-4o");
    assert_eq!(models[0].pricing.context_length, 128_000);
    assert_eq!(models[0].pricing.prompt, 0.0000025);
    assert_eq!(models[0].pricing.completion, 0.00001);
    assert_eq!(models[0].pricing.input_cache_read, 0.00000125);
    assert_eq!(models[0].pricing.additional, 0.01);
    assert_eq!(models[0].tokenizer.as_deref(), Some("GPT"));
    assert_eq!(models[1].pricing, ModelPricing::default());

    let ability = models[0].clone().into_ability(4);
    assert_eq!(ability.channel_id, 4);
    assert_eq!(ability.upstream_name(), "openai/gpt-4o");
}
