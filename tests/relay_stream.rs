#![cfg(feature = "store-sqlite")]

mod support;

use axum::body::to_bytes;
use axum::http::StatusCode;
use httpmock::Method::POST;
use httpmock::MockServer;
use llm_relay::utils::test_support::should_skip_httpmock;
use tower::util::ServiceExt;

use support::{Fixture, approx, bearer, chat_request, pricing, store_backed_config};

const SSE_WITH_USAGE: &str = concat!(
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}],\"usage\":null}\n\n",
    "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":2,\"total_tokens\":9}}\n\n",
    "data: [DONE]\n\n",
);

#[tokio::test]
async fn streamed_response_is_forwarded_and_settled_on_completion() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("accept", "text/event-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(SSE_WITH_USAGE);
        })
        .await;

    let fixture = Fixture::new(1_000.0, 10.0).await;
    let channel_id = fixture
        .add_channel("streamer", &upstream.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let runtime = fixture.runtime(store_backed_config(0)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", true, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("stream body");
    assert_eq!(bytes, SSE_WITH_USAGE.as_bytes());
    mock.assert_calls_async(1).await;

    let logs = fixture.wait_for_logs(1).await;
    let log = &logs[0];
    assert!(log.is_stream);
    assert_eq!(log.channel_id, channel_id);
    assert_eq!(log.prompt_tokens, 7);
    assert_eq!(log.completion_tokens, 2);
    assert!(approx(log.quota, 7.0 * 0.001 + 2.0 * 0.002));
}

#[tokio::test]
async fn enforced_include_usage_rewrites_stream_requests() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_includes(r#""stream_options":{"include_usage":true}"#);
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(SSE_WITH_USAGE);
        })
        .await;

    let fixture = Fixture::new(1_000.0, 10.0).await;
    fixture
        .add_channel("streamer", &upstream.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let mut config = store_backed_config(0);
    config.enforce_include_usage = true;
    let runtime = fixture.runtime(config).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", true, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("stream body");
    mock.assert_calls_async(1).await;
    fixture.wait_for_logs(1).await;
}

#[tokio::test]
async fn stream_answered_with_json_fails_over() {
    if should_skip_httpmock() {
        return;
    }
    let broken = MockServer::start_async().await;
    let broken_mock = broken
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"error":{"message":"stream unsupported","type":"invalid_request_error"}}"#);
        })
        .await;
    let healthy = MockServer::start_async().await;
    let healthy_mock = healthy
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(SSE_WITH_USAGE);
        })
        .await;

    let fixture = Fixture::new(1_000.0, 10.0).await;
    fixture
        .add_channel("broken", &broken.base_url(), 10, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let healthy_id = fixture
        .add_channel("healthy", &healthy.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let runtime = fixture.runtime(store_backed_config(1)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", true, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("stream body");
    broken_mock.assert_calls_async(1).await;
    healthy_mock.assert_calls_async(1).await;

    let logs = fixture.wait_for_logs(1).await;
    assert_eq!(logs[0].channel_id, healthy_id);
}

#[tokio::test]
async fn abandoned_stream_returns_its_reservation() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(SSE_WITH_USAGE);
        })
        .await;

    // Balance low enough that the token reservation is not skipped.
    let fixture = Fixture::new(1.0, 10.0).await;
    fixture
        .add_channel("streamer", &upstream.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let runtime = fixture.runtime(store_backed_config(0)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", true, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(fixture.store.pending_reservations().await.expect("pending"), 1);
    drop(response);

    fixture.wait_for_released_reservations().await;
    let token = fixture.token().await;
    assert!(approx(token.remain_quota, 10.0));
    assert!(fixture.store.list_consume_logs(10).await.expect("logs").is_empty());
}
