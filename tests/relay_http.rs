#![cfg(feature = "store-sqlite")]

mod support;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use httpmock::Method::POST;
use httpmock::MockServer;
use llm_relay::gateway::store_types::{Token, TokenStatus};
use llm_relay::utils::test_support::should_skip_httpmock;
use serde_json::json;
use tower::util::ServiceExt;

use support::{Fixture, approx, bearer, chat_request, json_body, pricing, store_backed_config};

const COMPLETION_BODY: &str = r#"{"id":"chatcmpl-1","object":"chat.completion","choices":[{"index":0,"message":{"role":"assistant","content":"hi"}}],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;

const SERVER_ERROR_BODY: &str = r#"{"error":{"message":"upstream exploded","type":"server_error"}}"#;

#[tokio::test]
async fn chat_completion_is_relayed_and_settled() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-upstream-primary")
                .body_includes("hello there");
            then.status(200)
                .header("content-type", "application/json")
                .body(COMPLETION_BODY);
        })
        .await;

    let fixture = Fixture::new(1_000.0, 10.0).await;
    let channel_id = fixture
        .add_channel("primary", &upstream.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let runtime = fixture.runtime(store_backed_config(0)).await;

    let mut request = chat_request("gpt-4o", false, &bearer());
    request
        .headers_mut()
        .insert("x-request-id", "req-e2e-1".parse().expect("header"));
    let response = runtime.router().oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok()),
        Some("req-e2e-1")
    );
    let body = json_body(response).await;
    assert_eq!(body["id"], "chatcmpl-1");
    mock.assert_calls_async(1).await;

    let logs = fixture.wait_for_logs(1).await;
    let log = &logs[0];
    assert_eq!(log.channel_id, channel_id);
    assert_eq!(log.model_name, "gpt-4o");
    assert_eq!(log.prompt_tokens, 10);
    assert_eq!(log.completion_tokens, 5);
    assert!(!log.is_stream);
    let expected = 10.0 * 0.001 + 5.0 * 0.002;
    assert!(approx(log.quota, expected));
    assert_eq!(
        log.content,
        "prompt 1000.00/M, cached 0.00/M, completion 2000.00/M"
    );

    let user = fixture.user().await;
    assert!(approx(user.quota, 1_000.0 - expected));
    assert_eq!(user.request_count, 1);
    let token = fixture.token().await;
    assert!(approx(token.remain_quota, 10.0 - expected));
}

#[tokio::test]
async fn mapped_model_is_rewritten_for_the_upstream() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_includes(r#""model":"gpt-4o-2024-08-06""#);
            then.status(200)
                .header("content-type", "application/json")
                .body(COMPLETION_BODY);
        })
        .await;

    let fixture = Fixture::new(1_000.0, 10.0).await;
    fixture
        .add_mapped_channel(
            "mapped",
            &upstream.base_url(),
            0,
            "gpt-4o",
            Some("gpt-4o-2024-08-06"),
            pricing(0.001, 0.002),
        )
        .await;
    let runtime = fixture.runtime(store_backed_config(0)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    mock.assert_calls_async(1).await;

    let logs = fixture.wait_for_logs(1).await;
    assert_eq!(logs[0].model_name, "gpt-4o");
}

#[tokio::test]
async fn failed_channels_are_not_retried_and_reservations_are_returned() {
    if should_skip_httpmock() {
        return;
    }
    let fixture = Fixture::new(1.0, 10.0).await;
    let mut upstreams = Vec::new();
    let mut mocks = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let upstream: &'static MockServer = Box::leak(Box::new(MockServer::start_async().await));
        let mock = upstream
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500)
                    .header("content-type", "application/json")
                    .body(SERVER_ERROR_BODY);
            })
            .await;
        fixture
            .add_channel(name, &upstream.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
            .await;
        mocks.push(mock);
        upstreams.push(upstream);
    }
    let runtime = fixture.runtime(store_backed_config(2)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    let message = body["error"]["message"].as_str().unwrap_or_default();
    assert!(message.starts_with("upstream exploded (request id: relay-"));
    assert_eq!(body["error"]["status_code"], 500);

    for mock in &mocks {
        mock.assert_calls_async(1).await;
    }

    fixture.wait_for_released_reservations().await;
    let token = fixture.token().await;
    assert!(approx(token.remain_quota, 10.0));
    assert!(fixture.store.list_consume_logs(10).await.expect("logs").is_empty());
}

#[tokio::test]
async fn retry_falls_through_to_lower_priority_tier() {
    if should_skip_httpmock() {
        return;
    }
    let top = MockServer::start_async().await;
    let top_mock = top
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(502).body("bad gateway");
        })
        .await;
    let backup = MockServer::start_async().await;
    let backup_mock = backup
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(COMPLETION_BODY);
        })
        .await;

    let fixture = Fixture::new(1_000.0, 10.0).await;
    fixture
        .add_channel("top", &top.base_url(), 10, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let backup_id = fixture
        .add_channel("backup", &backup.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let runtime = fixture.runtime(store_backed_config(1)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    top_mock.assert_calls_async(1).await;
    backup_mock.assert_calls_async(1).await;

    let logs = fixture.wait_for_logs(1).await;
    assert_eq!(logs[0].channel_id, backup_id);
}

#[tokio::test]
async fn upstream_timeout_fails_over_to_the_next_channel() {
    if should_skip_httpmock() {
        return;
    }
    let slow = MockServer::start_async().await;
    let slow_mock = slow
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .delay(Duration::from_secs(3))
                .header("content-type", "application/json")
                .body(COMPLETION_BODY);
        })
        .await;
    let fast = MockServer::start_async().await;
    let fast_mock = fast
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(COMPLETION_BODY);
        })
        .await;

    let fixture = Fixture::new(1.0, 10.0).await;
    fixture
        .add_channel("slow", &slow.base_url(), 10, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let fast_id = fixture
        .add_channel("fast", &fast.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let mut config = store_backed_config(1);
    config.relay_timeout_secs = 1;
    let runtime = fixture.runtime(config).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    slow_mock.assert_calls_async(1).await;
    fast_mock.assert_calls_async(1).await;

    let logs = fixture.wait_for_logs(1).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].channel_id, fast_id);
    fixture.wait_for_released_reservations().await;
}

#[tokio::test]
async fn zero_timeout_waits_for_slow_upstreams() {
    if should_skip_httpmock() {
        return;
    }
    let slow = MockServer::start_async().await;
    let slow_mock = slow
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .delay(Duration::from_millis(1_500))
                .header("content-type", "application/json")
                .body(COMPLETION_BODY);
        })
        .await;

    let fixture = Fixture::new(1_000.0, 10.0).await;
    fixture
        .add_channel("slow", &slow.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let mut config = store_backed_config(0);
    config.relay_timeout_secs = 0;
    let runtime = fixture.runtime(config).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["id"], "chatcmpl-1");
    slow_mock.assert_calls_async(1).await;
}

#[tokio::test]
async fn pinned_channel_is_used_without_retry() {
    if should_skip_httpmock() {
        return;
    }
    let pinned = MockServer::start_async().await;
    let pinned_mock = pinned
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(500)
                .header("content-type", "application/json")
                .body(SERVER_ERROR_BODY);
        })
        .await;
    let other = MockServer::start_async().await;
    let other_mock = other
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(COMPLETION_BODY);
        })
        .await;

    let fixture = Fixture::new(1_000.0, 10.0).await;
    let pinned_id = fixture
        .add_channel("pinned", &pinned.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    fixture
        .add_channel("other", &other.base_url(), 100, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let runtime = fixture.runtime(store_backed_config(3)).await;

    let authorization = format!("{}-{pinned_id}", bearer());
    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, &authorization))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    pinned_mock.assert_calls_async(1).await;
    other_mock.assert_calls_async(0).await;
}

#[tokio::test]
async fn exhausted_rate_limits_report_saturation() {
    if should_skip_httpmock() {
        return;
    }
    let fixture = Fixture::new(1_000.0, 10.0).await;
    let mut upstreams = Vec::new();
    let mut mocks = Vec::new();
    for name in ["first", "second"] {
        let upstream: &'static MockServer = Box::leak(Box::new(MockServer::start_async().await));
        let mock = upstream
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(429)
                    .header("content-type", "application/json")
                    .body(r#"{"error":{"message":"Rate limit reached for org-secret","type":"requests"}}"#);
            })
            .await;
        fixture
            .add_channel(name, &upstream.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
            .await;
        mocks.push(mock);
        upstreams.push(upstream);
    }
    let runtime = fixture.runtime(store_backed_config(1)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    let message = body["error"]["message"].as_str().unwrap_or_default();
    assert!(message.starts_with("upstream capacity saturated (request id: "));
    assert!(!message.contains("org-secret"));
    for mock in &mocks {
        mock.assert_calls_async(1).await;
    }
}

#[tokio::test]
async fn insufficient_user_quota_is_rejected_before_the_upstream() {
    if should_skip_httpmock() {
        return;
    }
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .header("content-type", "application/json")
                .body(COMPLETION_BODY);
        })
        .await;

    let fixture = Fixture::new(0.0, 10.0).await;
    fixture
        .add_channel("primary", &upstream.base_url(), 0, "gpt-4o", pricing(0.001, 0.002))
        .await;
    let runtime = fixture.runtime(store_backed_config(2)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "insufficient_user_quota");
    mock.assert_calls_async(0).await;
}

#[tokio::test]
async fn unknown_model_has_no_channel() {
    let fixture = Fixture::new(1_000.0, 10.0).await;
    let runtime = fixture.runtime(store_backed_config(0)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("missing-model", false, &bearer()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "channel_not_found");
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let fixture = Fixture::new(1_000.0, 10.0).await;
    let runtime = fixture.runtime(store_backed_config(0)).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", bearer())
        .body(Body::from(json!({"model": "gpt-4o", "messages": []}).to_string()))
        .expect("request");
    let response = runtime.router().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let request = Request::builder()
        .method("POST")
        .uri("/v1/completions")
        .header("authorization", bearer())
        .body(Body::from(json!({"prompt": "hi"}).to_string()))
        .expect("request");
    let response = runtime.router().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap_or_default()
            .starts_with("model is required")
    );
}

#[tokio::test]
async fn missing_unknown_or_malformed_tokens_are_rejected() {
    let fixture = Fixture::new(1_000.0, 10.0).await;
    let runtime = fixture.runtime(store_backed_config(0)).await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::from("{}"))
        .expect("request");
    let response = runtime.router().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("x-request-id"));

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, "Bearer sk-doesnotexist"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "invalid_token");

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, &format!("{}-x", bearer())))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn expired_token_is_marked_and_rejected() {
    let fixture = Fixture::new(1_000.0, 10.0).await;
    let mut expired = Token::new(0, fixture.user_id, "stalekey", 5.0);
    expired.expired_time = 1;
    let expired_id = fixture.store.insert_token(&expired).await.expect("token");
    let runtime = fixture.runtime(store_backed_config(0)).await;

    let response = runtime
        .router()
        .oneshot(chat_request("gpt-4o", false, "Bearer sk-stalekey"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap_or_default()
            .starts_with("token expired")
    );

    let stored = fixture
        .store
        .get_token(expired_id)
        .await
        .expect("lookup")
        .expect("token");
    assert_eq!(stored.status, TokenStatus::Expired);
}
