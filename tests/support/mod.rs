#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, Response};
use llm_relay::gateway::store_types::{
    Channel, ChannelType, ConsumeLog, ModelAbility, ModelPricing, Token, User,
};
use llm_relay::gateway::{RelayConfig, RelayRuntime, RelayStore, SqliteStore};
use serde_json::Value;
use tempfile::TempDir;

pub const TOKEN_KEY: &str = "relaytestkey";

pub struct Fixture {
    _dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub user_id: i64,
    pub token_id: i64,
}

impl Fixture {
    pub async fn new(user_quota: f64, token_quota: f64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("relay.sqlite"));
        store.init().await.expect("init store");

        let user_id = store
            .insert_user(&User {
                id: 0,
                quota: user_quota,
                used_quota: 0.0,
                request_count: 0,
            })
            .await
            .expect("user");
        let token_id = store
            .insert_token(&Token::new(0, user_id, TOKEN_KEY, token_quota))
            .await
            .expect("token");

        Self {
            _dir: dir,
            store: Arc::new(store),
            user_id,
            token_id,
        }
    }

    /// Adds an OpenAI channel pointed at `base_url` serving `model`.
    pub async fn add_channel(
        &self,
        name: &str,
        base_url: &str,
        priority: i64,
        model: &str,
        pricing: ModelPricing,
    ) -> i64 {
        self.add_mapped_channel(name, base_url, priority, model, None, pricing)
            .await
    }

    pub async fn add_mapped_channel(
        &self,
        name: &str,
        base_url: &str,
        priority: i64,
        model: &str,
        mapped_name: Option<&str>,
        pricing: ModelPricing,
    ) -> i64 {
        let mut channel = Channel::new(0, name, ChannelType::OpenAi);
        channel.key = format!("sk-upstream-{name}");
        channel.base_url = Some(base_url.to_string());
        channel.priority = priority;
        let channel_id = self.store.insert_channel(&channel).await.expect("channel");

        let mut ability = ModelAbility::new(channel_id, model).with_pricing(pricing);
        ability.mapped_name = mapped_name.map(str::to_string);
        self.store
            .upsert_models(&[ability])
            .await
            .expect("model ability");
        channel_id
    }

    pub async fn runtime(&self, config: RelayConfig) -> RelayRuntime {
        RelayRuntime::build(config, self.store.clone())
            .await
            .expect("relay runtime")
    }

    pub async fn token(&self) -> Token {
        self.store
            .get_token(self.token_id)
            .await
            .expect("token lookup")
            .expect("token exists")
    }

    pub async fn user(&self) -> User {
        self.store
            .get_user(self.user_id)
            .await
            .expect("user lookup")
            .expect("user exists")
    }

    /// Waits for the detached settlement task to write its log.
    pub async fn wait_for_logs(&self, count: usize) -> Vec<ConsumeLog> {
        for _ in 0..100 {
            let logs = self.store.list_consume_logs(10).await.expect("logs");
            if logs.len() >= count {
                return logs;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {count} consume logs");
    }

    /// Waits until every detached refund has consumed its reservation.
    pub async fn wait_for_released_reservations(&self) {
        for _ in 0..100 {
            if self.store.pending_reservations().await.expect("pending") == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for reservations to be released");
    }
}

pub fn pricing(prompt: f64, completion: f64) -> ModelPricing {
    ModelPricing {
        prompt,
        completion,
        ..ModelPricing::default()
    }
}

/// Config that reads routing and balances straight from the store.
pub fn store_backed_config(retry_times: u32) -> RelayConfig {
    RelayConfig {
        memory_cache_enabled: false,
        retry_times,
        ..RelayConfig::default()
    }
}

pub fn chat_request(model: &str, stream: bool, authorization: &str) -> Request<Body> {
    let body = serde_json::json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": "hello there"}],
    });
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", authorization)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub fn bearer() -> String {
    format!("Bearer sk-{TOKEN_KEY}")
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
