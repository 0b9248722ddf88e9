use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::account_cache::{AccountCache, BalanceCheck, check_balance};
use super::store::{RelayStore, StoreError};
use super::store_types::Token;

const RESERVE_SCRIPT: &str = r#"
local quota_key = KEYS[1]
local amount = tonumber(ARGV[1]) or 0
local refresh_threshold = tonumber(ARGV[2]) or 0

local raw = redis.call("GET", quota_key)
if not raw then
  return { "MISS" }
end
local balance = tonumber(raw) or 0
if balance <= refresh_threshold then
  return { "MISS" }
end
if balance - amount < 0 then
  return { "ERR", "insufficient", tostring(balance) }
end
redis.call("INCRBYFLOAT", quota_key, -amount)
return { "OK", tostring(balance) }
"#;

const RESTORE_SCRIPT: &str = r#"
local quota_key = KEYS[1]
if redis.call("EXISTS", quota_key) == 1 then
  redis.call("INCRBYFLOAT", quota_key, ARGV[1])
end
return { "OK" }
"#;

/// Shared cache for multi-process deployments. Balances are decremented by
/// a Lua script so the check and the decrement happen in one step on the
/// server.
pub struct RedisAccountCache {
    client: redis::Client,
    prefix: String,
    store: Arc<dyn RelayStore>,
    ttl: Duration,
    refresh_threshold: f64,
}

impl RedisAccountCache {
    pub fn new(
        url: impl AsRef<str>,
        store: Arc<dyn RelayStore>,
        ttl: Duration,
        refresh_threshold: f64,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "llm_relay".to_string(),
            store,
            ttl,
            refresh_threshold,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_token(&self, key: &str) -> String {
        format!("{}:token:{key}", self.prefix)
    }

    fn key_user_quota(&self, user_id: i64) -> String {
        format!("{}:user_quota:{user_id}", self.prefix)
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }

    async fn seed_user_quota(&self, user_id: i64) -> Result<f64, StoreError> {
        let quota = self.store.user_quota(user_id).await?;
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(self.key_user_quota(user_id), quota.to_string(), self.ttl_secs())
            .await?;
        Ok(quota)
    }

    async fn run_reserve(&self, user_id: i64, amount: f64) -> Result<Option<BalanceCheck>, StoreError> {
        let mut conn = self.connection().await?;
        let result: Vec<String> = redis::Script::new(RESERVE_SCRIPT)
            .key(self.key_user_quota(user_id))
            .arg(amount)
            .arg(self.refresh_threshold)
            .invoke_async(&mut conn)
            .await?;

        let balance = |idx: usize| {
            result
                .get(idx)
                .and_then(|raw| raw.parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        match result.first().map(|s| s.as_str()) {
            Some("MISS") => Ok(None),
            Some("OK") => Ok(Some(BalanceCheck::Granted { balance: balance(1) })),
            Some("ERR") if result.get(1).map(|s| s.as_str()) == Some("insufficient") => {
                Ok(Some(BalanceCheck::Insufficient { balance: balance(2) }))
            }
            _ => Err(redis::RedisError::from((
                redis::ErrorKind::ResponseError,
                "unexpected redis script response",
            ))
            .into()),
        }
    }
}

#[async_trait]
impl AccountCache for RedisAccountCache {
    fn is_distributed(&self) -> bool {
        true
    }

    async fn token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError> {
        let mut conn = self.connection().await?;
        let cached: Option<String> = conn.get(self.key_token(key)).await?;
        if let Some(raw) = cached {
            if let Ok(token) = serde_json::from_str::<Token>(&raw) {
                return Ok(Some(token));
            }
        }

        let token = self.store.token_by_key(key).await?;
        if let Some(token) = token.as_ref() {
            let raw = serde_json::to_string(token)?;
            let _: () = conn.set_ex(self.key_token(key), raw, self.ttl_secs()).await?;
        }
        Ok(token)
    }

    async fn forget_token(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(self.key_token(key)).await?;
        Ok(())
    }

    async fn user_quota(&self, user_id: i64) -> Result<f64, StoreError> {
        let mut conn = self.connection().await?;
        let cached: Option<String> = conn.get(self.key_user_quota(user_id)).await?;
        match cached.and_then(|raw| raw.parse::<f64>().ok()) {
            Some(quota) if quota > self.refresh_threshold => Ok(quota),
            _ => self.seed_user_quota(user_id).await,
        }
    }

    async fn reserve_user_quota(
        &self,
        user_id: i64,
        amount: f64,
    ) -> Result<BalanceCheck, StoreError> {
        if let Some(check) = self.run_reserve(user_id, amount).await? {
            return Ok(check);
        }
        let quota = self.seed_user_quota(user_id).await?;
        if let Some(check) = self.run_reserve(user_id, amount).await? {
            return Ok(check);
        }
        // Still at or below the refresh threshold after a reload.
        Ok(check_balance(quota, amount))
    }

    async fn restore_user_quota(&self, user_id: i64, amount: f64) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: Vec<String> = redis::Script::new(RESTORE_SCRIPT)
            .key(self.key_user_quota(user_id))
            .arg(amount)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sync_user_quota(&self, user_id: i64) -> Result<(), StoreError> {
        self.seed_user_quota(user_id).await?;
        Ok(())
    }
}
