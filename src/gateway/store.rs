use async_trait::async_trait;
use thiserror::Error;

use super::store_types::{
    Channel, ChannelCandidate, ConsumeLog, ModelAbility, Token, TokenStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn list_enabled_channels(&self) -> Result<Vec<Channel>, StoreError>;

    async fn list_models(&self) -> Result<Vec<ModelAbility>, StoreError>;

    async fn get_channel(&self, channel_id: i64) -> Result<Option<Channel>, StoreError>;

    async fn channel_candidates(&self, model: &str) -> Result<Vec<ChannelCandidate>, StoreError>;

    async fn model_ability(
        &self,
        channel_id: i64,
        model: &str,
    ) -> Result<Option<ModelAbility>, StoreError>;

    async fn enabled_model_names(&self) -> Result<Vec<String>, StoreError>;

    async fn upsert_models(&self, models: &[ModelAbility]) -> Result<(), StoreError>;

    async fn token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError>;

    async fn set_token_status(&self, token_id: i64, status: TokenStatus)
    -> Result<(), StoreError>;

    async fn user_quota(&self, user_id: i64) -> Result<f64, StoreError>;

    /// Returns `false` without debiting when `reservation_id` is already
    /// recorded.
    async fn reserve_token_quota(
        &self,
        reservation_id: &str,
        token_id: i64,
        amount: f64,
    ) -> Result<bool, StoreError>;

    async fn release_reservation(&self, reservation_id: &str) -> Result<bool, StoreError>;

    async fn settle_reservation(
        &self,
        reservation_id: &str,
        token_id: i64,
        actual: f64,
    ) -> Result<(), StoreError>;

    async fn reap_stale_reservations(
        &self,
        cutoff_ts_ms: i64,
        max_reaped: usize,
    ) -> Result<usize, StoreError>;

    async fn record_user_consumption(&self, user_id: i64, quota: f64) -> Result<(), StoreError>;

    async fn add_channel_used_quota(&self, channel_id: i64, quota: f64)
    -> Result<(), StoreError>;

    async fn append_consume_log(&self, log: &ConsumeLog) -> Result<i64, StoreError>;
}
