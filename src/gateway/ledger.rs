use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::account_cache::{AccountCache, BalanceCheck};
use super::config::RelayConfig;
use super::meta::RelayMeta;
use super::store::RelayStore;
use super::store_types::{ConsumeLog, ModelPricing};
use crate::error::RelayError;
use crate::types::Usage;
use crate::utils::task::AbortOnDrop;

const TRUST_FACTOR: f64 = 100.0;

const MAX_REAPED_PER_PASS: usize = 1_000;

static RESERVATION_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn new_reservation_prefix() -> String {
    let seq = RESERVATION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("rsv-{}-{seq}", now_millis())
}

#[derive(Clone, Debug, PartialEq)]
pub struct Reservation {
    pub id: String,
    pub token_id: i64,
    pub user_id: i64,
    pub estimate: f64,
    pub token_reserved: f64,
}

impl Reservation {
    pub fn is_trusted(&self) -> bool {
        self.token_reserved == 0.0
    }
}

#[derive(Clone, Debug)]
pub struct Settlement {
    pub reservation: Reservation,
    pub usage: Usage,
    pub pricing: ModelPricing,
    pub channel_id: i64,
    pub model_name: String,
    pub token_name: String,
    pub is_stream: bool,
    pub elapsed_ms: i64,
}

impl Settlement {
    pub fn new(
        meta: &RelayMeta,
        reservation: Reservation,
        usage: Usage,
        pricing: ModelPricing,
    ) -> Self {
        Self {
            reservation,
            usage,
            pricing,
            channel_id: meta.channel_id,
            model_name: meta.origin_model.clone(),
            token_name: meta.token_name.clone(),
            is_stream: meta.is_stream,
            elapsed_ms: meta.elapsed_ms(),
        }
    }
}

pub struct QuotaLedger {
    store: Arc<dyn RelayStore>,
    cache: Arc<dyn AccountCache>,
    pre_consumed_quota: f64,
    log_consume_enabled: bool,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn RelayStore>,
        cache: Arc<dyn AccountCache>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            store,
            cache,
            pre_consumed_quota: config.pre_consumed_quota,
            log_consume_enabled: config.log_consume_enabled,
        }
    }

    pub fn estimate(&self, prompt_tokens: i64, max_tokens: Option<i64>, pricing: &ModelPricing) -> f64 {
        let mut estimate = self.pre_consumed_quota + prompt_tokens as f64 * pricing.prompt;
        if let Some(max_tokens) = max_tokens.filter(|max_tokens| *max_tokens != 0) {
            estimate += max_tokens as f64 * pricing.prompt;
        }
        estimate
    }

    pub async fn pre_consume(
        &self,
        meta: &RelayMeta,
        reservation_id: String,
        estimate: f64,
    ) -> Result<Reservation, RelayError> {
        let balance = match self.cache.reserve_user_quota(meta.user_id, estimate).await? {
            BalanceCheck::Granted { balance } => balance,
            BalanceCheck::Insufficient { balance } => {
                tracing::info!(
                    user_id = meta.user_id,
                    balance,
                    estimate,
                    "user quota is not enough"
                );
                return Err(RelayError::InsufficientQuota);
            }
        };

        let mut reservation = Reservation {
            id: reservation_id,
            token_id: meta.token_id,
            user_id: meta.user_id,
            estimate,
            token_reserved: 0.0,
        };
        if balance > TRUST_FACTOR * estimate {
            tracing::debug!(
                user_id = meta.user_id,
                balance,
                "user trusted, token reservation skipped"
            );
            return Ok(reservation);
        }

        match self
            .store
            .reserve_token_quota(&reservation.id, meta.token_id, estimate)
            .await
        {
            Ok(true) => reservation.token_reserved = estimate,
            Ok(false) => tracing::warn!(
                reservation = %reservation.id,
                token_id = meta.token_id,
                "reservation id already in use, token reservation skipped"
            ),
            Err(err) => tracing::warn!(
                reservation = %reservation.id,
                token_id = meta.token_id,
                error = %err,
                "token quota reservation failed"
            ),
        }
        Ok(reservation)
    }

    pub async fn return_pre_consumed(&self, reservation: Reservation) {
        if let Err(err) = self
            .cache
            .restore_user_quota(reservation.user_id, reservation.estimate)
            .await
        {
            tracing::error!(
                reservation = %reservation.id,
                error = %err,
                "failed to restore cached user quota"
            );
        }
        if reservation.token_reserved == 0.0 {
            return;
        }
        match self.store.release_reservation(&reservation.id).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                reservation = %reservation.id,
                "reservation already released"
            ),
            Err(err) => tracing::error!(
                reservation = %reservation.id,
                error = %err,
                "failed to return pre-consumed quota"
            ),
        }
    }

    pub fn spawn_return(self: &Arc<Self>, reservation: Reservation) {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            ledger.return_pre_consumed(reservation).await;
        });
    }

    pub async fn post_consume(&self, settlement: Settlement) -> f64 {
        let Settlement {
            reservation,
            usage,
            pricing,
            channel_id,
            model_name,
            token_name,
            is_stream,
            elapsed_ms,
        } = settlement;
        let quota = compute_quota(&usage, &pricing);

        if let Err(err) = self
            .store
            .settle_reservation(&reservation.id, reservation.token_id, quota)
            .await
        {
            tracing::error!(reservation = %reservation.id, error = %err, "failed to settle token quota");
        }
        if let Err(err) = self
            .store
            .record_user_consumption(reservation.user_id, quota)
            .await
        {
            tracing::error!(user_id = reservation.user_id, error = %err, "failed to debit user quota");
        }
        if let Err(err) = self.store.add_channel_used_quota(channel_id, quota).await {
            tracing::error!(channel_id, error = %err, "failed to update channel used quota");
        }
        if let Err(err) = self.cache.sync_user_quota(reservation.user_id).await {
            tracing::error!(user_id = reservation.user_id, error = %err, "failed to refresh cached user quota");
        }

        if self.log_consume_enabled {
            let log = ConsumeLog {
                id: 0,
                created_at: now_secs(),
                user_id: reservation.user_id,
                channel_id,
                model_name,
                token_name,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                quota,
                content: price_summary(&pricing),
                is_stream,
                elapsed_ms,
            };
            if let Err(err) = self.store.append_consume_log(&log).await {
                tracing::error!(error = %err, "failed to record consume log");
            }
        }
        quota
    }

    pub fn spawn_post_consume(self: &Arc<Self>, settlement: Settlement) {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            ledger.post_consume(settlement).await;
        });
    }
}

pub fn compute_quota(usage: &Usage, pricing: &ModelPricing) -> f64 {
    let cached = usage.cached_tokens();
    if cached > 0 {
        let missed = usage.prompt_tokens - cached;
        missed as f64 * pricing.prompt
            + cached as f64 * pricing.input_cache_read
            + usage.completion_tokens as f64 * pricing.completion
    } else {
        usage.prompt_tokens as f64 * pricing.prompt
            + usage.completion_tokens as f64 * pricing.completion
    }
}

fn price_summary(pricing: &ModelPricing) -> String {
    const MILLION: f64 = 1_000_000.0;
    format!(
        "prompt {:.2}/M, cached {:.2}/M, completion {:.2}/M",
        pricing.prompt * MILLION,
        pricing.input_cache_read * MILLION,
        pricing.completion * MILLION
    )
}

/// Releases reservations orphaned by a crash between pre-consume and settlement.
pub fn spawn_reservation_reaper(
    store: Arc<dyn RelayStore>,
    ttl: Duration,
    interval: Duration,
) -> AbortOnDrop {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cutoff_ts_ms = now_millis().saturating_sub(ttl.as_millis() as i64);
            match store
                .reap_stale_reservations(cutoff_ts_ms, MAX_REAPED_PER_PASS)
                .await
            {
                Ok(0) => {}
                Ok(reaped) => tracing::warn!(reaped, "released stale quota reservations"),
                Err(err) => tracing::warn!(error = %err, "stale reservation reap failed"),
            }
        }
    });
    AbortOnDrop::new(handle.abort_handle())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
