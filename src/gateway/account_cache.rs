use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::config::{AccountCacheKind, RelayConfig};
use super::store::{RelayStore, StoreError};
use super::store_types::Token;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BalanceCheck {
    Granted { balance: f64 },
    Insufficient { balance: f64 },
}

#[async_trait]
pub trait AccountCache: Send + Sync {
    fn is_distributed(&self) -> bool;

    async fn token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError>;

    async fn forget_token(&self, key: &str) -> Result<(), StoreError>;

    async fn user_quota(&self, user_id: i64) -> Result<f64, StoreError>;

    async fn reserve_user_quota(&self, user_id: i64, amount: f64)
    -> Result<BalanceCheck, StoreError>;

    async fn restore_user_quota(&self, user_id: i64, amount: f64) -> Result<(), StoreError>;

    async fn sync_user_quota(&self, user_id: i64) -> Result<(), StoreError>;
}

pub async fn build_account_cache(
    config: &RelayConfig,
    store: Arc<dyn RelayStore>,
) -> Result<Arc<dyn AccountCache>, StoreError> {
    let ttl = Duration::from_secs(config.sync_frequency_secs.max(1));
    match config.account_cache {
        AccountCacheKind::Store => Ok(Arc::new(StoreAccountCache::new(store))),
        AccountCacheKind::Memory => Ok(Arc::new(MemoryAccountCache::new(
            store,
            ttl,
            config.pre_consumed_quota,
        ))),
        #[cfg(feature = "store-redis")]
        AccountCacheKind::Redis => {
            let url = config.redis_url.as_deref().unwrap_or_default();
            let cache = super::redis_cache::RedisAccountCache::new(
                url,
                store,
                ttl,
                config.pre_consumed_quota,
            )?
            .with_prefix(config.redis_prefix.clone());
            cache.ping().await?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "store-redis"))]
        AccountCacheKind::Redis => {
            tracing::warn!("redis account cache requested but the store-redis feature is off");
            Ok(Arc::new(MemoryAccountCache::new(
                store,
                ttl,
                config.pre_consumed_quota,
            )))
        }
    }
}

pub struct StoreAccountCache {
    store: Arc<dyn RelayStore>,
}

impl StoreAccountCache {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AccountCache for StoreAccountCache {
    fn is_distributed(&self) -> bool {
        false
    }

    async fn token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError> {
        self.store.token_by_key(key).await
    }

    async fn forget_token(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn user_quota(&self, user_id: i64) -> Result<f64, StoreError> {
        self.store.user_quota(user_id).await
    }

    async fn reserve_user_quota(
        &self,
        user_id: i64,
        amount: f64,
    ) -> Result<BalanceCheck, StoreError> {
        let balance = self.store.user_quota(user_id).await?;
        Ok(check_balance(balance, amount))
    }

    async fn restore_user_quota(&self, _user_id: i64, _amount: f64) -> Result<(), StoreError> {
        Ok(())
    }

    async fn sync_user_quota(&self, _user_id: i64) -> Result<(), StoreError> {
        Ok(())
    }
}

pub(crate) fn check_balance(balance: f64, amount: f64) -> BalanceCheck {
    if balance - amount < 0.0 {
        BalanceCheck::Insufficient { balance }
    } else {
        BalanceCheck::Granted { balance }
    }
}

#[derive(Clone, Copy, Debug)]
struct CachedBalance {
    quota: f64,
    loaded_at: Instant,
}

#[derive(Default)]
struct MemoryEntries {
    tokens: HashMap<String, (Token, Instant)>,
    balances: HashMap<i64, CachedBalance>,
}

/// A cached balance at or below `refresh_threshold` is reloaded from the
/// store before it is trusted.
pub struct MemoryAccountCache {
    store: Arc<dyn RelayStore>,
    ttl: Duration,
    refresh_threshold: f64,
    entries: Mutex<MemoryEntries>,
}

impl MemoryAccountCache {
    pub fn new(store: Arc<dyn RelayStore>, ttl: Duration, refresh_threshold: f64) -> Self {
        Self {
            store,
            ttl,
            refresh_threshold,
            entries: Mutex::new(MemoryEntries::default()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, MemoryEntries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_fresh(&self, cached: &CachedBalance) -> bool {
        cached.loaded_at.elapsed() < self.ttl && cached.quota > self.refresh_threshold
    }

    fn fresh_balance(&self, user_id: i64) -> Option<f64> {
        let entries = self.entries();
        let cached = entries.balances.get(&user_id)?;
        self.is_fresh(cached).then_some(cached.quota)
    }

    async fn load_balance(&self, user_id: i64) -> Result<f64, StoreError> {
        if let Some(quota) = self.fresh_balance(user_id) {
            return Ok(quota);
        }
        let quota = self.store.user_quota(user_id).await?;

        // Another request may have loaded and decremented the entry while the
        // store read was in flight; keep its value.
        let mut entries = self.entries();
        let current = entries
            .balances
            .get(&user_id)
            .copied()
            .filter(|cached| self.is_fresh(cached));
        if let Some(cached) = current {
            return Ok(cached.quota);
        }
        entries.balances.insert(
            user_id,
            CachedBalance {
                quota,
                loaded_at: Instant::now(),
            },
        );
        Ok(quota)
    }
}

#[async_trait]
impl AccountCache for MemoryAccountCache {
    fn is_distributed(&self) -> bool {
        false
    }

    async fn token_by_key(&self, key: &str) -> Result<Option<Token>, StoreError> {
        {
            let entries = self.entries();
            if let Some((token, loaded_at)) = entries.tokens.get(key) {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(Some(token.clone()));
                }
            }
        }
        let token = self.store.token_by_key(key).await?;
        if let Some(token) = token.as_ref() {
            self.entries()
                .tokens
                .insert(key.to_string(), (token.clone(), Instant::now()));
        }
        Ok(token)
    }

    async fn forget_token(&self, key: &str) -> Result<(), StoreError> {
        self.entries().tokens.remove(key);
        Ok(())
    }

    async fn user_quota(&self, user_id: i64) -> Result<f64, StoreError> {
        self.load_balance(user_id).await
    }

    async fn reserve_user_quota(
        &self,
        user_id: i64,
        amount: f64,
    ) -> Result<BalanceCheck, StoreError> {
        self.load_balance(user_id).await?;

        let mut entries = self.entries();
        let Some(cached) = entries.balances.get_mut(&user_id) else {
            return Err(StoreError::NotFound {
                entity: "user",
                id: user_id.to_string(),
            });
        };
        let check = check_balance(cached.quota, amount);
        if matches!(check, BalanceCheck::Granted { .. }) {
            cached.quota -= amount;
        }
        Ok(check)
    }

    async fn restore_user_quota(&self, user_id: i64, amount: f64) -> Result<(), StoreError> {
        if let Some(cached) = self.entries().balances.get_mut(&user_id) {
            cached.quota += amount;
        }
        Ok(())
    }

    async fn sync_user_quota(&self, user_id: i64) -> Result<(), StoreError> {
        let quota = self.store.user_quota(user_id).await?;
        self.entries().balances.insert(
            user_id,
            CachedBalance {
                quota,
                loaded_at: Instant::now(),
            },
        );
        Ok(())
    }
}
