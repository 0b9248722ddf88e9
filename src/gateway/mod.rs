//! Relay gateway: routing snapshot, quota ledger, adaptors and the HTTP
//! surface that ties them together.

pub mod account_cache;
pub mod adaptor;
pub mod channel_cache;
pub mod config;
pub mod http;
pub mod ledger;
pub mod meta;
pub mod observability;
#[cfg(feature = "store-redis")]
pub mod redis_cache;
pub mod relay;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod store_types;
pub mod token_count;

use std::sync::Arc;
use std::time::Duration;

use crate::error::RelayError;
use crate::utils::task::AbortOnDrop;

use account_cache::build_account_cache;
use channel_cache::{ChannelRegistry, ChannelSelector, StoreSelector};
use ledger::spawn_reservation_reaper;

pub use config::{AccountCacheKind, ConfigError, RelayConfig};
pub use http::{RelayHttpState, router};
pub use relay::{AuthContext, Relay, RelayBody, RelayOutput};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;
pub use store::{RelayStore, StoreError};

pub struct RelayRuntime {
    relay: Arc<Relay>,
    _registry_sync: Option<AbortOnDrop>,
    _reservation_reaper: Option<AbortOnDrop>,
}

impl RelayRuntime {
    pub async fn build(config: RelayConfig, store: Arc<dyn RelayStore>) -> Result<Self, RelayError> {
        let config = Arc::new(config);
        let cache = build_account_cache(&config, store.clone()).await?;

        let mut registry_sync = None;
        let selector: Arc<dyn ChannelSelector> = if config.memory_cache_enabled {
            let registry = Arc::new(ChannelRegistry::new(store.clone()));
            registry.refresh().await?;
            registry_sync = Some(
                registry.spawn_sync(Duration::from_secs(config.sync_frequency_secs.max(1))),
            );
            registry
        } else {
            Arc::new(StoreSelector::new(store.clone()))
        };

        let reservation_reaper = (config.reservation_ttl_secs > 0).then(|| {
            spawn_reservation_reaper(
                store.clone(),
                Duration::from_secs(config.reservation_ttl_secs),
                Duration::from_secs(config.reservation_ttl_secs.min(60)),
            )
        });

        tracing::info!(
            memory_cache = config.memory_cache_enabled,
            account_cache = ?config.account_cache,
            retry_times = config.retry_times,
            "relay initialised"
        );
        Ok(Self {
            relay: Arc::new(Relay::new(config, store, cache, selector)),
            _registry_sync: registry_sync,
            _reservation_reaper: reservation_reaper,
        })
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    pub fn router(&self) -> axum::Router {
        router(RelayHttpState::new(self.relay.clone()))
    }
}
