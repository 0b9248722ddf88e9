use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::store::{RelayStore, StoreError};
use super::store_types::{ChannelCandidate, ModelAbility};
use crate::error::RelayError;
use crate::utils::random::random_index;
use crate::utils::task::AbortOnDrop;

#[async_trait]
pub trait ChannelSelector: Send + Sync {
    async fn candidates(&self, model: &str) -> Result<Vec<ChannelCandidate>, StoreError>;

    async fn select(
        &self,
        model: &str,
        exclude_top: bool,
        avoid: &[i64],
    ) -> Result<Option<ChannelCandidate>, RelayError> {
        let candidates = self.candidates(model).await?;
        if candidates.is_empty() {
            return Err(RelayError::ChannelNotFound {
                model: model.to_string(),
            });
        }
        Ok(pick_candidate(&candidates, exclude_top, avoid))
    }
}

/// Tiered uniform pick over `candidates` (sorted by descending priority).
///
/// The top tier is the run of channels sharing the first priority when that
/// priority is positive; otherwise every candidate is in one tier. With
/// `exclude_top` and at least two tiers the pick comes from below the top
/// tier. Channels in `avoid` are never returned; when they empty the chosen
/// tier, the pick widens to all remaining candidates.
pub fn pick_candidate(
    candidates: &[ChannelCandidate],
    exclude_top: bool,
    avoid: &[i64],
) -> Option<ChannelCandidate> {
    let first = candidates.first()?;
    let top_priority = first.priority();
    let top_len = if top_priority > 0 {
        candidates
            .iter()
            .take_while(|candidate| candidate.priority() == top_priority)
            .count()
    } else {
        candidates.len()
    };

    let tier = if exclude_top && top_len < candidates.len() {
        &candidates[top_len..]
    } else {
        &candidates[..top_len]
    };

    let usable = |pool: &[ChannelCandidate]| -> Vec<ChannelCandidate> {
        pool.iter()
            .filter(|candidate| !avoid.contains(&candidate.channel.id))
            .cloned()
            .collect()
    };
    let mut pool = usable(tier);
    if pool.is_empty() {
        pool = usable(candidates);
    }
    if pool.is_empty() {
        return None;
    }
    let idx = random_index(pool.len());
    Some(pool.swap_remove(idx))
}

#[derive(Debug, Default)]
struct Snapshot {
    by_model: HashMap<String, Vec<ChannelCandidate>>,
}

pub struct ChannelRegistry {
    store: Arc<dyn RelayStore>,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl ChannelRegistry {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn refresh(&self) -> Result<(), StoreError> {
        let channels = self.store.list_enabled_channels().await?;
        let models = self.store.list_models().await?;

        let channels: HashMap<i64, Arc<_>> = channels
            .into_iter()
            .filter(|channel| channel.is_enabled())
            .map(|channel| (channel.id, Arc::new(channel)))
            .collect();

        let mut by_model: HashMap<String, Vec<ChannelCandidate>> = HashMap::new();
        for ability in models.into_iter().filter(|model| model.enabled) {
            let Some(channel) = channels.get(&ability.channel_id) else {
                continue;
            };
            by_model
                .entry(ability.name.clone())
                .or_default()
                .push(ChannelCandidate {
                    channel: channel.clone(),
                    ability: Arc::new(ability),
                });
        }
        for candidates in by_model.values_mut() {
            sort_candidates(candidates);
        }

        let model_count = by_model.len();
        let snapshot = Arc::new(Snapshot { by_model });
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
        tracing::debug!(
            channels = channels.len(),
            models = model_count,
            "channel registry refreshed"
        );
        Ok(())
    }

    pub fn spawn_sync(self: &Arc<Self>, interval: Duration) -> AbortOnDrop {
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the caller already refreshed.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = registry.refresh().await {
                    tracing::warn!(error = %err, "channel registry refresh failed");
                }
            }
        });
        AbortOnDrop::new(handle.abort_handle())
    }
}

#[async_trait]
impl ChannelSelector for ChannelRegistry {
    async fn candidates(&self, model: &str) -> Result<Vec<ChannelCandidate>, StoreError> {
        Ok(self
            .current()
            .by_model
            .get(model)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct StoreSelector {
    store: Arc<dyn RelayStore>,
}

impl StoreSelector {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChannelSelector for StoreSelector {
    async fn candidates(&self, model: &str) -> Result<Vec<ChannelCandidate>, StoreError> {
        let mut candidates = self.store.channel_candidates(model).await?;
        sort_candidates(&mut candidates);
        Ok(candidates)
    }
}

fn sort_candidates(candidates: &mut [ChannelCandidate]) {
    candidates.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.channel.name.cmp(&b.channel.name))
            .then_with(|| a.channel.id.cmp(&b.channel.id))
    });
}

pub async fn pinned_candidate(
    store: &dyn RelayStore,
    channel_id: i64,
    model: &str,
) -> Result<ChannelCandidate, RelayError> {
    let channel = store
        .get_channel(channel_id)
        .await?
        .filter(|channel| channel.is_enabled())
        .ok_or_else(|| RelayError::ChannelNotFound {
            model: model.to_string(),
        })?;
    let ability: ModelAbility = store
        .model_ability(channel_id, model)
        .await?
        .filter(|ability| ability.enabled)
        .ok_or_else(|| RelayError::ModelConfigNotFound {
            model: model.to_string(),
            channel_id,
        })?;
    Ok(ChannelCandidate {
        channel: Arc::new(channel),
        ability: Arc::new(ability),
    })
}
