use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt as _;
use tracing::Instrument as _;

use super::account_cache::AccountCache;
use super::adaptor::{AdaptorResponse, BodyStream, StreamTracker, get_adaptor};
use super::channel_cache::{ChannelSelector, pinned_candidate};
use super::config::RelayConfig;
use super::ledger::{QuotaLedger, Reservation, Settlement, new_reservation_prefix};
use super::meta::{RelayMeta, RelayMode};
use super::store::RelayStore;
use super::store_types::{ApiType, ModelPricing, Token, TokenStatus};
use super::token_count::count_prompt_tokens;
use crate::error::RelayError;
use crate::types::{GeneralRequest, ModelList, ModelObject};

const MAX_TOKENS_LIMIT: i64 = (i32::MAX / 2) as i64;

pub const SATURATED_MESSAGE: &str = "upstream capacity saturated";

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub token: Token,
    pub pinned_channel: Option<i64>,
}

pub enum RelayBody {
    Full(Bytes),
    Stream(BodyStream),
}

pub struct RelayOutput {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: RelayBody,
}

pub struct Relay {
    config: Arc<RelayConfig>,
    store: Arc<dyn RelayStore>,
    cache: Arc<dyn AccountCache>,
    selector: Arc<dyn ChannelSelector>,
    ledger: Arc<QuotaLedger>,
    http: reqwest::Client,
}

impl Relay {
    pub fn new(
        config: Arc<RelayConfig>,
        store: Arc<dyn RelayStore>,
        cache: Arc<dyn AccountCache>,
        selector: Arc<dyn ChannelSelector>,
    ) -> Self {
        let mut http = reqwest::Client::builder();
        if config.relay_timeout_secs > 0 {
            http = http.timeout(Duration::from_secs(config.relay_timeout_secs));
        }
        let http = http.build().unwrap_or_else(|_| reqwest::Client::new());
        let ledger = Arc::new(QuotaLedger::new(store.clone(), cache.clone(), &config));
        Self {
            config,
            store,
            cache,
            selector,
            ledger,
            http,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn authenticate(&self, authorization: Option<&str>) -> Result<AuthContext, RelayError> {
        let (key, pinned_channel) = parse_authorization(authorization)?;
        let token = self
            .cache
            .token_by_key(&key)
            .await?
            .ok_or_else(|| auth_error("invalid token"))?;

        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Exhausted => return Err(auth_error("token quota exhausted")),
            TokenStatus::Expired => return Err(auth_error("token expired")),
            TokenStatus::Disabled => return Err(auth_error("token status unavailable")),
        }
        if token.is_expired_at(now_secs()) {
            self.mark_token(&token, TokenStatus::Expired).await;
            return Err(auth_error("token expired"));
        }
        if token.is_exhausted() {
            self.mark_token(&token, TokenStatus::Exhausted).await;
            return Err(auth_error("token quota exhausted"));
        }
        Ok(AuthContext {
            token,
            pinned_channel,
        })
    }

    async fn mark_token(&self, token: &Token, status: TokenStatus) {
        if self.cache.is_distributed() {
            return;
        }
        if let Err(err) = self.store.set_token_status(token.id, status).await {
            tracing::error!(token_id = token.id, error = %err, "failed to update token status");
            return;
        }
        if let Err(err) = self.cache.forget_token(&token.key).await {
            tracing::warn!(token_id = token.id, error = %err, "failed to evict cached token");
        }
    }

    pub async fn relay(
        &self,
        auth: AuthContext,
        request_id: String,
        path: &str,
        body: Bytes,
    ) -> Result<RelayOutput, RelayError> {
        let span = tracing::info_span!(
            "relay",
            request_id = %request_id,
            path = %path,
            model = tracing::field::Empty,
            channel_id = tracing::field::Empty,
            status = tracing::field::Empty,
        );
        let result = self
            .relay_inner(auth, request_id, path, body)
            .instrument(span.clone())
            .await;
        let status = match &result {
            Ok(output) => output.status,
            Err(err) => err.status(),
        };
        span.record("status", status.as_u16());
        result
    }

    async fn relay_inner(
        &self,
        auth: AuthContext,
        request_id: String,
        path: &str,
        body: Bytes,
    ) -> Result<RelayOutput, RelayError> {
        let mut meta = RelayMeta::new(request_id, path, &auth.token, auth.pinned_channel);
        let request: GeneralRequest = serde_json::from_slice(&body)
            .map_err(|err| RelayError::invalid_request(format!("invalid request body: {err}")))?;
        validate_request(meta.mode, &request)?;

        meta.origin_model = request.model.clone();
        meta.actual_model = request.model.clone();
        meta.is_stream = request.stream;
        meta.force_include_usage = self.config.enforce_include_usage;
        meta.prompt_tokens = count_prompt_tokens(meta.mode, &request.model, &request);
        tracing::Span::current().record("model", meta.origin_model.as_str());

        let attempts = if meta.pinned_channel.is_some() {
            1
        } else {
            self.config.retry_times.saturating_add(1)
        };
        let mut failed_channels: Vec<i64> = Vec::new();
        let mut last_error: Option<RelayError> = None;
        let reservation_prefix = new_reservation_prefix();

        for attempt in 0..attempts {
            let candidate = match meta.pinned_channel {
                Some(channel_id) => {
                    pinned_candidate(self.store.as_ref(), channel_id, &meta.origin_model).await?
                }
                None => {
                    let picked = self
                        .selector
                        .select(&meta.origin_model, attempt > 0, &failed_channels)
                        .await?;
                    match picked {
                        Some(candidate) => candidate,
                        None => {
                            tracing::debug!(attempt, "no untried channel left");
                            break;
                        }
                    }
                }
            };
            let pricing =
                candidate
                    .ability
                    .pricing
                    .ok_or_else(|| RelayError::ModelConfigNotFound {
                        model: meta.origin_model.clone(),
                        channel_id: candidate.channel.id,
                    })?;
            meta.assign_channel(&candidate);
            tracing::Span::current().record("channel_id", meta.channel_id);

            let estimate = self
                .ledger
                .estimate(meta.prompt_tokens, request.max_tokens, &pricing);
            let reservation = self
                .ledger
                .pre_consume(&meta, format!("{reservation_prefix}-{attempt}"), estimate)
                .await?;

            match self.attempt(&meta, &request, &body).await {
                Ok(response) => return Ok(self.deliver(meta, reservation, pricing, response)),
                Err(err) => {
                    self.ledger.spawn_return(reservation);
                    let status = err.status();
                    tracing::warn!(
                        attempt,
                        channel_id = meta.channel_id,
                        user_id = meta.user_id,
                        status = status.as_u16(),
                        error = %err,
                        "relay attempt failed"
                    );
                    failed_channels.push(meta.channel_id);
                    let retry = should_retry(meta.pinned_channel.is_some(), status);
                    last_error = Some(err);
                    if !retry {
                        break;
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| RelayError::ChannelNotFound {
            model: meta.origin_model.clone(),
        });
        Err(saturate_rate_limit(err))
    }

    async fn attempt(
        &self,
        meta: &RelayMeta,
        request: &GeneralRequest,
        raw_body: &Bytes,
    ) -> Result<AdaptorResponse, RelayError> {
        let mut adaptor = get_adaptor(meta.api_type, self.http.clone())?;
        adaptor.initialize(meta);

        let needs_translation =
            meta.force_include_usage || meta.is_model_mapped() || meta.api_type != ApiType::OpenAi;
        let body = if needs_translation {
            let mut request = request.clone();
            request.model = meta.actual_model.clone();
            let translated = adaptor.translate_request(meta.mode, request)?;
            Bytes::from(serde_json::to_vec(&translated).map_err(super::adaptor::AdaptorError::from)?)
        } else {
            raw_body.clone()
        };

        let response = adaptor.execute(meta, body).await?;
        Ok(adaptor.translate_response(meta, response).await?)
    }

    fn deliver(
        &self,
        meta: RelayMeta,
        reservation: Reservation,
        pricing: ModelPricing,
        response: AdaptorResponse,
    ) -> RelayOutput {
        match response {
            AdaptorResponse::Complete {
                status,
                headers,
                body,
                usage,
            } => {
                self.ledger
                    .spawn_post_consume(Settlement::new(&meta, reservation, usage, pricing));
                RelayOutput {
                    status,
                    headers,
                    body: RelayBody::Full(body),
                }
            }
            AdaptorResponse::Stream {
                status,
                headers,
                body,
                tracker,
            } => RelayOutput {
                status,
                headers,
                body: RelayBody::Stream(settle_on_completion(
                    body,
                    tracker,
                    StreamFinalizer {
                        ledger: self.ledger.clone(),
                        meta,
                        reservation,
                        pricing,
                    },
                )),
            },
        }
    }

    pub async fn list_models(&self) -> Result<ModelList, RelayError> {
        let names = self.store.enabled_model_names().await?;
        Ok(ModelList {
            object: "list".to_string(),
            data: names.into_iter().map(ModelObject::custom).collect(),
        })
    }

    pub async fn retrieve_model(&self, model: &str) -> Result<Option<ModelObject>, RelayError> {
        let names = self.store.enabled_model_names().await?;
        Ok(names
            .into_iter()
            .find(|name| name == model)
            .map(ModelObject::custom))
    }

    pub async fn import_models(&self, channel_id: i64) -> Result<usize, RelayError> {
        let channel = self
            .store
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| RelayError::Internal {
                code: "channel_not_found",
                message: format!("channel {channel_id} does not exist"),
            })?;
        let adaptor = get_adaptor(channel.channel_type.api_type(), self.http.clone())?;
        let models = adaptor
            .list_remote_models(&channel.effective_base_url(), &channel.key)
            .await?;
        let abilities: Vec<_> = models
            .into_iter()
            .map(|model| model.into_ability(channel_id))
            .collect();
        self.store.upsert_models(&abilities).await?;
        tracing::info!(channel_id, models = abilities.len(), "imported upstream models");
        Ok(abilities.len())
    }
}

fn auth_error(message: impl Into<String>) -> RelayError {
    RelayError::Auth {
        message: message.into(),
    }
}

pub fn parse_authorization(header: Option<&str>) -> Result<(String, Option<i64>), RelayError> {
    let raw = header.unwrap_or_default().trim();
    let raw = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    let raw = raw.strip_prefix("sk-").unwrap_or(raw);
    let mut parts = raw.split('-');
    let key = parts.next().unwrap_or_default();
    if key.is_empty() {
        return Err(auth_error("no token provided"));
    }
    let pinned = match parts.next() {
        Some(channel) => Some(
            channel
                .parse::<i64>()
                .map_err(|_| RelayError::invalid_request("invalid channel id in token"))?,
        ),
        None => None,
    };
    Ok((key.to_string(), pinned))
}

pub fn validate_request(mode: RelayMode, request: &GeneralRequest) -> Result<(), RelayError> {
    if let Some(max_tokens) = request.max_tokens {
        if !(0..=MAX_TOKENS_LIMIT).contains(&max_tokens) {
            return Err(RelayError::invalid_request("max_tokens is invalid"));
        }
    }
    if request.model.is_empty() {
        return Err(RelayError::invalid_request("model is required"));
    }
    match mode {
        RelayMode::Completions if request.prompt.is_none() => {
            Err(RelayError::invalid_request("field prompt is required"))
        }
        RelayMode::ChatCompletions
            if request.messages.as_ref().is_none_or(|messages| messages.is_empty()) =>
        {
            Err(RelayError::invalid_request("field messages is required"))
        }
        RelayMode::Embeddings | RelayMode::Moderations if request.input.is_none() => {
            Err(RelayError::invalid_request("field input is required"))
        }
        RelayMode::Edits if request.instruction.as_deref().is_none_or(str::is_empty) => {
            Err(RelayError::invalid_request("field instruction is required"))
        }
        _ => Ok(()),
    }
}

/// Retry on 429, any 5xx, and any other non-2xx except 400. Pinned requests
/// never retry.
pub fn should_retry(pinned: bool, status: StatusCode) -> bool {
    if pinned {
        return false;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return true;
    }
    if status == StatusCode::BAD_REQUEST || status.is_success() {
        return false;
    }
    true
}

fn saturate_rate_limit(err: RelayError) -> RelayError {
    match err {
        RelayError::Upstream {
            status, kind, code, ..
        } if status == StatusCode::TOO_MANY_REQUESTS => RelayError::Upstream {
            status,
            message: SATURATED_MESSAGE.to_string(),
            kind,
            code,
        },
        other => other,
    }
}

struct StreamFinalizer {
    ledger: Arc<QuotaLedger>,
    meta: RelayMeta,
    reservation: Reservation,
    pricing: ModelPricing,
}

enum StreamEnd {
    Completed,
    Error,
}

struct RelayStreamState {
    upstream: BodyStream,
    tracker: Box<dyn StreamTracker>,
    finalizer: Option<StreamFinalizer>,
}

impl RelayStreamState {
    fn finalize(&mut self, end: StreamEnd) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let StreamFinalizer {
            ledger,
            meta,
            reservation,
            pricing,
        } = finalizer;
        match end {
            StreamEnd::Completed => {
                let usage = self.tracker.finish();
                ledger.spawn_post_consume(Settlement::new(&meta, reservation, usage, pricing));
            }
            StreamEnd::Error => ledger.spawn_return(reservation),
        }
    }
}

impl Drop for RelayStreamState {
    fn drop(&mut self) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        tracing::info!(
            request_id = %finalizer.meta.request_id,
            "stream dropped before completion; returning reservation"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let StreamFinalizer {
                    ledger,
                    reservation,
                    ..
                } = finalizer;
                handle.spawn(async move {
                    ledger.return_pre_consumed(reservation).await;
                });
            }
            Err(_) => tracing::warn!(
                reservation = %finalizer.reservation.id,
                "no runtime available to return reservation"
            ),
        }
    }
}

/// Forwards the upstream stream unchanged, settling when it ends and
/// refunding when it fails or is dropped early.
fn settle_on_completion(
    upstream: BodyStream,
    tracker: Box<dyn StreamTracker>,
    finalizer: StreamFinalizer,
) -> BodyStream {
    let state = RelayStreamState {
        upstream,
        tracker,
        finalizer: Some(finalizer),
    };
    futures_util::stream::try_unfold(state, |mut state| async move {
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                state.tracker.ingest(&chunk);
                Ok(Some((chunk, state)))
            }
            Some(Err(err)) => {
                state.finalize(StreamEnd::Error);
                Err(err)
            }
            None => {
                state.finalize(StreamEnd::Completed);
                Ok(None)
            }
        }
    })
    .boxed()
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
