use std::fmt;
use std::time::Instant;

use super::store_types::{ApiType, ChannelCandidate, ChannelConfig, ChannelType, Token};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    Edits,
    Unknown,
}

impl RelayMode {
    pub fn from_path(path: &str) -> Self {
        let path = path
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(path)
            .trim_end_matches('/');
        if path.starts_with("/v1/chat/completions") {
            Self::ChatCompletions
        } else if path.starts_with("/v1/completions") {
            Self::Completions
        } else if path.starts_with("/v1/embeddings") || path.ends_with("embeddings") {
            Self::Embeddings
        } else if path.starts_with("/v1/moderations") {
            Self::Moderations
        } else if path.starts_with("/v1/edits") {
            Self::Edits
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
            Self::Moderations => "moderations",
            Self::Edits => "edits",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct RelayMeta {
    pub request_id: String,
    pub mode: RelayMode,
    pub token_id: i64,
    pub token_name: String,
    pub user_id: i64,
    pub pinned_channel: Option<i64>,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub api_type: ApiType,
    pub base_url: String,
    pub api_key: String,
    pub config: ChannelConfig,
    pub origin_model: String,
    pub actual_model: String,
    pub is_stream: bool,
    pub request_path: String,
    pub prompt_tokens: i64,
    pub force_include_usage: bool,
    pub started_at: Instant,
}

impl fmt::Debug for RelayMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayMeta")
            .field("request_id", &self.request_id)
            .field("mode", &self.mode)
            .field("token_id", &self.token_id)
            .field("user_id", &self.user_id)
            .field("pinned_channel", &self.pinned_channel)
            .field("channel_id", &self.channel_id)
            .field("channel_type", &self.channel_type)
            .field("api_type", &self.api_type)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("origin_model", &self.origin_model)
            .field("actual_model", &self.actual_model)
            .field("is_stream", &self.is_stream)
            .field("request_path", &self.request_path)
            .field("prompt_tokens", &self.prompt_tokens)
            .finish()
    }
}

impl RelayMeta {
    pub fn new(
        request_id: impl Into<String>,
        request_path: impl Into<String>,
        token: &Token,
        pinned_channel: Option<i64>,
    ) -> Self {
        let request_path = request_path.into();
        Self {
            request_id: request_id.into(),
            mode: RelayMode::from_path(&request_path),
            token_id: token.id,
            token_name: token.name.clone(),
            user_id: token.user_id,
            pinned_channel,
            channel_id: 0,
            channel_type: ChannelType::Unknown,
            api_type: ApiType::Unknown,
            base_url: String::new(),
            api_key: String::new(),
            config: ChannelConfig::default(),
            origin_model: String::new(),
            actual_model: String::new(),
            is_stream: false,
            request_path,
            prompt_tokens: 0,
            force_include_usage: false,
            started_at: Instant::now(),
        }
    }

    pub fn assign_channel(&mut self, candidate: &ChannelCandidate) {
        let channel = &candidate.channel;
        self.channel_id = channel.id;
        self.channel_type = channel.channel_type;
        self.api_type = channel.channel_type.api_type();
        self.base_url = channel.effective_base_url();
        self.api_key = channel.key.clone();
        self.config = channel.config.clone();
        self.actual_model = candidate.ability.upstream_name().to_string();
    }

    pub fn is_model_mapped(&self) -> bool {
        self.actual_model != self.origin_model
    }

    pub fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}
