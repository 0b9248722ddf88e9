use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    #[default]
    Unknown,
    OpenAi,
    OpenRouter,
    OpenAiCompatible,
    Azure,
    Anthropic,
    Gemini,
    Ollama,
    DeepSeek,
    Cloudflare,
    Xai,
}

impl ChannelType {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::OpenAi,
            2 => Self::OpenRouter,
            3 => Self::OpenAiCompatible,
            4 => Self::Azure,
            5 => Self::Anthropic,
            6 => Self::Gemini,
            7 => Self::Ollama,
            8 => Self::DeepSeek,
            9 => Self::Cloudflare,
            10 => Self::Xai,
            _ => Self::Unknown,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::OpenAi => 1,
            Self::OpenRouter => 2,
            Self::OpenAiCompatible => 3,
            Self::Azure => 4,
            Self::Anthropic => 5,
            Self::Gemini => 6,
            Self::Ollama => 7,
            Self::DeepSeek => 8,
            Self::Cloudflare => 9,
            Self::Xai => 10,
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::OpenRouter => "https://openrouter.ai/api",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
            Self::DeepSeek => "https://api.deepseek.com",
            Self::Cloudflare => "https://api.cloudflare.com",
            Self::Xai => "https://api.x.ai",
            Self::Unknown | Self::OpenAiCompatible | Self::Azure | Self::Ollama => "",
        }
    }

    pub fn api_type(self) -> ApiType {
        match self {
            Self::OpenAi
            | Self::OpenRouter
            | Self::OpenAiCompatible
            | Self::Azure
            | Self::DeepSeek
            | Self::Xai => ApiType::OpenAi,
            Self::Anthropic => ApiType::Anthropic,
            Self::Gemini => ApiType::Gemini,
            Self::Ollama => ApiType::Ollama,
            Self::Cloudflare => ApiType::Cloudflare,
            Self::Unknown => ApiType::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiType {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
    Cloudflare,
    Unknown,
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::Cloudflare => "cloudflare",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Enabled,
            3 => Self::AutoDisabled,
            _ => Self::ManuallyDisabled,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::ManuallyDisabled => 2,
            Self::AutoDisabled => 3,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub channel_type: ChannelType,
    pub key: String,
    pub status: ChannelStatus,
    pub name: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub used_quota: f64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub config: ChannelConfig,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("channel_type", &self.channel_type)
            .field("key", &"<redacted>")
            .field("status", &self.status)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("used_quota", &self.used_quota)
            .field("priority", &self.priority)
            .field("config", &self.config)
            .finish()
    }
}

impl Channel {
    pub fn new(id: i64, name: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            id,
            channel_type,
            key: String::new(),
            status: ChannelStatus::Enabled,
            name: name.into(),
            base_url: None,
            used_quota: 0.0,
            priority: 0,
            config: ChannelConfig::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn effective_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.channel_type.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub context_length: i64,
    #[serde(default)]
    pub prompt: f64,
    #[serde(default)]
    pub completion: f64,
    #[serde(default)]
    pub input_cache_read: f64,
    #[serde(default)]
    pub input_cache_write: f64,
    #[serde(default)]
    pub reasoning: f64,
    #[serde(default)]
    pub additional: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelAbility {
    pub channel_id: i64,
    pub name: String,
    #[serde(default)]
    pub mapped_name: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub pricing: Option<ModelPricing>,
    #[serde(default)]
    pub tokenizer: Option<String>,
}

impl ModelAbility {
    pub fn new(channel_id: i64, name: impl Into<String>) -> Self {
        Self {
            channel_id,
            name: name.into(),
            mapped_name: None,
            enabled: true,
            priority: None,
            pricing: None,
            tokenizer: None,
        }
    }

    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn upstream_name(&self) -> &str {
        self.mapped_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    #[default]
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Enabled,
            3 => Self::Expired,
            4 => Self::Exhausted,
            _ => Self::Disabled,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Self::Enabled => 1,
            Self::Disabled => 2,
            Self::Expired => 3,
            Self::Exhausted => 4,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: String,
    pub status: TokenStatus,
    /// Unix seconds; `-1` never expires.
    pub expired_time: i64,
    pub remain_quota: f64,
    pub unlimited_quota: bool,
    pub used_quota: f64,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("key", &"<redacted>")
            .field("name", &self.name)
            .field("status", &self.status)
            .field("expired_time", &self.expired_time)
            .field("remain_quota", &self.remain_quota)
            .field("unlimited_quota", &self.unlimited_quota)
            .field("used_quota", &self.used_quota)
            .finish()
    }
}

impl Token {
    pub fn new(id: i64, user_id: i64, key: impl Into<String>, remain_quota: f64) -> Self {
        Self {
            id,
            user_id,
            key: key.into(),
            name: format!("token-{id}"),
            status: TokenStatus::Enabled,
            expired_time: -1,
            remain_quota,
            unlimited_quota: false,
            used_quota: 0.0,
        }
    }

    pub fn is_expired_at(&self, now_secs: i64) -> bool {
        self.expired_time != -1 && self.expired_time < now_secs
    }

    pub fn is_exhausted(&self) -> bool {
        !self.unlimited_quota && self.remain_quota <= 0.0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub quota: f64,
    pub used_quota: f64,
    pub request_count: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsumeLog {
    pub id: i64,
    pub created_at: i64,
    pub user_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    pub token_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: f64,
    pub content: String,
    pub is_stream: bool,
    pub elapsed_ms: i64,
}

#[derive(Clone, Debug)]
pub struct ChannelCandidate {
    pub channel: std::sync::Arc<Channel>,
    pub ability: std::sync::Arc<ModelAbility>,
}

impl ChannelCandidate {
    pub fn priority(&self) -> i64 {
        self.ability.priority.unwrap_or(self.channel.priority)
    }
}
