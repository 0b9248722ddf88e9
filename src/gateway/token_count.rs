use serde_json::Value;

use super::meta::RelayMode;
use crate::types::{GeneralRequest, Message};

pub fn count_prompt_tokens(mode: RelayMode, model: &str, request: &GeneralRequest) -> i64 {
    let tokens = match mode {
        RelayMode::ChatCompletions => request
            .messages
            .as_deref()
            .map(|messages| count_message_tokens(model, messages))
            .unwrap_or(0),
        RelayMode::Completions => request
            .prompt
            .as_ref()
            .map(|prompt| count_input_tokens(model, prompt))
            .unwrap_or(0),
        RelayMode::Embeddings | RelayMode::Moderations => request
            .input
            .as_ref()
            .map(|input| count_input_tokens(model, input))
            .unwrap_or(0),
        RelayMode::Edits => request
            .instruction
            .as_deref()
            .map(|instruction| encode_len(model, instruction))
            .unwrap_or(0),
        RelayMode::Unknown => 0,
    };
    clamp_usize_to_i64(tokens)
}

pub fn count_text_tokens(model: &str, text: &str) -> i64 {
    clamp_usize_to_i64(encode_len(model, text))
}

fn count_message_tokens(model: &str, messages: &[Message]) -> usize {
    let (tokens_per_message, tokens_per_name) = if model.starts_with("gpt-3.5") {
        (4i64, -1i64)
    } else {
        (3i64, 1i64)
    };

    let mut num_tokens: i64 = 0;
    for message in messages {
        num_tokens = num_tokens.saturating_add(tokens_per_message);
        num_tokens = num_tokens.saturating_add(clamp_usize_to_i64(encode_len(model, &message.role)));
        num_tokens = num_tokens
            .saturating_add(clamp_usize_to_i64(encode_len(model, &message.text_content())));
        if let Some(name) = message.name.as_deref() {
            num_tokens = num_tokens.saturating_add(clamp_usize_to_i64(encode_len(model, name)));
            num_tokens = num_tokens.saturating_add(tokens_per_name);
        }
    }
    // Every reply is primed with <|start|>assistant<|message|>.
    num_tokens = num_tokens.saturating_add(3);
    usize::try_from(num_tokens.max(0)).unwrap_or(0)
}

fn count_input_tokens(model: &str, value: &Value) -> usize {
    match value {
        Value::String(text) => encode_len(model, text),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|text| encode_len(model, text))
            .sum(),
        _ => 0,
    }
}

#[cfg(feature = "tokenizer")]
fn encode_len(model: &str, text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    bpe_for_model(model).encode_with_special_tokens(text).len()
}

#[cfg(feature = "tokenizer")]
fn bpe_for_model(model: &str) -> &'static tiktoken_rs::CoreBPE {
    use tiktoken_rs::tokenizer;

    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

#[cfg(not(feature = "tokenizer"))]
fn encode_len(_model: &str, text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn clamp_usize_to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
