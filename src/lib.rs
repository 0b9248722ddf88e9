//! Multi-tenant relay for OpenAI-compatible LLM upstreams.
//!
//! Clients call the OpenAI HTTP surface with a relay token; the relay picks
//! an upstream channel, reserves quota, forwards the call and settles the
//! actual cost once the response has been delivered.

mod error;

pub mod gateway;
pub mod types;
pub mod utils;

pub use error::{RelayError, Result};
pub use gateway::{RelayConfig, RelayRuntime, RelayStore};
