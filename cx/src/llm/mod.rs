//! LLM client abstraction
//!
//! The runtime consumes language models through a small trait: one-shot
//! completion plus embeddings. Each call is independent and wrapped in a
//! timeout; errors are typed so callers can decide about retries.

pub mod client;
mod error;
mod http;
mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use http::HttpLlmClient;
pub use types::{CompletionRequest, CompletionResponse};

use std::sync::Arc;

use crate::config::LlmConfig;

/// Create an LLM client from config
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    match config.provider.as_str() {
        "http" => Ok(Arc::new(HttpLlmClient::from_config(config)?)),
        other => Err(LlmError::InvalidResponse(format!(
            "Unknown LLM provider: '{}'. Supported: http",
            other
        ))),
    }
}
