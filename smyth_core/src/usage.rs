//! Usage accounting events.
//!
//! After every successful completion the inference layer publishes one
//! [`UsageEvent`] on the process-wide bus under [`USAGE_LLM_CHANNEL`].

use serde::{Deserialize, Serialize};

use crate::llm::LlmUsage;

/// Channel name for LLM usage events.
pub const USAGE_LLM_CHANNEL: &str = "USAGE:LLM";

/// Whose credentials paid for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySource {
    /// The key was resolved from the caller's vault.
    User,
    /// The runtime's own key was used.
    Smyth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// `llm:<model>`
    pub source_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_tokens_cache_read: u64,
    pub input_tokens_cache_write: u64,
    pub key_source: KeySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
}

impl UsageEvent {
    pub fn for_model(model: &str, usage: &LlmUsage, key_source: KeySource) -> Self {
        Self {
            source_id: format!("llm:{model}"),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            input_tokens_cache_read: usage.input_tokens_cache_read,
            input_tokens_cache_write: usage.input_tokens_cache_write,
            key_source,
            agent_id: None,
            team_id: None,
        }
    }
}
