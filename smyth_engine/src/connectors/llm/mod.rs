//! LLM connectors.
//!
//! [`openai::OpenAiLlm`] speaks the OpenAI-compatible chat completions
//! protocol (plain and SSE streaming); [`mock::EchoLlm`] is the
//! deterministic model used across the test suite.

pub mod mock;
pub mod openai;
