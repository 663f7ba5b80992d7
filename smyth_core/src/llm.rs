//! Provider-neutral LLM request/response model.
//!
//! An [`LlmConnector`] accepts one request shape and produces either a full
//! [`LlmResponse`] or a stream of [`LlmStreamEvent`]s over a single
//! channel. Tool schemas are normalized from the common
//! `{name, description, properties, required_fields}` shape into
//! [`FunctionDefinition`]s via [`format_tools_config`]; providers never see
//! the common shape.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::access::{AccessCandidate, AccessRequest};
use crate::acl::Acl;
use crate::connector::Connector;
use crate::error::Result;

/// Message role within a context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry of the context window. `content` is JSON to allow multi-part
/// provider payloads; plain text is the common case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: MessageRole,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Set when this message answers a tool call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Raw tool calls issued by an assistant message, provider-neutral form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallData>>,
}

impl LlmMessage {
    pub fn new(role: MessageRole, content: impl Into<serde_json::Value>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self::new(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self::new(MessageRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self::new(MessageRole::Assistant, text)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<serde_json::Value>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            name: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
        }
    }

    /// Text view of the content, when it is a plain string.
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }
}

/// Callable function definition in the provider-neutral form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// Common tool shape accepted at the public surface; normalized by
/// [`format_tools_config`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// `{ property_name: schema }`
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
    /// Force one specific tool by name.
    Tool(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolsConfig {
    pub tools: Vec<FunctionDefinition>,
    pub tool_choice: ToolChoice,
}

/// Normalizes `{name, description, properties, required_fields}` tool
/// definitions into the [`FunctionDefinition`] form consumed by
/// [`LlmRequest`]. Only `type: "function"` tools exist today.
pub fn format_tools_config(tool_definitions: Vec<ToolSpec>, tool_choice: ToolChoice) -> ToolsConfig {
    let tools = tool_definitions
        .into_iter()
        .map(|spec| {
            let properties = if spec.properties.is_object() {
                spec.properties
            } else {
                serde_json::json!({})
            };
            FunctionDefinition {
                name: spec.name,
                description: spec.description,
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": properties,
                    "required": spec.required_fields,
                }),
            }
        })
        .collect();
    ToolsConfig { tools, tool_choice }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// Binary attachment to a request. Connectors whose model cannot accept
/// binary input fail the request instead of dropping the file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInput {
    pub content_type: String,
    pub data: Bytes,
    pub name: Option<String>,
}

/// Provider-neutral request parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: Option<usize>,
    pub temperature: f64,
    pub top_p: f64,
    pub stop_sequences: Option<Vec<String>>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub tools: Vec<FunctionDefinition>,
    pub tool_choice: ToolChoice,
    pub response_format: ResponseFormat,
    pub files: Vec<FileInput>,
    /// Key override resolved by the inference layer (candidate vault);
    /// never serialized or logged.
    pub api_key: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            max_tokens: None,
            temperature: 1.0,
            top_p: 1.0,
            stop_sequences: None,
            presence_penalty: None,
            frequency_penalty: None,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            response_format: ResponseFormat::Text,
            files: Vec::new(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    EndTurn,
    ToolUse,
    Length,
    ContentFilter,
}

impl FinishReason {
    /// The conversation loop re-enters until a terminal reason arrives.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FinishReason::Stop | FinishReason::EndTurn)
    }
}

/// A tool call surfaced by the model, with the runtime-filled result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallData {
    pub id: String,
    pub name: String,
    /// Arguments as a JSON string, exactly as produced by the model.
    pub args: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub input_tokens_cache_read: u64,
    #[serde(default)]
    pub input_tokens_cache_write: u64,
}

impl LlmUsage {
    pub fn accumulate(&mut self, other: &LlmUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.input_tokens_cache_read = self
            .input_tokens_cache_read
            .saturating_add(other.input_tokens_cache_read);
        self.input_tokens_cache_write = self
            .input_tokens_cache_write
            .saturating_add(other.input_tokens_cache_write);
    }
}

/// Full result of a non-streaming request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    /// True when the model asked for tool execution.
    pub use_tool: bool,
    pub tools_data: Vec<ToolCallData>,
    pub usage: LlmUsage,
    /// The assistant message to append to the context window.
    pub message: LlmMessage,
}

/// Streaming events, one tagged enum over a single channel. Order per
/// request: `Content*`, `ToolInfo?`, `ToolResult?`, `Usage`, then `End`;
/// `Error` is terminal and followed only by `End`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LlmStreamEvent {
    Content(String),
    ToolInfo(ToolCallData),
    ToolResult(ToolCallData),
    Usage(LlmUsage),
    End,
    Error(String),
}

/// Boxed event stream returned by [`LlmConnector::stream_request`].
pub type LlmEventStream = Pin<Box<dyn Stream<Item = LlmStreamEvent> + Send>>;

#[async_trait]
pub trait LlmConnector: Connector {
    /// Models are not owned resources; by default every candidate may use
    /// them and the gate exists for uniformity (a deployment may override
    /// to restrict models per team).
    async fn resource_acl(&self, _model: &str, candidate: &AccessCandidate) -> Result<Acl> {
        Ok(Acl::for_candidate(candidate))
    }

    async fn request(&self, req: &AccessRequest, params: LlmRequest) -> Result<LlmResponse>;

    /// Event stream. A cancelled stream emits `End` (not `Error`) and
    /// releases its upstream reader.
    async fn stream_request(
        &self,
        req: &AccessRequest,
        params: LlmRequest,
        cancel: CancellationToken,
    ) -> Result<LlmEventStream>;
}

/// Pluggable persistence for conversation windows.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Vec<LlmMessage>>>;
    async fn set(&self, id: &str, window: Vec<LlmMessage>) -> Result<()>;
}

/// Text embedder used by vector connectors and the inference layer.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn ndims(&self) -> usize;

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vecs = self.embed(vec![text.to_string()]).await?;
        vecs.pop()
            .ok_or_else(|| crate::error::Error::backend("embedder", "empty embedding batch"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_tools_config() {
        let cfg = format_tools_config(
            vec![ToolSpec {
                name: "get_version".into(),
                description: "Returns the runtime version".into(),
                properties: serde_json::json!({}),
                required_fields: vec![],
            }],
            ToolChoice::Auto,
        );
        assert_eq!(cfg.tools.len(), 1);
        let def = &cfg.tools[0];
        assert_eq!(def.name, "get_version");
        assert_eq!(def.parameters["type"], "object");
        assert!(def.parameters["properties"].is_object());
    }

    #[test]
    fn test_terminal_reasons() {
        assert!(FinishReason::Stop.is_terminal());
        assert!(FinishReason::EndTurn.is_terminal());
        assert!(!FinishReason::ToolUse.is_terminal());
        assert!(!FinishReason::Length.is_terminal());
    }

    #[test]
    fn test_usage_accumulate() {
        let mut total = LlmUsage::default();
        total.accumulate(&LlmUsage {
            input_tokens: 10,
            output_tokens: 5,
            ..Default::default()
        });
        total.accumulate(&LlmUsage {
            input_tokens: 3,
            output_tokens: 2,
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
    }

    #[test]
    fn test_stream_event_tagging() {
        let json = serde_json::to_string(&LlmStreamEvent::Content("hi".into())).unwrap();
        assert_eq!(json, r#"{"type":"content","data":"hi"}"#);
        let json = serde_json::to_string(&LlmStreamEvent::End).unwrap();
        assert_eq!(json, r#"{"type":"end"}"#);
    }
}
