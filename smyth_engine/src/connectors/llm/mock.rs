//! Deterministic mock model and embedder.
//!
//! `EchoLlm` replies with the system behavior followed by the last user
//! (or tool) content, and issues a tool call for the first offered tool on
//! the opening turn, which makes the full tool loop exercisable without a
//! network. `MockEmbedder` hashes character bigrams into a fixed number of
//! dimensions, so overlapping text actually scores higher under cosine
//! similarity.

use async_stream::stream;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use smyth_core::llm::{
    Embedder, FinishReason, LlmConnector, LlmEventStream, LlmMessage, LlmRequest, LlmResponse,
    LlmStreamEvent, LlmUsage, MessageRole, ToolCallData,
};
use smyth_core::{AccessRequest, Connector, Result, Subsystem};

const STREAM_CHUNK_CHARS: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoLlm;

impl EchoLlm {
    fn build_response(params: &LlmRequest) -> LlmResponse {
        let system = params
            .messages
            .iter()
            .find(|m| m.role == MessageRole::System)
            .and_then(|m| m.text())
            .unwrap_or_default()
            .to_string();

        let input_chars: usize = params
            .messages
            .iter()
            .filter_map(|m| m.text())
            .map(|t| t.len())
            .sum();
        let mut usage = LlmUsage {
            input_tokens: (input_chars / 4).max(1) as u64,
            ..Default::default()
        };

        let answered_tools = params
            .messages
            .iter()
            .any(|m| m.role == MessageRole::Tool);
        if !params.tools.is_empty() && !answered_tools {
            let call = ToolCallData {
                id: "call_1".to_string(),
                name: params.tools[0].name.clone(),
                args: "{}".to_string(),
                result: None,
            };
            usage.output_tokens = 1;
            let mut message = LlmMessage::assistant("");
            message.tool_calls = Some(vec![call.clone()]);
            return LlmResponse {
                content: String::new(),
                finish_reason: FinishReason::ToolUse,
                use_tool: true,
                tools_data: vec![call],
                usage,
                message,
            };
        }

        let tail = params
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, MessageRole::Tool | MessageRole::User))
            .and_then(|m| m.text())
            .unwrap_or_default();
        let content = format!("{system}{tail}");
        usage.output_tokens = (content.len() / 4).max(1) as u64;
        LlmResponse {
            message: LlmMessage::assistant(content.clone()),
            content,
            finish_reason: FinishReason::Stop,
            use_tool: false,
            tools_data: Vec::new(),
            usage,
        }
    }
}

impl Connector for EchoLlm {
    fn name(&self) -> &str {
        "Echo"
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Llm
    }
}

#[async_trait]
impl LlmConnector for EchoLlm {
    async fn request(&self, _req: &AccessRequest, params: LlmRequest) -> Result<LlmResponse> {
        Ok(Self::build_response(&params))
    }

    async fn stream_request(
        &self,
        _req: &AccessRequest,
        params: LlmRequest,
        cancel: CancellationToken,
    ) -> Result<LlmEventStream> {
        let response = Self::build_response(&params);
        let stream = stream! {
            if cancel.is_cancelled() {
                yield LlmStreamEvent::End;
                return;
            }
            let chars: Vec<char> = response.content.chars().collect();
            for piece in chars.chunks(STREAM_CHUNK_CHARS) {
                if cancel.is_cancelled() {
                    yield LlmStreamEvent::End;
                    return;
                }
                yield LlmStreamEvent::Content(piece.iter().collect());
            }
            for call in response.tools_data {
                yield LlmStreamEvent::ToolInfo(call);
            }
            yield LlmStreamEvent::Usage(response.usage);
            yield LlmStreamEvent::End;
        };
        Ok(Box::pin(stream))
    }
}

/// Bag-of-bigrams embedder. Texts sharing character bigrams land close
/// under cosine similarity; texts sharing nothing score zero.
#[derive(Debug, Clone, Copy)]
pub struct MockEmbedder {
    ndims: usize,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self { ndims: 64 }
    }
}

impl MockEmbedder {
    pub fn new(ndims: usize) -> Self {
        Self { ndims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.ndims];
        let chars: Vec<char> = text.to_lowercase().chars().collect();
        for window in chars.windows(2) {
            let bigram: String = window.iter().collect();
            let idx = (xxhash_rust::xxh3::xxh3_64(bigram.as_bytes()) % self.ndims as u64) as usize;
            v[idx] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn ndims(&self) -> usize {
        self.ndims
    }

    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
