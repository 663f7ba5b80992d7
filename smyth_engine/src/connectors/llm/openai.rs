//! OpenAI-compatible chat completions connector.
//!
//! Works against api.openai.com and any compatible endpoint (vLLM, LM
//! Studio, gateways). Binary files attach as data-URL image parts; content
//! types the protocol cannot represent fail the request rather than being
//! dropped silently.

use async_stream::stream;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use smyth_core::llm::{
    FinishReason, LlmConnector, LlmEventStream, LlmMessage, LlmRequest, LlmResponse,
    LlmStreamEvent, LlmUsage, MessageRole, ResponseFormat, ToolCallData, ToolChoice,
};
use smyth_core::{AccessRequest, Connector, Error, Json, Result, Subsystem};

const CONNECTOR_NAME: &str = "OpenAI";
const API_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiLlm {
    endpoint: String,
    api_key: String,
    default_model: String,
    http: reqwest::Client,
}

impl OpenAiLlm {
    pub fn new(api_key: &str, endpoint: Option<String>) -> Self {
        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| API_BASE_URL.to_string());
        Self {
            endpoint,
            api_key: api_key.to_string(),
            default_model: "gpt-4o-mini".to_string(),
            http: reqwest::Client::builder()
                .user_agent(crate::APP_USER_AGENT)
                .build()
                .expect("reqwest client should build"),
        }
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    /// Builds the connector from opaque bus settings:
    /// `{ "api_key", "endpoint"?, "model"? }`.
    pub fn from_settings(settings: &Json) -> Result<Self> {
        let api_key = settings
            .get("api_key")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Configuration("OpenAI connector requires api_key".into()))?;
        let endpoint = settings
            .get("endpoint")
            .and_then(|v| v.as_str())
            .map(String::from);
        let mut this = Self::new(api_key, endpoint);
        if let Some(model) = settings.get("model").and_then(|v| v.as_str()) {
            this = this.with_default_model(model);
        }
        Ok(this)
    }

    fn convert_message(msg: &LlmMessage) -> Json {
        let role = match msg.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        let mut out = json!({ "role": role, "content": msg.content });
        if let Some(calls) = &msg.tool_calls {
            out["tool_calls"] = calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": { "name": c.name, "arguments": c.args },
                    })
                })
                .collect();
            out["content"] = Json::Null;
        }
        if let Some(id) = &msg.tool_call_id {
            out["tool_call_id"] = json!(id);
        }
        out
    }

    fn build_body(&self, params: &LlmRequest, stream: bool) -> Result<Json> {
        let mut messages: Vec<Json> = params.messages.iter().map(Self::convert_message).collect();

        if !params.files.is_empty() {
            // Attach binary inputs to the last user message as content
            // parts. The chat protocol only carries images.
            let mut parts: Vec<Json> = Vec::new();
            if let Some(last_user) = messages
                .iter()
                .rposition(|m| m["role"] == "user")
            {
                if let Some(text) = messages[last_user]["content"].as_str() {
                    parts.push(json!({ "type": "text", "text": text }));
                }
                for file in &params.files {
                    if !file.content_type.starts_with("image/") {
                        return Err(Error::invalid(format!(
                            "model cannot accept binary input of type {}",
                            file.content_type
                        )));
                    }
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!(
                                "data:{};base64,{}",
                                file.content_type,
                                BASE64.encode(&file.data)
                            ),
                        },
                    }));
                }
                messages[last_user]["content"] = Json::Array(parts);
            }
        }

        let model = if params.model.is_empty() {
            self.default_model.clone()
        } else {
            params.model.clone()
        };
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stream": stream,
        });
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(stop) = &params.stop_sequences {
            body["stop"] = json!(stop);
        }
        if let Some(p) = params.presence_penalty {
            body["presence_penalty"] = json!(p);
        }
        if let Some(p) = params.frequency_penalty {
            body["frequency_penalty"] = json!(p);
        }
        if params.response_format == ResponseFormat::Json {
            body["response_format"] = json!({ "type": "json_object" });
        }
        if !params.tools.is_empty() {
            body["tools"] = params
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        },
                    })
                })
                .collect();
            body["tool_choice"] = match &params.tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
                ToolChoice::Required => json!("required"),
                ToolChoice::Tool(name) => {
                    json!({ "type": "function", "function": { "name": name } })
                }
            };
        }
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        Ok(body)
    }

    async fn post(&self, params: &LlmRequest, body: &Json) -> Result<reqwest::Response> {
        let key = params.api_key.as_deref().unwrap_or(&self.api_key);
        if key.is_empty() {
            return Err(Error::Configuration(
                "OpenAI connector has no API key".into(),
            ));
        }
        let res = self
            .http
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(|err| Error::backend(CONNECTOR_NAME, err))?;
        if !res.status().is_success() {
            let status = res.status();
            let detail = res.text().await.unwrap_or_default();
            return Err(Error::backend(
                CONNECTOR_NAME,
                format!("HTTP {status}: {detail}"),
            ));
        }
        Ok(res)
    }
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("tool_calls") => FinishReason::ToolUse,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("end_turn") => FinishReason::EndTurn,
        _ => FinishReason::Stop,
    }
}

impl Connector for OpenAiLlm {
    fn name(&self) -> &str {
        CONNECTOR_NAME
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Llm
    }
}

#[async_trait]
impl LlmConnector for OpenAiLlm {
    async fn request(&self, _req: &AccessRequest, params: LlmRequest) -> Result<LlmResponse> {
        let body = self.build_body(&params, false)?;
        let res = self.post(&params, &body).await?;
        let mut res: CompletionResponse = res
            .json()
            .await
            .map_err(|err| Error::backend(CONNECTOR_NAME, err))?;

        let choice = res
            .choices
            .pop()
            .ok_or_else(|| Error::backend(CONNECTOR_NAME, "no completion choice"))?;
        let usage = res.usage.map(LlmUsage::from).unwrap_or_default();
        let content = choice.message.content.clone().unwrap_or_default();
        let tools_data: Vec<ToolCallData> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCallData {
                id: c.id,
                name: c.function.name,
                args: c.function.arguments,
                result: None,
            })
            .collect();

        let mut message = LlmMessage::assistant(content.clone());
        if !tools_data.is_empty() {
            message.tool_calls = Some(tools_data.clone());
        }
        Ok(LlmResponse {
            content,
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            use_tool: !tools_data.is_empty(),
            tools_data,
            usage,
            message,
        })
    }

    async fn stream_request(
        &self,
        _req: &AccessRequest,
        params: LlmRequest,
        cancel: CancellationToken,
    ) -> Result<LlmEventStream> {
        let body = self.build_body(&params, true)?;
        let res = self.post(&params, &body).await?;

        let stream = stream! {
            let mut upstream = res.bytes_stream();
            let mut buffer = String::new();
            let mut usage = LlmUsage::default();
            // Tool call deltas accumulate by stream index until [DONE].
            let mut calls: BTreeMap<usize, ToolCallData> = BTreeMap::new();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        yield LlmStreamEvent::End;
                        return;
                    }
                    chunk = upstream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(err) => {
                        yield LlmStreamEvent::Error(format!("{CONNECTOR_NAME}: {err}"));
                        yield LlmStreamEvent::End;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(event_end) = buffer.find("\n\n") {
                    let event_data = buffer[..event_end].to_string();
                    buffer = buffer[event_end + 2..].to_string();

                    for line in event_data.lines() {
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        if data.trim() == "[DONE]" {
                            for call in std::mem::take(&mut calls).into_values() {
                                yield LlmStreamEvent::ToolInfo(call);
                            }
                            yield LlmStreamEvent::Usage(usage);
                            yield LlmStreamEvent::End;
                            return;
                        }
                        let Ok(event) = serde_json::from_str::<StreamChunk>(data) else { continue };
                        if let Some(u) = event.usage {
                            usage = u.into();
                        }
                        let Some(choice) = event.choices.first() else { continue };
                        if let Some(content) = &choice.delta.content {
                            if !content.is_empty() {
                                yield LlmStreamEvent::Content(content.clone());
                            }
                        }
                        for tc in choice.delta.tool_calls.iter().flatten() {
                            let entry = calls.entry(tc.index).or_default();
                            if let Some(id) = &tc.id {
                                entry.id = id.clone();
                            }
                            if let Some(function) = &tc.function {
                                if let Some(name) = &function.name {
                                    entry.name = name.clone();
                                }
                                if let Some(args) = &function.arguments {
                                    entry.args.push_str(args);
                                }
                            }
                        }
                    }
                }
            }

            // Upstream closed without [DONE]; flush what is known.
            for call in calls.into_values() {
                yield LlmStreamEvent::ToolInfo(call);
            }
            yield LlmStreamEvent::Usage(usage);
            yield LlmStreamEvent::End;
        };
        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ApiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl From<Usage> for LlmUsage {
    fn from(u: Usage) -> Self {
        LlmUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            input_tokens_cache_read: u
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or_default(),
            input_tokens_cache_write: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use smyth_core::llm::FileInput;

    #[test]
    fn test_build_body_basics() {
        let llm = OpenAiLlm::new("sk-test", None);
        let params = LlmRequest {
            model: "gpt-4o".into(),
            messages: vec![LlmMessage::system("be brief"), LlmMessage::user("hi")],
            max_tokens: Some(128),
            ..Default::default()
        };
        let body = llm.build_body(&params, false).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["stream"], false);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_build_body_tools_and_json_mode() {
        let llm = OpenAiLlm::new("sk-test", None);
        let params = LlmRequest {
            messages: vec![LlmMessage::user("hi")],
            tools: vec![smyth_core::llm::FunctionDefinition {
                name: "get_version".into(),
                description: "d".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }],
            tool_choice: ToolChoice::Required,
            response_format: ResponseFormat::Json,
            ..Default::default()
        };
        let body = llm.build_body(&params, false).unwrap();
        assert_eq!(body["tools"][0]["function"]["name"], "get_version");
        assert_eq!(body["tool_choice"], "required");
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_non_image_file_is_rejected() {
        let llm = OpenAiLlm::new("sk-test", None);
        let params = LlmRequest {
            messages: vec![LlmMessage::user("see attachment")],
            files: vec![FileInput {
                content_type: "application/pdf".into(),
                data: Bytes::from_static(b"%PDF"),
                name: None,
            }],
            ..Default::default()
        };
        assert!(matches!(
            llm.build_body(&params, false),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_image_file_becomes_data_url_part() {
        let llm = OpenAiLlm::new("sk-test", None);
        let params = LlmRequest {
            messages: vec![LlmMessage::user("what is this?")],
            files: vec![FileInput {
                content_type: "image/png".into(),
                data: Bytes::from_static(b"\x89PNG"),
                name: None,
            }],
            ..Default::default()
        };
        let body = llm.build_body(&params, false).unwrap();
        let parts = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert!(
            parts[1]["image_url"]["url"]
                .as_str()
                .unwrap()
                .starts_with("data:image/png;base64,")
        );
    }

    #[test]
    fn test_tool_call_message_round_trip() {
        let mut msg = LlmMessage::assistant("");
        msg.tool_calls = Some(vec![ToolCallData {
            id: "call_9".into(),
            name: "lookup".into(),
            args: "{\"q\":1}".into(),
            result: None,
        }]);
        let converted = OpenAiLlm::convert_message(&msg);
        assert_eq!(converted["tool_calls"][0]["function"]["name"], "lookup");
        assert!(converted["content"].is_null());

        let tool_msg = LlmMessage::tool("call_9", "42");
        let converted = OpenAiLlm::convert_message(&tool_msg);
        assert_eq!(converted["role"], "tool");
        assert_eq!(converted["tool_call_id"], "call_9");
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("tool_calls")), FinishReason::ToolUse);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }
}
