//! Conversations: a context window over an LLM client.
//!
//! A [`Conversation`] appends messages in call order, persists the window
//! through an optional [`ContextStore`], and drives the tool loop: when
//! the model asks for a tool, the registered [`SkillDispatcher`] runs it,
//! the result is appended as a tool-role message, and the request
//! re-enters until the model finishes with a terminal reason.
//!
//! The window lock is held for the whole exchange, so tool results from
//! concurrent prompts on one conversation never interleave.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;

use smyth_core::llm::{
    ContextStore, FinishReason, LlmEventStream, LlmMessage, LlmRequest, LlmStreamEvent, LlmUsage,
    MessageRole, ToolCallData, ToolSpec, format_tools_config,
};
use smyth_core::{Error, Result};

use crate::requester::LlmClient;

/// Upper bound on tool round-trips within one prompt.
const MAX_TOOL_ROUNDS: usize = 8;
const STREAM_BUFFER: usize = 32;

/// Executes tool calls surfaced by the model.
#[async_trait]
pub trait SkillDispatcher: Send + Sync {
    fn tool_specs(&self) -> Vec<ToolSpec>;

    /// Runs the named skill; the returned string is fed back verbatim as
    /// the tool-role message content.
    async fn dispatch(&self, call: &ToolCallData) -> Result<String>;
}

/// Per-prompt options. A prompt-level behavior replaces the
/// conversation-level behavior for that exchange only.
#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    pub behavior: Option<String>,
}

struct ConversationInner {
    id: String,
    llm: LlmClient,
    model: String,
    behavior: Option<String>,
    dispatcher: Option<Arc<dyn SkillDispatcher>>,
    store: Option<Arc<dyn ContextStore>>,
    window: tokio::sync::Mutex<Window>,
    usage: parking_lot::Mutex<LlmUsage>,
}

#[derive(Default)]
struct Window {
    messages: Vec<LlmMessage>,
    loaded: bool,
}

#[derive(Clone)]
pub struct Conversation {
    inner: Arc<ConversationInner>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, llm: LlmClient, model: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ConversationInner {
                id: id.into(),
                llm,
                model: model.into(),
                behavior: None,
                dispatcher: None,
                store: None,
                window: tokio::sync::Mutex::new(Window::default()),
                usage: parking_lot::Mutex::new(LlmUsage::default()),
            }),
        }
    }

    pub fn with_behavior(mut self, behavior: impl Into<String>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_behavior before sharing")
            .behavior = Some(behavior.into());
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn SkillDispatcher>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_dispatcher before sharing")
            .dispatcher = Some(dispatcher);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        Arc::get_mut(&mut self.inner)
            .expect("with_store before sharing")
            .store = Some(store);
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Token usage accumulated across every exchange of this conversation.
    pub fn usage(&self) -> LlmUsage {
        *self.inner.usage.lock()
    }

    /// Snapshot of the context window (without the injected system
    /// message).
    pub async fn window(&self) -> Vec<LlmMessage> {
        self.inner.window.lock().await.messages.clone()
    }

    async fn ensure_loaded(&self, window: &mut Window) -> Result<()> {
        if window.loaded {
            return Ok(());
        }
        if let Some(store) = &self.inner.store {
            if let Some(messages) = store.get(&self.inner.id).await? {
                window.messages = messages;
            }
        }
        window.loaded = true;
        Ok(())
    }

    async fn persist(&self, window: &Window) -> Result<()> {
        if let Some(store) = &self.inner.store {
            store.set(&self.inner.id, window.messages.clone()).await?;
        }
        Ok(())
    }

    fn build_request(&self, behavior: Option<&str>, history: &[LlmMessage]) -> LlmRequest {
        // The system message is unique and leads; it is injected per
        // request, never stored in the window.
        let behavior = behavior.or(self.inner.behavior.as_deref());
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(behavior) = behavior {
            messages.push(LlmMessage::system(behavior));
        }
        messages.extend(history.iter().cloned());

        let tools = self
            .inner
            .dispatcher
            .as_ref()
            .map(|d| format_tools_config(d.tool_specs(), Default::default()).tools)
            .unwrap_or_default();
        LlmRequest {
            model: self.inner.model.clone(),
            messages,
            tools,
            ..Default::default()
        }
    }

    fn track_usage(&self, usage: &LlmUsage) {
        self.inner.usage.lock().accumulate(usage);
    }

    /// Appends a user message, runs the exchange (tool loop included), and
    /// returns the final assistant content.
    pub async fn prompt(&self, text: impl Into<String>) -> Result<String> {
        self.prompt_with(text, PromptOptions::default()).await
    }

    pub async fn prompt_with(
        &self,
        text: impl Into<String>,
        opts: PromptOptions,
    ) -> Result<String> {
        let mut window = self.inner.window.lock().await;
        self.ensure_loaded(&mut window).await?;
        window.messages.push(LlmMessage::user(text.into()));

        let mut rounds = 0;
        loop {
            let req = self.build_request(opts.behavior.as_deref(), &window.messages);
            let res = self.inner.llm.request(req).await?;
            self.track_usage(&res.usage);

            if res.use_tool
                && rounds < MAX_TOOL_ROUNDS
                && let Some(dispatcher) = self.inner.dispatcher.as_ref()
            {
                rounds += 1;
                window.messages.push(res.message.clone());
                for call in &res.tools_data {
                    let output = match dispatcher.dispatch(call).await {
                        Ok(output) => output,
                        // The model sees the failure and may recover.
                        Err(err) => format!("tool {} failed: {err}", call.name),
                    };
                    window
                        .messages
                        .push(LlmMessage::tool(call.id.clone(), output));
                }
                continue;
            }

            if !res.finish_reason.is_terminal() && res.finish_reason != FinishReason::ToolUse {
                log::warn!(target: "conversation", id = self.inner.id.as_str(), reason = format!("{:?}", res.finish_reason); "non-terminal finish reason");
            }
            window.messages.push(res.message.clone());
            self.persist(&window).await?;
            return Ok(res.content);
        }
    }

    /// Streaming variant of [`Conversation::prompt`]: emits `Content` and
    /// `ToolInfo` as they arrive, `ToolResult` after each skill run, one
    /// accumulated `Usage`, then `End`. On error: one `Error`, then `End`.
    pub async fn stream_prompt(
        &self,
        text: impl Into<String>,
        opts: PromptOptions,
    ) -> Result<LlmEventStream> {
        let text = text.into();
        let (tx, rx) = tokio::sync::mpsc::channel::<LlmStreamEvent>(STREAM_BUFFER);
        let conv = self.clone();

        tokio::spawn(async move {
            if let Err(err) = conv.run_stream_exchange(text, opts, &tx).await {
                let _ = tx.send(LlmStreamEvent::Error(err.to_string())).await;
                let _ = tx.send(LlmStreamEvent::End).await;
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn run_stream_exchange(
        &self,
        text: String,
        opts: PromptOptions,
        tx: &tokio::sync::mpsc::Sender<LlmStreamEvent>,
    ) -> Result<()> {
        use futures_util::StreamExt;

        let mut window = self.inner.window.lock().await;
        self.ensure_loaded(&mut window).await?;
        window.messages.push(LlmMessage::user(text));

        let mut total_usage = LlmUsage::default();
        let mut rounds = 0;
        loop {
            let req = self.build_request(opts.behavior.as_deref(), &window.messages);
            let mut stream = self.inner.llm.stream_request(req).await?;

            let mut content = String::new();
            let mut calls: Vec<ToolCallData> = Vec::new();
            let mut errored = false;
            while let Some(event) = stream.next().await {
                match event {
                    LlmStreamEvent::Content(piece) => {
                        content.push_str(&piece);
                        if tx.send(LlmStreamEvent::Content(piece)).await.is_err() {
                            return Ok(()); // consumer went away
                        }
                    }
                    LlmStreamEvent::ToolInfo(call) => {
                        if tx.send(LlmStreamEvent::ToolInfo(call.clone())).await.is_err() {
                            return Ok(());
                        }
                        calls.push(call);
                    }
                    LlmStreamEvent::ToolResult(_) => {}
                    LlmStreamEvent::Usage(usage) => {
                        total_usage.accumulate(&usage);
                        self.track_usage(&usage);
                    }
                    LlmStreamEvent::Error(msg) => {
                        errored = true;
                        let _ = tx.send(LlmStreamEvent::Error(msg)).await;
                    }
                    LlmStreamEvent::End => break,
                }
            }
            if errored {
                let _ = tx.send(LlmStreamEvent::End).await;
                return Ok(());
            }

            let mut assistant = LlmMessage::assistant(content);
            if !calls.is_empty() {
                assistant.tool_calls = Some(calls.clone());
            }
            window.messages.push(assistant);

            if !calls.is_empty()
                && rounds < MAX_TOOL_ROUNDS
                && let Some(dispatcher) = self.inner.dispatcher.as_ref()
            {
                rounds += 1;
                for call in &calls {
                    let output = match dispatcher.dispatch(call).await {
                        Ok(output) => output,
                        Err(err) => format!("tool {} failed: {err}", call.name),
                    };
                    let mut answered = call.clone();
                    answered.result = Some(output.clone());
                    if tx.send(LlmStreamEvent::ToolResult(answered)).await.is_err() {
                        return Ok(());
                    }
                    window
                        .messages
                        .push(LlmMessage::tool(call.id.clone(), output));
                }
                continue;
            }

            self.persist(&window).await?;
            let _ = tx.send(LlmStreamEvent::Usage(total_usage)).await;
            let _ = tx.send(LlmStreamEvent::End).await;
            return Ok(());
        }
    }
}

/// In-memory [`ContextStore`].
#[derive(Default)]
pub struct MemoryContextStore {
    windows: DashMap<String, Vec<LlmMessage>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn get(&self, id: &str) -> Result<Option<Vec<LlmMessage>>> {
        Ok(self.windows.get(id).map(|w| w.clone()))
    }

    async fn set(&self, id: &str, window: Vec<LlmMessage>) -> Result<()> {
        self.windows.insert(id.to_string(), window);
        Ok(())
    }
}

/// Validation shared by window consumers: the system message, when
/// present, is unique and leads; tool messages answer a preceding
/// tool_call.
pub fn validate_window(messages: &[LlmMessage]) -> Result<()> {
    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            MessageRole::System if i != 0 => {
                return Err(Error::invalid("system message must lead the window"));
            }
            MessageRole::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or_default();
                let answered = messages[..i].iter().any(|m| {
                    m.tool_calls
                        .as_ref()
                        .is_some_and(|calls| calls.iter().any(|c| c.id == id))
                });
                if !answered {
                    return Err(Error::invalid(format!(
                        "tool message {id} does not answer a tool call"
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
