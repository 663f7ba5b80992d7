//! Agent runtime.
//!
//! An [`AgentSpec`] is the declarative part (id, team, behavior, model);
//! skills are typed callables registered on the [`AgentBuilder`]. The
//! built [`Agent`] binds the spec to live connectors: data clients scoped
//! to the agent (or its team), and conversations whose tool calls
//! dispatch into the skill set, optionally single-flighted per
//! `(agent, skill, args-hash)`.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::Shared;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use smyth_core::llm::{ContextStore, ToolCallData, ToolSpec};
use smyth_core::{AccessCandidate, BoxPinFut, Error, Json, Result};

use crate::conversation::{Conversation, SkillDispatcher};
use crate::requester::{Requester, StorageClient, VectorDbClient};
use crate::runtime::Runtime;

/// Which candidate an agent's data operations run under. Team scope
/// shares data among all agents of the team.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Agent,
    Team,
}

/// Declarative agent description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub team_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behavior: Option<String>,
    pub model: String,
}

/// Execution context handed to a running skill: clients bound to the
/// agent's candidate plus the ambient cancellation token.
#[derive(Clone)]
pub struct SkillContext {
    pub requester: Requester,
    pub cancellation_token: CancellationToken,
}

/// A named callable with typed arguments, registered on an agent.
///
/// # Rules
/// Names must be non-empty, at most 64 characters, and contain only
/// lowercase letters, digits, and underscores.
pub trait Skill: Send + Sync {
    type Args: DeserializeOwned + Send;
    type Output: Serialize;

    fn name(&self) -> String;

    fn description(&self) -> String;

    /// Input schema in the common `{properties, required_fields}` shape.
    /// Skills without arguments keep the default empty object.
    fn input_schema(&self) -> (Json, Vec<String>) {
        (serde_json::json!({}), Vec::new())
    }

    fn process(
        &self,
        ctx: SkillContext,
        args: Self::Args,
    ) -> impl Future<Output = Result<Self::Output>> + Send;
}

fn validate_skill_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::invalid("skill name must be 1..=64 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::invalid(format!(
            "skill name {name} may only contain lowercase letters, digits and underscores"
        )));
    }
    Ok(())
}

/// Dynamic dispatch view of a [`Skill`].
trait SkillDyn: Send + Sync {
    fn spec(&self) -> ToolSpec;
    fn call(&self, ctx: SkillContext, args: String) -> BoxPinFut<Result<String>>;
}

struct SkillWrapper<S>(Arc<S>);

impl<S: Skill + 'static> SkillDyn for SkillWrapper<S> {
    fn spec(&self) -> ToolSpec {
        let (properties, required_fields) = self.0.input_schema();
        ToolSpec {
            name: self.0.name(),
            description: self.0.description(),
            properties,
            required_fields,
        }
    }

    fn call(&self, ctx: SkillContext, args: String) -> BoxPinFut<Result<String>> {
        let skill = self.0.clone();
        Box::pin(async move {
            let args = if args.trim().is_empty() { "{}" } else { &args };
            let args: S::Args = serde_json::from_str(args).map_err(|err| {
                Error::invalid(format!("skill {}: invalid args: {err}", skill.name()))
            })?;
            let output = skill.process(ctx, args).await?;
            serde_json::to_string(&output)
                .map_err(|err| Error::invalid(format!("skill {}: {err}", skill.name())))
        })
    }
}

/// Collection of skills, keyed by name.
#[derive(Default)]
pub struct SkillSet {
    set: BTreeMap<String, Box<dyn SkillDyn>>,
}

impl SkillSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S: Skill + 'static>(&mut self, skill: S) -> Result<()> {
        let name = skill.name();
        validate_skill_name(&name)?;
        if self.set.contains_key(&name) {
            return Err(Error::Conflict(format!("skill {name} already exists")));
        }
        self.set.insert(name, Box::new(SkillWrapper(Arc::new(skill))));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.set.contains_key(name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.set.values().map(|s| s.spec()).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
    /// Collapse concurrent identical skill calls into one execution.
    pub single_flight: bool,
    /// Candidate scope for data clients and skill contexts.
    pub scope: Scope,
}

pub struct AgentBuilder {
    spec: AgentSpec,
    runtime: Runtime,
    skills: SkillSet,
    options: AgentOptions,
    context_store: Option<Arc<dyn ContextStore>>,
}

impl AgentBuilder {
    pub fn new(spec: AgentSpec, runtime: Runtime) -> Self {
        Self {
            spec,
            runtime,
            skills: SkillSet::new(),
            options: AgentOptions::default(),
            context_store: None,
        }
    }

    pub fn register_skill<S: Skill + 'static>(mut self, skill: S) -> Result<Self> {
        self.skills.add(skill)?;
        Ok(self)
    }

    pub fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_context_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.context_store = Some(store);
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            inner: Arc::new(AgentInner {
                spec: self.spec,
                runtime: self.runtime,
                skills: self.skills,
                options: self.options,
                context_store: self.context_store,
                inflight: DashMap::new(),
            }),
        }
    }
}

struct AgentInner {
    spec: AgentSpec,
    runtime: Runtime,
    skills: SkillSet,
    options: AgentOptions,
    context_store: Option<Arc<dyn ContextStore>>,
    /// In-flight skill executions keyed by `(skill, args-hash)`.
    inflight: DashMap<String, Shared<BoxPinFut<Result<String, String>>>>,
}

#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn builder(spec: AgentSpec, runtime: Runtime) -> AgentBuilder {
        AgentBuilder::new(spec, runtime)
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.inner.spec
    }

    /// The candidate data operations run under, per scope.
    pub fn candidate(&self, scope: Scope) -> AccessCandidate {
        match scope {
            Scope::Agent => AccessCandidate::agent(&self.inner.spec.id),
            Scope::Team => AccessCandidate::team(&self.inner.spec.team_id),
        }
    }

    pub fn requester(&self) -> Requester {
        self.inner
            .runtime
            .requester(self.candidate(self.inner.options.scope))
    }

    pub fn requester_scoped(&self, scope: Scope) -> Requester {
        self.inner.runtime.requester(self.candidate(scope))
    }

    pub fn storage(&self) -> Result<StorageClient> {
        self.requester().storage()
    }

    pub fn storage_scoped(&self, scope: Scope) -> Result<StorageClient> {
        self.requester_scoped(scope).storage()
    }

    pub fn vector_db(&self) -> Result<VectorDbClient> {
        self.requester().vector_db()
    }

    pub fn vector_db_scoped(&self, scope: Scope) -> Result<VectorDbClient> {
        self.requester_scoped(scope).vector_db()
    }

    /// Opens a chat session. The agent's behavior becomes the system
    /// message; skills are exposed as tools.
    pub fn conversation(&self, session_id: impl Into<String>) -> Result<Conversation> {
        let llm = self
            .inner
            .runtime
            .requester(self.candidate(Scope::Agent))
            .llm()?;
        let mut conv = Conversation::new(session_id, llm, &self.inner.spec.model)
            .with_dispatcher(Arc::new(self.clone()));
        if let Some(behavior) = &self.inner.spec.behavior {
            conv = conv.with_behavior(behavior);
        }
        if let Some(store) = &self.inner.context_store {
            conv = conv.with_store(store.clone());
        }
        Ok(conv)
    }

    fn skill_context(&self) -> SkillContext {
        SkillContext {
            requester: self.requester(),
            cancellation_token: CancellationToken::new(),
        }
    }

    async fn run_skill(&self, call: &ToolCallData) -> Result<String> {
        let Some(skill) = self.inner.skills.set.get(&call.name) else {
            return Err(Error::invalid(format!("skill {} not found", call.name)));
        };
        skill.call(self.skill_context(), call.args.clone()).await
    }

    async fn dispatch_single_flight(&self, call: &ToolCallData) -> Result<String> {
        let key = format!(
            "{}:{}:{:016x}",
            self.inner.spec.id,
            call.name,
            xxhash_rust::xxh3::xxh3_64(call.args.as_bytes())
        );
        let shared = {
            let agent = self.clone();
            let call = call.clone();
            self.inner
                .inflight
                .entry(key.clone())
                .or_insert_with(|| {
                    let fut: BoxPinFut<Result<String, String>> = Box::pin(async move {
                        agent.run_skill(&call).await.map_err(|err| err.to_string())
                    });
                    fut.shared()
                })
                .value()
                .clone()
        };
        let result = shared.await;
        self.inner.inflight.remove(&key);
        result.map_err(Error::InvalidArgument)
    }
}

#[async_trait]
impl SkillDispatcher for Agent {
    fn tool_specs(&self) -> Vec<ToolSpec> {
        self.inner.skills.specs()
    }

    async fn dispatch(&self, call: &ToolCallData) -> Result<String> {
        if self.inner.options.single_flight {
            self.dispatch_single_flight(call).await
        } else {
            self.run_skill(call).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_runtime;
    use futures_util::StreamExt;
    use smyth_core::llm::LlmStreamEvent;

    #[derive(Deserialize)]
    struct NoArgs {}

    struct GetVersion;

    impl Skill for GetVersion {
        type Args = NoArgs;
        type Output = String;

        fn name(&self) -> String {
            "get_version".into()
        }

        fn description(&self) -> String {
            "Returns the runtime version".into()
        }

        async fn process(&self, _ctx: SkillContext, _args: NoArgs) -> Result<String> {
            Ok("v1.0.5".into())
        }
    }

    fn spec() -> AgentSpec {
        AgentSpec {
            id: "agent-1".into(),
            team_id: "team-1".into(),
            name: "tester".into(),
            behavior: None,
            model: "echo".into(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_tool_loop_round_trip() {
        let runtime = test_runtime().await;
        let agent = Agent::builder(spec(), runtime)
            .register_skill(GetVersion)
            .unwrap()
            .build();

        let conv = agent.conversation("s1").unwrap();
        let reply = conv.prompt("What is your version number?").await.unwrap();
        assert!(reply.contains("v1.0.5"));

        // The window records the assistant tool call and its answer.
        let window = conv.window().await;
        assert!(window.iter().any(|m| m
            .tool_calls
            .as_ref()
            .is_some_and(|calls| calls.iter().any(|c| c.name == "get_version"))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_stream_emits_tool_info() {
        let runtime = test_runtime().await;
        let agent = Agent::builder(spec(), runtime)
            .register_skill(GetVersion)
            .unwrap()
            .build();

        let conv = agent.conversation("s2").unwrap();
        let stream = conv
            .stream_prompt("What is your version number?", Default::default())
            .await
            .unwrap();
        let events: Vec<_> = stream.collect().await;

        assert!(events.iter().any(|e| matches!(
            e,
            LlmStreamEvent::ToolInfo(call) if call.name == "get_version"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            LlmStreamEvent::ToolResult(call) if call.result.as_deref() == Some("\"v1.0.5\"")
        )));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                LlmStreamEvent::Content(c) => Some(c.as_str()),
                _ => None,
            })
            .collect();
        assert!(text.contains("v1.0.5"));
        assert_eq!(
            events.iter().filter(|e| matches!(e, LlmStreamEvent::End)).count(),
            1
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_usage_event_emitted() {
        let runtime = test_runtime().await;
        let mut usage_rx = runtime.usage_bus().subscribe();
        let agent = Agent::builder(spec(), runtime).build();

        let conv = agent.conversation("s3").unwrap();
        conv.prompt("Hello").await.unwrap();

        let event = usage_rx.recv().await.unwrap();
        assert_eq!(event.source_id, "llm:echo");
        assert!(event.input_tokens > 0);
        assert!(event.output_tokens > 0);
        assert_eq!(event.agent_id.as_deref(), Some("agent-1"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_agent_scope_isolation_and_team_sharing() {
        let runtime = test_runtime().await;
        let agent_a = Agent::builder(spec(), runtime.clone()).build();
        let mut spec_b = spec();
        spec_b.id = "agent-2".into();
        let agent_b = Agent::builder(spec_b, runtime).build();

        // Agent scope: private per agent.
        agent_a
            .storage()
            .unwrap()
            .write("notes/a.txt", bytes::Bytes::from_static(b"a"), None, None)
            .await
            .unwrap();
        assert!(matches!(
            agent_b.storage().unwrap().read("notes/a.txt").await,
            Err(Error::AccessDenied)
        ));

        // Team scope: shared across the team's agents.
        agent_a
            .storage_scoped(Scope::Team)
            .unwrap()
            .write("shared/t.txt", bytes::Bytes::from_static(b"t"), None, None)
            .await
            .unwrap();
        let data = agent_b
            .storage_scoped(Scope::Team)
            .unwrap()
            .read("shared/t.txt")
            .await
            .unwrap();
        assert_eq!(&data[..], b"t");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_single_flight_coalesces_concurrent_calls() {
        use std::sync::atomic::{AtomicU32, Ordering};

        static CALLS: AtomicU32 = AtomicU32::new(0);

        struct SlowSkill;
        impl Skill for SlowSkill {
            type Args = NoArgs;
            type Output = u32;

            fn name(&self) -> String {
                "slow".into()
            }
            fn description(&self) -> String {
                "slow counter".into()
            }
            async fn process(&self, _ctx: SkillContext, _args: NoArgs) -> Result<u32> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(CALLS.load(Ordering::SeqCst))
            }
        }

        let runtime = test_runtime().await;
        let agent = Agent::builder(spec(), runtime)
            .register_skill(SlowSkill)
            .unwrap()
            .with_options(AgentOptions {
                single_flight: true,
                ..Default::default()
            })
            .build();

        let call = ToolCallData {
            id: "c".into(),
            name: "slow".into(),
            args: "{}".into(),
            result: None,
        };
        let (a, b) = tokio::join!(agent.dispatch(&call), agent.dispatch(&call));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_skill_name_validation() {
        let mut set = SkillSet::new();
        struct Bad;
        impl Skill for Bad {
            type Args = NoArgs;
            type Output = ();
            fn name(&self) -> String {
                "Bad-Name".into()
            }
            fn description(&self) -> String {
                String::new()
            }
            async fn process(&self, _ctx: SkillContext, _args: NoArgs) -> Result<()> {
                Ok(())
            }
        }
        assert!(set.add(Bad).is_err());
    }
}
