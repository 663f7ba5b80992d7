//! Connector service bus.
//!
//! The [`Runtime`] is the single place where concrete backends are
//! selected. Providers register factories under `(subsystem, name)`;
//! `init` builds singleton instances and runs their `start` hook; typed
//! getters hand out shared handles; `stop` tears everything down in
//! reverse init order. Core code never names a provider -- it asks the bus.
//!
//! Lifecycle: register -> init (async) -> ready -> serve -> stop. Mutations
//! are serialized and rejected once the runtime is ready.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use smyth_core::account::AccountConnector;
use smyth_core::cache::CacheConnector;
use smyth_core::llm::LlmConnector;
use smyth_core::nkv::NkvConnector;
use smyth_core::storage::StorageConnector;
use smyth_core::vault::VaultConnector;
use smyth_core::vectordb::VectorDbConnector;
use smyth_core::{AccessCandidate, BoxPinFut, Connector, Error, Json, Result, Subsystem};

use crate::requester::Requester;
use crate::usage::UsageBus;

/// A constructed connector, tagged by subsystem so typed getters stay
/// cheap. Subsystems without a dedicated contract (Code, Router, ...) ride
/// in `Other`.
#[derive(Clone)]
pub enum ConnectorHandle {
    Storage(Arc<dyn StorageConnector>),
    Vault(Arc<dyn VaultConnector>),
    Cache(Arc<dyn CacheConnector>),
    Nkv(Arc<dyn NkvConnector>),
    VectorDb(Arc<dyn VectorDbConnector>),
    Llm(Arc<dyn LlmConnector>),
    Account(Arc<dyn AccountConnector>),
    Other(Arc<dyn Connector>),
}

impl std::fmt::Debug for ConnectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            ConnectorHandle::Storage(_) => "Storage",
            ConnectorHandle::Vault(_) => "Vault",
            ConnectorHandle::Cache(_) => "Cache",
            ConnectorHandle::Nkv(_) => "Nkv",
            ConnectorHandle::VectorDb(_) => "VectorDb",
            ConnectorHandle::Llm(_) => "Llm",
            ConnectorHandle::Account(_) => "Account",
            ConnectorHandle::Other(_) => "Other",
        };
        f.debug_tuple(variant).finish()
    }
}

impl ConnectorHandle {
    fn as_connector(&self) -> Arc<dyn Connector> {
        match self {
            ConnectorHandle::Storage(c) => c.clone(),
            ConnectorHandle::Vault(c) => c.clone(),
            ConnectorHandle::Cache(c) => c.clone(),
            ConnectorHandle::Nkv(c) => c.clone(),
            ConnectorHandle::VectorDb(c) => c.clone(),
            ConnectorHandle::Llm(c) => c.clone(),
            ConnectorHandle::Account(c) => c.clone(),
            ConnectorHandle::Other(c) => c.clone(),
        }
    }
}

/// Async factory building a connector from opaque settings.
pub type ConnectorFactory = Arc<dyn Fn(Json) -> BoxPinFut<Result<ConnectorHandle>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Initializing,
    Ready,
    Stopping,
}

/// Per-subsystem binding in the startup configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubsystemConfig {
    #[serde(rename = "Connector")]
    pub connector: String,
    #[serde(rename = "Settings", default)]
    pub settings: Json,
}

/// Startup configuration: `{ [Subsystem]: { Connector, Settings } }`.
/// Every referenced connector name must have been registered beforehand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SreConfig(pub BTreeMap<Subsystem, SubsystemConfig>);

#[derive(Default)]
struct BusState {
    registry: BTreeMap<Subsystem, BTreeMap<String, ConnectorFactory>>,
    instances: BTreeMap<Subsystem, BTreeMap<String, ConnectorHandle>>,
    /// Canonical settings each instance was built with, for conflict checks.
    settings: BTreeMap<(Subsystem, String), String>,
    defaults: BTreeMap<Subsystem, String>,
    init_order: Vec<(Subsystem, String)>,
}

struct RuntimeInner {
    state: Mutex<BusState>,
    status: Mutex<RuntimeStatus>,
    /// Serializes init/stop across their await points.
    lifecycle: tokio::sync::Mutex<()>,
    usage: UsageBus,
}

/// The process-wide runtime value. Cloning shares the same bus; there are
/// no hidden globals -- pass the runtime to whoever needs connectors.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                state: Mutex::new(BusState::default()),
                status: Mutex::new(RuntimeStatus::Initializing),
                lifecycle: tokio::sync::Mutex::new(()),
                usage: UsageBus::new(),
            }),
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.inner.status.lock()
    }

    pub fn usage_bus(&self) -> &UsageBus {
        &self.inner.usage
    }

    /// Registers a factory under `(subsystem, name)`. Re-registering the
    /// same name replaces the factory (the later registration wins);
    /// already-built instances are unaffected.
    pub fn register(
        &self,
        subsystem: Subsystem,
        name: impl Into<String>,
        factory: ConnectorFactory,
    ) -> Result<()> {
        if self.status() != RuntimeStatus::Initializing {
            return Err(Error::Conflict(
                "connectors cannot be registered after the runtime is ready".into(),
            ));
        }
        let mut state = self.inner.state.lock();
        state
            .registry
            .entry(subsystem)
            .or_default()
            .insert(name.into(), factory);
        Ok(())
    }

    /// Builds the `(subsystem, name)` singleton, runs its `start` hook, and
    /// makes it the subsystem default if it is the first instance.
    /// Re-initializing with identical settings returns the existing
    /// instance; conflicting settings fail.
    pub async fn init(
        &self,
        subsystem: Subsystem,
        name: &str,
        settings: Json,
    ) -> Result<ConnectorHandle> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.status() != RuntimeStatus::Initializing {
            return Err(Error::Conflict(
                "connectors cannot be initialized after the runtime is ready".into(),
            ));
        }

        let fingerprint = settings.to_string();
        let factory = {
            let state = self.inner.state.lock();
            if let Some(existing) = state
                .instances
                .get(&subsystem)
                .and_then(|by_name| by_name.get(name))
            {
                let prior = state.settings.get(&(subsystem, name.to_string()));
                if prior.map(|s| s.as_str()) == Some(fingerprint.as_str()) {
                    return Ok(existing.clone());
                }
                return Err(Error::Conflict(format!(
                    "{subsystem}:{name} already initialized with different settings"
                )));
            }
            state
                .registry
                .get(&subsystem)
                .and_then(|by_name| by_name.get(name))
                .cloned()
                .ok_or_else(|| {
                    Error::Configuration(format!("connector {subsystem}:{name} is not registered"))
                })?
        };

        let handle = factory(settings).await?;
        handle.as_connector().start().await?;

        let mut state = self.inner.state.lock();
        state
            .instances
            .entry(subsystem)
            .or_default()
            .insert(name.to_string(), handle.clone());
        state
            .settings
            .insert((subsystem, name.to_string()), fingerprint);
        state.defaults.entry(subsystem).or_insert_with(|| name.to_string());
        state.init_order.push((subsystem, name.to_string()));
        log::info!(target: "runtime", subsystem = subsystem.as_str(), connector = name; "connector initialized");
        Ok(handle)
    }

    /// Initializes every subsystem named in the configuration.
    pub async fn init_from_config(&self, config: &SreConfig) -> Result<()> {
        for (subsystem, binding) in &config.0 {
            self.init(*subsystem, &binding.connector, binding.settings.clone())
                .await?;
        }
        Ok(())
    }

    /// Freezes registration and marks the runtime ready to serve.
    pub fn ready(&self) {
        let mut status = self.inner.status.lock();
        if *status == RuntimeStatus::Initializing {
            *status = RuntimeStatus::Ready;
        }
    }

    /// Stops all connectors in reverse init order. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        *self.inner.status.lock() = RuntimeStatus::Stopping;
        let order: Vec<(Subsystem, String)> = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.init_order)
        };
        for (subsystem, name) in order.into_iter().rev() {
            let handle = {
                let state = self.inner.state.lock();
                state
                    .instances
                    .get(&subsystem)
                    .and_then(|by_name| by_name.get(&name))
                    .cloned()
            };
            if let Some(handle) = handle {
                if let Err(err) = handle.as_connector().stop().await {
                    log::warn!(target: "runtime", subsystem = subsystem.as_str(), connector = name.as_str(), error = err.to_string(); "connector stop failed");
                }
            }
        }
        Ok(())
    }

    /// Untyped instance lookup; `name` omitted resolves the subsystem
    /// default.
    pub fn connector(&self, subsystem: Subsystem, name: Option<&str>) -> Result<ConnectorHandle> {
        let state = self.inner.state.lock();
        let name = match name {
            Some(n) => n.to_string(),
            None => state
                .defaults
                .get(&subsystem)
                .cloned()
                .ok_or_else(|| {
                    Error::Configuration(format!("no {subsystem} connector initialized"))
                })?,
        };
        state
            .instances
            .get(&subsystem)
            .and_then(|by_name| by_name.get(&name))
            .cloned()
            .ok_or_else(|| {
                Error::Configuration(format!("connector {subsystem}:{name} is not initialized"))
            })
    }

    pub fn storage(&self, name: Option<&str>) -> Result<Arc<dyn StorageConnector>> {
        match self.connector(Subsystem::Storage, name)? {
            ConnectorHandle::Storage(c) => Ok(c),
            _ => Err(Error::Configuration("Storage connector has wrong type".into())),
        }
    }

    pub fn vault(&self, name: Option<&str>) -> Result<Arc<dyn VaultConnector>> {
        match self.connector(Subsystem::Vault, name)? {
            ConnectorHandle::Vault(c) => Ok(c),
            _ => Err(Error::Configuration("Vault connector has wrong type".into())),
        }
    }

    pub fn cache(&self, name: Option<&str>) -> Result<Arc<dyn CacheConnector>> {
        match self.connector(Subsystem::Cache, name)? {
            ConnectorHandle::Cache(c) => Ok(c),
            _ => Err(Error::Configuration("Cache connector has wrong type".into())),
        }
    }

    pub fn nkv(&self, name: Option<&str>) -> Result<Arc<dyn NkvConnector>> {
        match self.connector(Subsystem::Nkv, name)? {
            ConnectorHandle::Nkv(c) => Ok(c),
            _ => Err(Error::Configuration("NKV connector has wrong type".into())),
        }
    }

    pub fn vector_db(&self, name: Option<&str>) -> Result<Arc<dyn VectorDbConnector>> {
        match self.connector(Subsystem::VectorDb, name)? {
            ConnectorHandle::VectorDb(c) => Ok(c),
            _ => Err(Error::Configuration("VectorDB connector has wrong type".into())),
        }
    }

    pub fn llm(&self, name: Option<&str>) -> Result<Arc<dyn LlmConnector>> {
        match self.connector(Subsystem::Llm, name)? {
            ConnectorHandle::Llm(c) => Ok(c),
            _ => Err(Error::Configuration("LLM connector has wrong type".into())),
        }
    }

    pub fn account(&self, name: Option<&str>) -> Result<Arc<dyn AccountConnector>> {
        match self.connector(Subsystem::Account, name)? {
            ConnectorHandle::Account(c) => Ok(c),
            _ => Err(Error::Configuration("Account connector has wrong type".into())),
        }
    }

    /// Candidate-bound client bundle; the wrappers run every call through
    /// the access guard.
    pub fn requester(&self, candidate: AccessCandidate) -> Requester {
        Requester::new(self.clone(), candidate)
    }

    pub fn user(&self, id: impl Into<String>) -> Requester {
        self.requester(AccessCandidate::user(id))
    }

    pub fn team(&self, id: impl Into<String>) -> Requester {
        self.requester(AccessCandidate::team(id))
    }

    pub fn agent(&self, id: impl Into<String>) -> Requester {
        self.requester(AccessCandidate::agent(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::cache::MemoryCache;

    fn cache_factory() -> ConnectorFactory {
        Arc::new(|_settings: Json| -> BoxPinFut<Result<ConnectorHandle>> {
            Box::pin(async { Ok(ConnectorHandle::Cache(Arc::new(MemoryCache::new()))) })
        })
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_register_init_get() {
        let rt = Runtime::new();
        rt.register(Subsystem::Cache, "RAM", cache_factory()).unwrap();
        rt.init(Subsystem::Cache, "RAM", Json::Null).await.unwrap();
        rt.ready();

        assert_eq!(rt.status(), RuntimeStatus::Ready);
        // Named and default lookups resolve the same singleton.
        assert!(rt.cache(None).is_ok());
        assert!(rt.cache(Some("RAM")).is_ok());
        assert!(rt.cache(Some("Redis")).is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_unknown_connector() {
        let rt = Runtime::new();
        let err = rt
            .init(Subsystem::Cache, "Redis", Json::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_reinit_same_settings_is_idempotent() {
        let rt = Runtime::new();
        rt.register(Subsystem::Cache, "RAM", cache_factory()).unwrap();
        rt.init(Subsystem::Cache, "RAM", serde_json::json!({"cap": 10}))
            .await
            .unwrap();
        assert!(
            rt.init(Subsystem::Cache, "RAM", serde_json::json!({"cap": 10}))
                .await
                .is_ok()
        );
        let err = rt
            .init(Subsystem::Cache, "RAM", serde_json::json!({"cap": 20}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_no_mutation_after_ready() {
        let rt = Runtime::new();
        rt.register(Subsystem::Cache, "RAM", cache_factory()).unwrap();
        rt.ready();
        assert!(rt.register(Subsystem::Cache, "RAM2", cache_factory()).is_err());
        assert!(rt.init(Subsystem::Cache, "RAM", Json::Null).await.is_err());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_stop_is_idempotent() {
        let rt = Runtime::new();
        rt.register(Subsystem::Cache, "RAM", cache_factory()).unwrap();
        rt.init(Subsystem::Cache, "RAM", Json::Null).await.unwrap();
        rt.ready();
        rt.stop().await.unwrap();
        rt.stop().await.unwrap();
        assert_eq!(rt.status(), RuntimeStatus::Stopping);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_init_from_config() {
        let rt = Runtime::new();
        rt.register(Subsystem::Cache, "RAM", cache_factory()).unwrap();
        let config: SreConfig = serde_json::from_value(serde_json::json!({
            "Cache": { "Connector": "RAM", "Settings": {} }
        }))
        .unwrap();
        rt.init_from_config(&config).await.unwrap();
        rt.ready();
        assert!(rt.cache(None).is_ok());
    }
}
