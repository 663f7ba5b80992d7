//! Candidate-bound connector clients.
//!
//! A [`Requester`] binds an [`AccessCandidate`] once; the clients it hands
//! out expose the connector API without the explicit `AccessRequest`
//! argument and run every call through the secure pipeline: derive the
//! resource id, fetch the resource ACL (cached up to 60 s), check the
//! level, then dispatch. Read-only methods check Read, mutations check
//! Write, ACL mutations check Owner. Idempotent calls are retried on
//! backend failures; mutations never are.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use smyth_core::account::AccountConnector;
use smyth_core::cache::{CacheConnector, CacheExpiry};
use smyth_core::llm::{LlmConnector, LlmEventStream, LlmRequest, LlmResponse, LlmStreamEvent};
use smyth_core::nkv::NkvConnector;
use smyth_core::storage::{StorageConnector, StorageMetadata};
use smyth_core::usage::{KeySource, UsageEvent};
use smyth_core::vault::VaultConnector;
use smyth_core::vectordb::{
    Datasource, DatasourceInput, DeleteTarget, NamespaceInfo, SearchOptions, SearchQuery,
    SearchResult, SourceInput, VectorDbConnector, prepared_namespace,
};
use smyth_core::{
    AccessCandidate, AccessLevel, AccessRequest, AccessRole, Acl, Error, Result,
};

use crate::guard::{authorize, bounded, invalidate_acl, retry_idempotent};
use crate::runtime::Runtime;

const STORAGE_TIMEOUT: Duration = Duration::from_secs(30);
const VECTORDB_TIMEOUT: Duration = Duration::from_secs(30);
const CACHE_TIMEOUT: Duration = Duration::from_secs(5);
const VAULT_TIMEOUT: Duration = Duration::from_secs(5);
const LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// Client bundle bound to one candidate.
#[derive(Clone)]
pub struct Requester {
    runtime: Runtime,
    candidate: AccessCandidate,
    cancel: CancellationToken,
}

impl Requester {
    pub(crate) fn new(runtime: Runtime, candidate: AccessCandidate) -> Self {
        Self {
            runtime,
            candidate,
            cancel: CancellationToken::new(),
        }
    }

    pub fn candidate(&self) -> &AccessCandidate {
        &self.candidate
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Replaces the ambient cancellation token for clients created after
    /// this call.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn acl_cache(&self) -> Option<Arc<dyn CacheConnector>> {
        self.runtime.cache(None).ok()
    }

    pub fn storage(&self) -> Result<StorageClient> {
        self.storage_named(None)
    }

    pub fn storage_named(&self, name: Option<&str>) -> Result<StorageClient> {
        Ok(StorageClient {
            connector: self.runtime.storage(name)?,
            acl_cache: self.acl_cache(),
            candidate: self.candidate.clone(),
            cancel: self.cancel.clone(),
        })
    }

    pub fn vector_db(&self) -> Result<VectorDbClient> {
        self.vector_db_named(None)
    }

    pub fn vector_db_named(&self, name: Option<&str>) -> Result<VectorDbClient> {
        Ok(VectorDbClient {
            connector: self.runtime.vector_db(name)?,
            acl_cache: self.acl_cache(),
            candidate: self.candidate.clone(),
            cancel: self.cancel.clone(),
        })
    }

    pub fn nkv(&self) -> Result<NkvClient> {
        Ok(NkvClient {
            connector: self.runtime.nkv(None)?,
            acl_cache: self.acl_cache(),
            candidate: self.candidate.clone(),
            cancel: self.cancel.clone(),
        })
    }

    pub fn cache(&self) -> Result<CacheClient> {
        Ok(CacheClient {
            connector: self.runtime.cache(None)?,
            candidate: self.candidate.clone(),
            cancel: self.cancel.clone(),
        })
    }

    pub fn vault(&self) -> Result<VaultClient> {
        Ok(VaultClient {
            connector: self.runtime.vault(None)?,
            account: self.runtime.account(None).ok(),
            candidate: self.candidate.clone(),
            cancel: self.cancel.clone(),
        })
    }

    pub fn llm(&self) -> Result<LlmClient> {
        self.llm_named(None)
    }

    pub fn llm_named(&self, name: Option<&str>) -> Result<LlmClient> {
        Ok(LlmClient {
            connector: self.runtime.llm(name)?,
            runtime: self.runtime.clone(),
            candidate: self.candidate.clone(),
            cancel: self.cancel.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Storage

#[derive(Clone)]
pub struct StorageClient {
    connector: Arc<dyn StorageConnector>,
    acl_cache: Option<Arc<dyn CacheConnector>>,
    candidate: AccessCandidate,
    cancel: CancellationToken,
}

impl StorageClient {
    pub fn candidate(&self) -> &AccessCandidate {
        &self.candidate
    }

    async fn authorize(&self, level: AccessLevel, path: &str) -> Result<AccessRequest> {
        let connector = self.connector.clone();
        let candidate = self.candidate.clone();
        let resource = path.to_string();
        authorize(self.acl_cache.as_ref(), &self.candidate, level, path, move || async move {
            connector.resource_acl(&resource, &candidate).await
        })
        .await
    }

    pub async fn read(&self, path: &str) -> Result<Bytes> {
        let req = self.authorize(AccessLevel::Read, path).await?;
        retry_idempotent(|| {
            bounded("Storage", STORAGE_TIMEOUT, &self.cancel, self.connector.read(&req, path))
        })
        .await
    }

    pub async fn write(
        &self,
        path: &str,
        data: Bytes,
        acl: Option<Acl>,
        metadata: Option<StorageMetadata>,
    ) -> Result<()> {
        let req = self.authorize(AccessLevel::Write, path).await?;
        bounded(
            "Storage",
            STORAGE_TIMEOUT,
            &self.cancel,
            self.connector.write(&req, path, data, acl, metadata),
        )
        .await?;
        invalidate_acl(self.acl_cache.as_ref(), &self.candidate, path).await;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let req = self.authorize(AccessLevel::Write, path).await?;
        bounded(
            "Storage",
            STORAGE_TIMEOUT,
            &self.cancel,
            self.connector.delete(&req, path),
        )
        .await?;
        invalidate_acl(self.acl_cache.as_ref(), &self.candidate, path).await;
        Ok(())
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        let req = self.authorize(AccessLevel::Read, path).await?;
        retry_idempotent(|| {
            bounded("Storage", STORAGE_TIMEOUT, &self.cancel, self.connector.exists(&req, path))
        })
        .await
    }

    pub async fn get_metadata(&self, path: &str) -> Result<StorageMetadata> {
        let req = self.authorize(AccessLevel::Read, path).await?;
        retry_idempotent(|| {
            bounded(
                "Storage",
                STORAGE_TIMEOUT,
                &self.cancel,
                self.connector.get_metadata(&req, path),
            )
        })
        .await
    }

    pub async fn set_metadata(&self, path: &str, metadata: StorageMetadata) -> Result<()> {
        let req = self.authorize(AccessLevel::Write, path).await?;
        bounded(
            "Storage",
            STORAGE_TIMEOUT,
            &self.cancel,
            self.connector.set_metadata(&req, path, metadata),
        )
        .await
    }

    pub async fn get_acl(&self, path: &str) -> Result<Option<Acl>> {
        let req = self.authorize(AccessLevel::Read, path).await?;
        retry_idempotent(|| {
            bounded("Storage", STORAGE_TIMEOUT, &self.cancel, self.connector.get_acl(&req, path))
        })
        .await
    }

    pub async fn set_acl(&self, path: &str, acl: Acl) -> Result<()> {
        let req = self.authorize(AccessLevel::Owner, path).await?;
        bounded(
            "Storage",
            STORAGE_TIMEOUT,
            &self.cancel,
            self.connector.set_acl(&req, path, acl),
        )
        .await?;
        invalidate_acl(self.acl_cache.as_ref(), &self.candidate, path).await;
        Ok(())
    }

    pub async fn expire(&self, path: &str, ttl: Duration) -> Result<()> {
        let req = self.authorize(AccessLevel::Write, path).await?;
        bounded(
            "Storage",
            STORAGE_TIMEOUT,
            &self.cancel,
            self.connector.expire(&req, path, ttl),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// VectorDB

#[derive(Clone)]
pub struct VectorDbClient {
    connector: Arc<dyn VectorDbConnector>,
    acl_cache: Option<Arc<dyn CacheConnector>>,
    candidate: AccessCandidate,
    cancel: CancellationToken,
}

impl VectorDbClient {
    pub fn candidate(&self) -> &AccessCandidate {
        &self.candidate
    }

    async fn authorize(&self, level: AccessLevel, namespace: &str) -> Result<AccessRequest> {
        let prepared = prepared_namespace(&self.candidate, namespace);
        let connector = self.connector.clone();
        let candidate = self.candidate.clone();
        let resource = prepared.clone();
        authorize(
            self.acl_cache.as_ref(),
            &self.candidate,
            level,
            &prepared,
            move || async move { connector.resource_acl(&resource, &candidate).await },
        )
        .await
    }

    pub async fn create_namespace(
        &self,
        namespace: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<NamespaceInfo> {
        let req = self.authorize(AccessLevel::Write, namespace).await?;
        bounded(
            "VectorDB",
            VECTORDB_TIMEOUT,
            &self.cancel,
            self.connector.create_namespace(&req, namespace, metadata),
        )
        .await
    }

    pub async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        let req = self.authorize(AccessLevel::Read, namespace).await?;
        retry_idempotent(|| {
            bounded(
                "VectorDB",
                VECTORDB_TIMEOUT,
                &self.cancel,
                self.connector.namespace_exists(&req, namespace),
            )
        })
        .await
    }

    pub async fn get_namespace(&self, namespace: &str) -> Result<NamespaceInfo> {
        let req = self.authorize(AccessLevel::Read, namespace).await?;
        retry_idempotent(|| {
            bounded(
                "VectorDB",
                VECTORDB_TIMEOUT,
                &self.cancel,
                self.connector.get_namespace(&req, namespace),
            )
        })
        .await
    }

    pub async fn delete_namespace(&self, namespace: &str) -> Result<()> {
        let req = self.authorize(AccessLevel::Owner, namespace).await?;
        bounded(
            "VectorDB",
            VECTORDB_TIMEOUT,
            &self.cancel,
            self.connector.delete_namespace(&req, namespace),
        )
        .await?;
        let prepared = prepared_namespace(&self.candidate, namespace);
        invalidate_acl(self.acl_cache.as_ref(), &self.candidate, &prepared).await;
        Ok(())
    }

    pub async fn insert(&self, namespace: &str, sources: Vec<SourceInput>) -> Result<Vec<String>> {
        let req = self.authorize(AccessLevel::Write, namespace).await?;
        bounded(
            "VectorDB",
            VECTORDB_TIMEOUT,
            &self.cancel,
            self.connector.insert(&req, namespace, sources),
        )
        .await
    }

    pub async fn delete(&self, namespace: &str, target: DeleteTarget) -> Result<()> {
        let req = self.authorize(AccessLevel::Write, namespace).await?;
        bounded(
            "VectorDB",
            VECTORDB_TIMEOUT,
            &self.cancel,
            self.connector.delete(&req, namespace, target),
        )
        .await
    }

    pub async fn search(
        &self,
        namespace: &str,
        query: SearchQuery,
        options: SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let req = self.authorize(AccessLevel::Read, namespace).await?;
        retry_idempotent(|| {
            bounded(
                "VectorDB",
                VECTORDB_TIMEOUT,
                &self.cancel,
                self.connector
                    .search(&req, namespace, query.clone(), options.clone()),
            )
        })
        .await
    }

    pub async fn create_datasource(
        &self,
        namespace: &str,
        input: DatasourceInput,
    ) -> Result<Datasource> {
        let req = self.authorize(AccessLevel::Write, namespace).await?;
        bounded(
            "VectorDB",
            VECTORDB_TIMEOUT,
            &self.cancel,
            self.connector.create_datasource(&req, namespace, input),
        )
        .await
    }

    pub async fn get_datasource(&self, namespace: &str, id: &str) -> Result<Option<Datasource>> {
        let req = self.authorize(AccessLevel::Read, namespace).await?;
        retry_idempotent(|| {
            bounded(
                "VectorDB",
                VECTORDB_TIMEOUT,
                &self.cancel,
                self.connector.get_datasource(&req, namespace, id),
            )
        })
        .await
    }

    pub async fn delete_datasource(&self, namespace: &str, id: &str) -> Result<()> {
        let req = self.authorize(AccessLevel::Write, namespace).await?;
        bounded(
            "VectorDB",
            VECTORDB_TIMEOUT,
            &self.cancel,
            self.connector.delete_datasource(&req, namespace, id),
        )
        .await
    }

    pub async fn list_datasources(&self, namespace: &str) -> Result<Vec<Datasource>> {
        let req = self.authorize(AccessLevel::Read, namespace).await?;
        retry_idempotent(|| {
            bounded(
                "VectorDB",
                VECTORDB_TIMEOUT,
                &self.cancel,
                self.connector.list_datasources(&req, namespace),
            )
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// NKV

#[derive(Clone)]
pub struct NkvClient {
    connector: Arc<dyn NkvConnector>,
    acl_cache: Option<Arc<dyn CacheConnector>>,
    candidate: AccessCandidate,
    cancel: CancellationToken,
}

impl NkvClient {
    async fn authorize(&self, level: AccessLevel, store: &str) -> Result<AccessRequest> {
        let connector = self.connector.clone();
        let candidate = self.candidate.clone();
        let resource = store.to_string();
        authorize(self.acl_cache.as_ref(), &self.candidate, level, store, move || async move {
            connector.resource_acl(&resource, &candidate).await
        })
        .await
    }

    pub async fn set(&self, store: &str, key: &str, value: String) -> Result<()> {
        let req = self.authorize(AccessLevel::Write, store).await?;
        bounded(
            "NKV",
            CACHE_TIMEOUT,
            &self.cancel,
            self.connector.set(&req, store, key, value),
        )
        .await
    }

    pub async fn get(&self, store: &str, key: &str) -> Result<Option<String>> {
        let req = self.authorize(AccessLevel::Read, store).await?;
        retry_idempotent(|| {
            bounded("NKV", CACHE_TIMEOUT, &self.cancel, self.connector.get(&req, store, key))
        })
        .await
    }

    pub async fn delete(&self, store: &str, key: &str) -> Result<()> {
        let req = self.authorize(AccessLevel::Write, store).await?;
        bounded(
            "NKV",
            CACHE_TIMEOUT,
            &self.cancel,
            self.connector.delete(&req, store, key),
        )
        .await
    }

    pub async fn list(&self, store: &str) -> Result<Vec<(String, String)>> {
        let req = self.authorize(AccessLevel::Read, store).await?;
        retry_idempotent(|| {
            bounded("NKV", CACHE_TIMEOUT, &self.cancel, self.connector.list(&req, store))
        })
        .await
    }

    pub async fn delete_store(&self, store: &str) -> Result<()> {
        let req = self.authorize(AccessLevel::Owner, store).await?;
        bounded(
            "NKV",
            CACHE_TIMEOUT,
            &self.cancel,
            self.connector.delete_store(&req, store),
        )
        .await?;
        invalidate_acl(self.acl_cache.as_ref(), &self.candidate, store).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cache

#[derive(Clone)]
pub struct CacheClient {
    connector: Arc<dyn CacheConnector>,
    candidate: AccessCandidate,
    cancel: CancellationToken,
}

impl CacheClient {
    async fn authorize(&self, level: AccessLevel, key: &str) -> Result<AccessRequest> {
        let connector = self.connector.clone();
        let candidate = self.candidate.clone();
        let resource = key.to_string();
        // The cache never caches its own ACLs.
        authorize(None, &self.candidate, level, key, move || async move {
            connector.resource_acl(&resource, &candidate).await
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let req = self.authorize(AccessLevel::Read, key).await?;
        bounded("Cache", CACHE_TIMEOUT, &self.cancel, self.connector.get(&req, key)).await
    }

    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let req = self.authorize(AccessLevel::Write, key).await?;
        bounded(
            "Cache",
            CACHE_TIMEOUT,
            &self.cancel,
            self.connector
                .set(&req, key, value, ttl.map(CacheExpiry::TTL)),
        )
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let req = self.authorize(AccessLevel::Write, key).await?;
        bounded("Cache", CACHE_TIMEOUT, &self.cancel, self.connector.delete(&req, key)).await
    }
}

// ---------------------------------------------------------------------------
// Vault

#[derive(Clone)]
pub struct VaultClient {
    connector: Arc<dyn VaultConnector>,
    account: Option<Arc<dyn AccountConnector>>,
    candidate: AccessCandidate,
    cancel: CancellationToken,
}

impl VaultClient {
    async fn team(&self) -> Result<String> {
        match &self.account {
            Some(account) => account.team_of(&self.candidate).await,
            None if self.candidate.role() == AccessRole::Team => {
                Ok(self.candidate.id().to_string())
            }
            None => Err(Error::Configuration(
                "no Account connector to resolve the candidate's team".into(),
            )),
        }
    }

    /// Vault grants are team-level; the candidate acts with its resolved
    /// team's authority.
    async fn authorize(&self, team: &str, key_id: &str) -> Result<AccessRequest> {
        let connector = self.connector.clone();
        let team_candidate = AccessCandidate::team(team);
        let fetch_candidate = team_candidate.clone();
        let resource = key_id.to_string();
        authorize(None, &team_candidate, AccessLevel::Read, key_id, move || async move {
            connector.resource_acl(&resource, &fetch_candidate).await
        })
        .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let team = self.team().await?;
        let req = self.authorize(&team, &format!("{team}.{key}")).await?;
        retry_idempotent(|| {
            bounded("Vault", VAULT_TIMEOUT, &self.cancel, self.connector.get(&req, &team, key))
        })
        .await
    }

    /// [`VaultClient::get`] that treats an absent key as an error.
    pub async fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .await?
            .ok_or_else(|| Error::VaultKeyMissing(key.to_string()))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let team = self.team().await?;
        let req = self.authorize(&team, &format!("{team}.{key}")).await?;
        retry_idempotent(|| {
            bounded("Vault", VAULT_TIMEOUT, &self.cancel, self.connector.exists(&req, &team, key))
        })
        .await
    }

    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let team = self.team().await?;
        let req = self.authorize(&team, &team).await?;
        retry_idempotent(|| {
            bounded("Vault", VAULT_TIMEOUT, &self.cancel, self.connector.list_keys(&req, &team))
        })
        .await
    }

    pub async fn get_acl(&self, key: &str) -> Result<Acl> {
        let team = self.team().await?;
        let key_id = format!("{team}.{key}");
        let req = self.authorize(&team, &key_id).await?;
        retry_idempotent(|| {
            bounded("Vault", VAULT_TIMEOUT, &self.cancel, self.connector.get_acl(&req, &key_id))
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// LLM

#[derive(Clone)]
pub struct LlmClient {
    connector: Arc<dyn LlmConnector>,
    runtime: Runtime,
    candidate: AccessCandidate,
    cancel: CancellationToken,
}

impl LlmClient {
    pub fn candidate(&self) -> &AccessCandidate {
        &self.candidate
    }

    async fn authorize(&self, model: &str) -> Result<AccessRequest> {
        let connector = self.connector.clone();
        let candidate = self.candidate.clone();
        let resource = model.to_string();
        authorize(None, &self.candidate, AccessLevel::Read, model, move || async move {
            connector.resource_acl(&resource, &candidate).await
        })
        .await
    }

    /// Resolves the API key from the candidate's vault under the connector
    /// name; a hit marks the usage as paid by the caller.
    async fn resolve_key(&self) -> (Option<String>, KeySource) {
        let vault = self.runtime.requester(self.candidate.clone()).vault();
        if let Ok(vault) = vault {
            let key_name = self.connector.name().to_ascii_lowercase();
            if let Ok(Some(key)) = vault.get(&key_name).await {
                return (Some(key), KeySource::User);
            }
        }
        (None, KeySource::Smyth)
    }

    async fn usage_ids(&self) -> (Option<String>, Option<String>) {
        let agent_id = (self.candidate.role() == AccessRole::Agent)
            .then(|| self.candidate.id().to_string());
        let team_id = match self.runtime.account(None) {
            Ok(account) => account.team_of(&self.candidate).await.ok(),
            Err(_) if self.candidate.role() == AccessRole::Team => {
                Some(self.candidate.id().to_string())
            }
            Err(_) => None,
        };
        (agent_id, team_id)
    }

    pub async fn request(&self, mut params: LlmRequest) -> Result<LlmResponse> {
        let req = self.authorize(&params.model).await?;
        let (key, key_source) = self.resolve_key().await;
        if params.api_key.is_none() {
            params.api_key = key;
        }
        let model = if params.model.is_empty() {
            self.connector.name().to_string()
        } else {
            params.model.clone()
        };

        let response = bounded(
            "LLM",
            LLM_TIMEOUT,
            &self.cancel,
            self.connector.request(&req, params),
        )
        .await?;

        let mut event = UsageEvent::for_model(&model, &response.usage, key_source);
        (event.agent_id, event.team_id) = self.usage_ids().await;
        self.runtime.usage_bus().publish(event);
        Ok(response)
    }

    /// Streaming request. The returned stream republishes the connector's
    /// events and emits exactly one usage event on the bus when the stream
    /// completes without error. No overall timeout applies to streaming.
    pub async fn stream_request(&self, mut params: LlmRequest) -> Result<LlmEventStream> {
        let req = self.authorize(&params.model).await?;
        let (key, key_source) = self.resolve_key().await;
        if params.api_key.is_none() {
            params.api_key = key;
        }
        let model = if params.model.is_empty() {
            self.connector.name().to_string()
        } else {
            params.model.clone()
        };

        let cancel = self.cancel.child_token();
        let inner = self
            .connector
            .stream_request(&req, params, cancel.clone())
            .await?;

        let bus = self.runtime.usage_bus().clone();
        let (agent_id, team_id) = self.usage_ids().await;
        let stream = async_stream::stream! {
            let mut inner = inner;
            let mut usage = None;
            let mut failed = false;
            while let Some(event) = futures_util::StreamExt::next(&mut inner).await {
                match &event {
                    LlmStreamEvent::Usage(u) => usage = Some(*u),
                    LlmStreamEvent::Error(_) => failed = true,
                    LlmStreamEvent::End => {
                        if !failed {
                            if let Some(usage) = usage.take() {
                                let mut ev = UsageEvent::for_model(&model, &usage, key_source);
                                ev.agent_id = agent_id.clone();
                                ev.team_id = team_id.clone();
                                bus.publish(ev);
                            }
                        }
                        yield event;
                        return;
                    }
                    _ => {}
                }
                yield event;
            }
        };
        Ok(Box::pin(stream))
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
