//! `smythfs://` virtual filesystem.
//!
//! Routes `smythfs://<owner>.<role>/<path>` URIs onto the storage
//! connector (`teams/<owner>/...`, `agents/<owner>/...`) with the caller's
//! candidate enforced by the secure pipeline, and issues two kinds of HTTP
//! handles:
//!
//! * **temp URLs** -- `<base_url>/_temp/<token>`, short-lived, backed by a
//!   token record in the cache connector with the temp TTL;
//! * **resource URLs** -- `<agent-public-base>/<opaque-id>.<ext>`, stable,
//!   agent-only, backed by a record in the NKV connector.
//!
//! The HTTP adapter resolves both through [`SmythFs::resolve_temp`] /
//! [`SmythFs::resolve_resource`]: `Ok` means 200 with the recorded
//! Content-Type, [`Error::StorageObjectMissing`] means 404. Cleanup of
//! expired objects runs off the request path.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use smyth_core::storage::StorageMetadata;
use smyth_core::{AccessCandidate, AccessRole, Acl, Error, Result, SmythFsUri};

use crate::requester::StorageClient;
use crate::runtime::Runtime;

pub const DEFAULT_TEMP_TTL: Duration = Duration::from_secs(300);
pub const MIN_TEMP_TTL: Duration = Duration::from_secs(1);
const DEFAULT_BASE_URL: &str = "http://localhost:5656";
const DEFAULT_AGENT_DOMAIN: &str = "agents.smyth.local";
const TEMP_KEY_PREFIX: &str = "tempurl:";
const RESOURCE_STORE: &str = "smythfs_resources";
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Internal principal owning temp-token and resource-url records. Object
/// access at serve time still happens with the *issuing* candidate's
/// authority, which is stored in the record.
fn system_candidate() -> AccessCandidate {
    AccessCandidate::team("_smythfs")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TempUrlRecord {
    uri: String,
    candidate: AccessCandidate,
    delete_on_expiry: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResourceRecord {
    uri: String,
    candidate: AccessCandidate,
}

/// Bytes plus the Content-Type recorded at write time.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedObject {
    pub data: Bytes,
    pub content_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub acl: Option<Acl>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TempUrlOptions {
    pub ttl: Option<Duration>,
    pub delete_on_expiry: bool,
}

#[derive(Clone)]
pub struct SmythFs {
    runtime: Runtime,
    base_url: String,
    agent_domain: String,
}

impl SmythFs {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            base_url: DEFAULT_BASE_URL.to_string(),
            agent_domain: DEFAULT_AGENT_DOMAIN.to_string(),
        }
    }

    /// Host serving `/_temp/<token>` routes.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Domain under which each agent's public base lives
    /// (`https://<agent-id>.<domain>`).
    pub fn with_agent_domain(mut self, domain: impl Into<String>) -> Self {
        self.agent_domain = domain.into();
        self
    }

    /// Maps a URI onto the storage connector's path space: the owner root
    /// comes first, so team and agent trees never collide.
    fn storage_path(uri: &SmythFsUri) -> String {
        format!("{}s/{}/{}", uri.role().as_str(), uri.owner(), uri.path())
    }

    fn storage_for(&self, candidate: &AccessCandidate) -> Result<StorageClient> {
        self.runtime.requester(candidate.clone()).storage()
    }

    pub async fn read(&self, uri: &SmythFsUri, candidate: &AccessCandidate) -> Result<Bytes> {
        self.storage_for(candidate)?
            .read(&Self::storage_path(uri))
            .await
    }

    pub async fn write(
        &self,
        uri: &SmythFsUri,
        data: Bytes,
        candidate: &AccessCandidate,
    ) -> Result<()> {
        self.write_with(uri, data, candidate, WriteOptions::default())
            .await
    }

    pub async fn write_with(
        &self,
        uri: &SmythFsUri,
        data: Bytes,
        candidate: &AccessCandidate,
        opts: WriteOptions,
    ) -> Result<()> {
        let content_type = opts.content_type.or_else(|| {
            uri.extension()
                .and_then(|ext| mime_guess::from_ext(ext).first())
                .map(|m| m.essence_str().to_string())
        });
        let metadata = content_type.map(StorageMetadata::with_content_type);
        self.storage_for(candidate)?
            .write(&Self::storage_path(uri), data, opts.acl, metadata)
            .await
    }

    pub async fn delete(&self, uri: &SmythFsUri, candidate: &AccessCandidate) -> Result<()> {
        self.storage_for(candidate)?
            .delete(&Self::storage_path(uri))
            .await
    }

    pub async fn exists(&self, uri: &SmythFsUri, candidate: &AccessCandidate) -> Result<bool> {
        self.storage_for(candidate)?
            .exists(&Self::storage_path(uri))
            .await
    }

    /// Issues `<base_url>/_temp/<token>` serving the object until the TTL
    /// elapses or the token is destroyed. Issuing requires Read access to
    /// the object.
    pub async fn gen_temp_url(
        &self,
        uri: &SmythFsUri,
        candidate: &AccessCandidate,
        opts: TempUrlOptions,
    ) -> Result<String> {
        let ttl = opts.ttl.unwrap_or(DEFAULT_TEMP_TTL).max(MIN_TEMP_TTL);
        if !self.exists(uri, candidate).await? {
            return Err(Error::StorageObjectMissing(uri.to_string()));
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let record = TempUrlRecord {
            uri: uri.to_string(),
            candidate: candidate.clone(),
            delete_on_expiry: opts.delete_on_expiry,
        };
        let cache = self.runtime.requester(system_candidate()).cache()?;
        cache
            .set(
                &format!("{TEMP_KEY_PREFIX}{token}"),
                serde_json::to_string(&record)
                    .map_err(|err| Error::backend("SmythFS", err))?,
                Some(ttl),
            )
            .await?;

        if opts.delete_on_expiry {
            // Best-effort cleanup off the request path.
            let fs = self.clone();
            let uri = uri.clone();
            let candidate = candidate.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Err(err) = fs.delete(&uri, &candidate).await {
                    log::warn!(target: "smythfs", uri = uri.to_string(), error = err.to_string(); "temp url expiry delete failed");
                }
            });
        }
        Ok(format!("{}/_temp/{token}", self.base_url))
    }

    /// Serves a temp token: the object bytes with the recorded
    /// Content-Type, or [`Error::StorageObjectMissing`] (a 404) once the
    /// token expired or was destroyed.
    pub async fn resolve_temp(&self, token_or_url: &str) -> Result<ServedObject> {
        let token = Self::temp_token(token_or_url);
        let cache = self.runtime.requester(system_candidate()).cache()?;
        let raw = cache
            .get(&format!("{TEMP_KEY_PREFIX}{token}"))
            .await?
            .ok_or_else(|| Error::StorageObjectMissing(format!("_temp/{token}")))?;
        let record: TempUrlRecord =
            serde_json::from_str(&raw).map_err(|err| Error::backend("SmythFS", err))?;
        let uri = SmythFsUri::parse(&record.uri)?;
        self.serve(&uri, &record.candidate).await
    }

    /// Invalidates a temp token; with `delete_resource` the object goes
    /// with it.
    pub async fn destroy_temp_url(&self, token_or_url: &str, delete_resource: bool) -> Result<()> {
        let token = Self::temp_token(token_or_url);
        let key = format!("{TEMP_KEY_PREFIX}{token}");
        let cache = self.runtime.requester(system_candidate()).cache()?;
        if delete_resource {
            if let Some(raw) = cache.get(&key).await? {
                let record: TempUrlRecord =
                    serde_json::from_str(&raw).map_err(|err| Error::backend("SmythFS", err))?;
                let uri = SmythFsUri::parse(&record.uri)?;
                self.delete(&uri, &record.candidate).await?;
            }
        }
        cache.delete(&key).await?;
        Ok(())
    }

    /// Issues a stable, extension-preserving URL under the agent's public
    /// domain. Restricted to Agent candidates.
    pub async fn gen_resource_url(
        &self,
        uri: &SmythFsUri,
        candidate: &AccessCandidate,
    ) -> Result<String> {
        if candidate.role() != AccessRole::Agent {
            return Err(Error::invalid("Only agents can generate resource urls"));
        }
        if !self.exists(uri, candidate).await? {
            return Err(Error::StorageObjectMissing(uri.to_string()));
        }

        let content_type = self
            .storage_for(candidate)?
            .get_metadata(&Self::storage_path(uri))
            .await
            .ok()
            .and_then(|meta| meta.content_type);
        let ext = content_type
            .as_deref()
            .and_then(|ct| mime_guess::get_mime_extensions_str(ct))
            .and_then(|exts| exts.first().copied())
            .or_else(|| uri.extension())
            .unwrap_or("bin");

        let id = xid::new().to_string();
        let record = ResourceRecord {
            uri: uri.to_string(),
            candidate: candidate.clone(),
        };
        let nkv = self.runtime.requester(system_candidate()).nkv()?;
        nkv.set(
            RESOURCE_STORE,
            &id,
            serde_json::to_string(&record).map_err(|err| Error::backend("SmythFS", err))?,
        )
        .await?;
        Ok(format!(
            "https://{}.{}/{id}.{ext}",
            candidate.id(),
            self.agent_domain
        ))
    }

    /// Serves a resource id (`<opaque-id>` or `<opaque-id>.<ext>`).
    pub async fn resolve_resource(&self, id: &str) -> Result<ServedObject> {
        let id = id.split('.').next().unwrap_or(id);
        let nkv = self.runtime.requester(system_candidate()).nkv()?;
        let raw = nkv
            .get(RESOURCE_STORE, id)
            .await?
            .ok_or_else(|| Error::StorageObjectMissing(id.to_string()))?;
        let record: ResourceRecord =
            serde_json::from_str(&raw).map_err(|err| Error::backend("SmythFS", err))?;
        let uri = SmythFsUri::parse(&record.uri)?;
        self.serve(&uri, &record.candidate).await
    }

    async fn serve(&self, uri: &SmythFsUri, candidate: &AccessCandidate) -> Result<ServedObject> {
        let storage = self.storage_for(candidate)?;
        let path = Self::storage_path(uri);
        let data = storage.read(&path).await?;
        let content_type = storage
            .get_metadata(&path)
            .await
            .ok()
            .and_then(|meta| meta.content_type)
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        Ok(ServedObject { data, content_type })
    }

    fn temp_token(token_or_url: &str) -> &str {
        token_or_url
            .rsplit_once("/_temp/")
            .map(|(_, token)| token)
            .unwrap_or(token_or_url)
    }
}
