//! Local storage connector.
//!
//! Byte store over an [`ObjectStore`] backend (in-memory or local
//! filesystem). The object ACL and metadata live in sidecar records keyed
//! off the primary path (`<path>#acl`, `<path>#meta`), so the semantics
//! are identical regardless of which backend is plugged in.
//!
//! Expiry is honored lazily: an object whose `expires_at` has passed is
//! treated as missing and its records are deleted off the request path.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use object_store::{
    ObjectStore, PutMode, PutOptions, local::LocalFileSystem, memory::InMemory,
};
use std::sync::Arc;
use std::time::Duration;
use structured_logger::unix_ms;

use smyth_core::storage::{
    ACL_SIDECAR_SUFFIX, METADATA_SIDECAR_SUFFIX, StorageConnector, StorageMetadata,
};
use smyth_core::{AccessCandidate, AccessLevel, AccessRequest, Acl, Connector, Error, Result, Subsystem};

const CONNECTOR_NAME: &str = "LocalStorage";

#[derive(Clone)]
pub struct LocalStorage {
    store: Arc<dyn ObjectStore>,
}

impl LocalStorage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Volatile store, for tests and ephemeral runtimes.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// Store rooted at a local directory.
    pub fn local(root: &std::path::Path) -> Result<Self> {
        let fs = LocalFileSystem::new_with_prefix(root)
            .map_err(|err| Error::backend(CONNECTOR_NAME, err))?;
        Ok(Self::new(Arc::new(fs)))
    }

    fn object_path(path: &str) -> Path {
        Path::from(path)
    }

    fn acl_path(path: &str) -> Path {
        Path::from(format!("{path}{ACL_SIDECAR_SUFFIX}"))
    }

    fn meta_path(path: &str) -> Path {
        Path::from(format!("{path}{METADATA_SIDECAR_SUFFIX}"))
    }

    async fn put_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value)
            .map_err(|err| Error::backend(CONNECTOR_NAME, err))?;
        self.store
            .put(path, Bytes::from(data).into())
            .await
            .map_err(|err| Error::backend(CONNECTOR_NAME, err))?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match self.store.get(path).await {
            Ok(res) => {
                let data = res
                    .bytes()
                    .await
                    .map_err(|err| Error::backend(CONNECTOR_NAME, err))?;
                let value = serde_json::from_slice(&data)
                    .map_err(|err| Error::backend(CONNECTOR_NAME, err))?;
                Ok(Some(value))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(Error::backend(CONNECTOR_NAME, err)),
        }
    }

    async fn load_metadata(&self, path: &str) -> Result<Option<StorageMetadata>> {
        self.get_json(&Self::meta_path(path)).await
    }

    async fn load_acl(&self, path: &str) -> Result<Option<Acl>> {
        self.get_json(&Self::acl_path(path)).await
    }

    /// True when the object carries an `expires_at` in the past. The
    /// records are swept in the background, never on the caller's path.
    async fn is_expired(&self, path: &str) -> Result<bool> {
        let expired = self
            .load_metadata(path)
            .await?
            .and_then(|meta| meta.expires_at)
            .is_some_and(|at| at <= unix_ms() as i64);
        if expired {
            let store = self.clone();
            let path = path.to_string();
            tokio::spawn(async move {
                if let Err(err) = store.remove_records(&path).await {
                    log::warn!(target: "storage", path = path.as_str(), error = err.to_string(); "expired object sweep failed");
                }
            });
        }
        Ok(expired)
    }

    async fn remove_records(&self, path: &str) -> Result<()> {
        for p in [
            Self::object_path(path),
            Self::acl_path(path),
            Self::meta_path(path),
        ] {
            match self.store.delete(&p).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(err) => return Err(Error::backend(CONNECTOR_NAME, err)),
            }
        }
        Ok(())
    }
}

impl Connector for LocalStorage {
    fn name(&self) -> &str {
        CONNECTOR_NAME
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Storage
    }
}

#[async_trait]
impl StorageConnector for LocalStorage {
    async fn resource_acl(&self, path: &str, candidate: &AccessCandidate) -> Result<Acl> {
        match self.load_acl(path).await? {
            Some(acl) => Ok(acl),
            None => Ok(Acl::for_candidate(candidate)),
        }
    }

    async fn read(&self, _req: &AccessRequest, path: &str) -> Result<Bytes> {
        if self.is_expired(path).await? {
            return Err(Error::StorageObjectMissing(path.to_string()));
        }
        match self.store.get(&Self::object_path(path)).await {
            Ok(res) => res
                .bytes()
                .await
                .map_err(|err| Error::backend(CONNECTOR_NAME, err)),
            Err(object_store::Error::NotFound { .. }) => {
                Err(Error::StorageObjectMissing(path.to_string()))
            }
            Err(err) => Err(Error::backend(CONNECTOR_NAME, err)),
        }
    }

    async fn write(
        &self,
        req: &AccessRequest,
        path: &str,
        data: Bytes,
        acl: Option<Acl>,
        metadata: Option<StorageMetadata>,
    ) -> Result<()> {
        let existing = self.load_acl(path).await?;
        let (mode, effective_acl) = match (existing, acl) {
            (Some(current), Some(replacement)) => {
                // Replacing the ACL of a live object is an Owner operation.
                if !current.check(&req.at(AccessLevel::Owner)) {
                    return Err(Error::Conflict(format!(
                        "object {path} is ACL-locked; replacing its ACL requires Owner"
                    )));
                }
                (PutMode::Overwrite, replacement)
            }
            (Some(current), None) => (PutMode::Overwrite, current),
            // First write claims the object. Create makes the claim atomic:
            // of two candidates racing for the same path, exactly one wins
            // and writes the ACL sidecar.
            (None, replacement) => (
                PutMode::Create,
                replacement.unwrap_or_else(|| Acl::for_candidate(req.candidate())),
            ),
        };

        match self
            .store
            .put_opts(
                &Self::object_path(path),
                data.into(),
                PutOptions {
                    mode,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => {}
            Err(object_store::Error::AlreadyExists { .. }) => {
                return Err(Error::Conflict(format!(
                    "object {path} was created concurrently"
                )));
            }
            Err(err) => return Err(Error::backend(CONNECTOR_NAME, err)),
        }
        self.put_json(&Self::acl_path(path), &effective_acl).await?;
        if let Some(meta) = metadata {
            self.put_json(&Self::meta_path(path), &meta).await?;
        }
        Ok(())
    }

    async fn delete(&self, _req: &AccessRequest, path: &str) -> Result<()> {
        self.remove_records(path).await
    }

    async fn exists(&self, _req: &AccessRequest, path: &str) -> Result<bool> {
        if self.is_expired(path).await? {
            return Ok(false);
        }
        match self.store.head(&Self::object_path(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(Error::backend(CONNECTOR_NAME, err)),
        }
    }

    async fn get_metadata(&self, req: &AccessRequest, path: &str) -> Result<StorageMetadata> {
        if !self.exists(req, path).await? {
            return Err(Error::StorageObjectMissing(path.to_string()));
        }
        Ok(self.load_metadata(path).await?.unwrap_or_default())
    }

    async fn set_metadata(
        &self,
        req: &AccessRequest,
        path: &str,
        metadata: StorageMetadata,
    ) -> Result<()> {
        if !self.exists(req, path).await? {
            return Err(Error::StorageObjectMissing(path.to_string()));
        }
        self.put_json(&Self::meta_path(path), &metadata).await
    }

    async fn get_acl(&self, _req: &AccessRequest, path: &str) -> Result<Option<Acl>> {
        self.load_acl(path).await
    }

    async fn set_acl(&self, _req: &AccessRequest, path: &str, acl: Acl) -> Result<()> {
        self.put_json(&Self::acl_path(path), &acl).await
    }

    async fn expire(&self, req: &AccessRequest, path: &str, ttl: Duration) -> Result<()> {
        if ttl < Duration::from_secs(1) {
            return Err(Error::invalid("expire ttl must be at least 1s"));
        }
        let mut meta = self.get_metadata(req, path).await?;
        meta.expires_at = Some(unix_ms() as i64 + ttl.as_millis() as i64);
        self.put_json(&Self::meta_path(path), &meta).await?;

        let store = self.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            // Re-check: a later expire() may have extended the deadline.
            let still_expired = store
                .load_metadata(&path)
                .await
                .ok()
                .flatten()
                .and_then(|m| m.expires_at)
                .is_some_and(|at| at <= unix_ms() as i64);
            if still_expired {
                if let Err(err) = store.remove_records(&path).await {
                    log::warn!(target: "storage", path = path.as_str(), error = err.to_string(); "expire sweep failed");
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn test_write_read_round_trip() {
        let storage = LocalStorage::in_memory();
        let agent = AccessCandidate::agent("agent-1");
        let req = agent.write_request();

        storage
            .write(&req, "teams/default/file.txt", Bytes::from_static(b"Hello World!"), None, None)
            .await
            .unwrap();
        let data = storage
            .read(&agent.read_request(), "teams/default/file.txt")
            .await
            .unwrap();
        assert_eq!(&data[..], b"Hello World!");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_first_writer_owns() {
        let storage = LocalStorage::in_memory();
        let agent = AccessCandidate::agent("agent-123456");
        let other = AccessCandidate::agent("agent-000000");

        storage
            .write(&agent.write_request(), "f", Bytes::from_static(b"x"), None, None)
            .await
            .unwrap();
        let acl = storage.resource_acl("f", &other).await.unwrap();
        assert!(acl.check(&agent.read_request()));
        assert!(!acl.check(&other.read_request()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_overwrite_keeps_acl() {
        let storage = LocalStorage::in_memory();
        let agent = AccessCandidate::agent("agent-1");
        let req = agent.write_request();

        storage
            .write(&req, "f", Bytes::from_static(b"v1"), None, None)
            .await
            .unwrap();
        storage
            .write(&req, "f", Bytes::from_static(b"v2"), None, None)
            .await
            .unwrap();
        let data = storage.read(&agent.read_request(), "f").await.unwrap();
        assert_eq!(&data[..], b"v2");
        let acl = storage.get_acl(&req, "f").await.unwrap().unwrap();
        assert!(acl.check(&agent.owner_request()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_first_write_claim_is_atomic() {
        let storage = LocalStorage::in_memory();
        let req = AccessCandidate::agent("late").write_request();

        // Another writer landed the object between our ACL probe and the
        // put: the Create claim loses and surfaces as Conflict.
        storage
            .store
            .put(&LocalStorage::object_path("f"), Bytes::from_static(b"first").into())
            .await
            .unwrap();
        assert!(matches!(
            storage
                .write(&req, "f", Bytes::from_static(b"second"), None, None)
                .await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_missing_object() {
        let storage = LocalStorage::in_memory();
        let req = AccessCandidate::user("u").read_request();
        assert!(matches!(
            storage.read(&req, "nope").await,
            Err(Error::StorageObjectMissing(_))
        ));
        assert!(!storage.exists(&req, "nope").await.unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_metadata_sidecar() {
        let storage = LocalStorage::in_memory();
        let req = AccessCandidate::user("u").write_request();
        storage
            .write(
                &req,
                "img",
                Bytes::from_static(b"\x89PNG"),
                None,
                Some(StorageMetadata::with_content_type("image/png")),
            )
            .await
            .unwrap();
        let meta = storage.get_metadata(&req, "img").await.unwrap();
        assert_eq!(meta.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_expire() {
        let storage = LocalStorage::in_memory();
        let req = AccessCandidate::user("u").write_request();
        storage
            .write(&req, "tmp", Bytes::from_static(b"x"), None, None)
            .await
            .unwrap();
        storage
            .expire(&req, "tmp", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(storage.exists(&req, "tmp").await.unwrap());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!storage.exists(&req, "tmp").await.unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_expire_rejects_sub_second_ttl() {
        let storage = LocalStorage::in_memory();
        let req = AccessCandidate::user("u").write_request();
        storage
            .write(&req, "tmp", Bytes::from_static(b"x"), None, None)
            .await
            .unwrap();
        assert!(
            storage
                .expire(&req, "tmp", Duration::from_millis(10))
                .await
                .is_err()
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_delete_is_idempotent() {
        let storage = LocalStorage::in_memory();
        let req = AccessCandidate::user("u").write_request();
        storage
            .write(&req, "f", Bytes::from_static(b"x"), None, None)
            .await
            .unwrap();
        storage.delete(&req, "f").await.unwrap();
        storage.delete(&req, "f").await.unwrap();
        assert!(!storage.exists(&req, "f").await.unwrap());
        // The ACL sidecar is gone with the object.
        assert!(storage.get_acl(&req, "f").await.unwrap().is_none());
    }
}
