//! Storage connector contract.
//!
//! A storage connector is a byte-addressable store. Each object carries an
//! ACL and a metadata record persisted as sidecars keyed deterministically
//! from the primary path (`<path>#acl`, `<path>#meta`), so cross-connector
//! semantics stay uniform regardless of backend.
//!
//! All methods taking an [`AccessRequest`] are protected: they assume the
//! access check already passed. Callers go through the candidate-bound
//! client, which runs the check against [`StorageConnector::resource_acl`]
//! before dispatching.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::access::{AccessCandidate, AccessRequest};
use crate::acl::Acl;
use crate::connector::Connector;
use crate::error::Result;

/// Sidecar key suffix for object ACLs.
pub const ACL_SIDECAR_SUFFIX: &str = "#acl";
/// Sidecar key suffix for object metadata.
pub const METADATA_SIDECAR_SUFFIX: &str = "#meta";

/// Object metadata stored next to the bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// MIME type recorded at write time; served back verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Unix milliseconds after which the object is treated as missing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,

    /// Caller-supplied metadata, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl StorageMetadata {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Default::default()
        }
    }
}

/// Byte store with ACL and metadata sidecars.
#[async_trait]
pub trait StorageConnector: Connector {
    /// Effective ACL for a path. For a not-yet-existing object this MUST
    /// return an ACL granting Owner to the candidate so creation succeeds.
    async fn resource_acl(&self, path: &str, candidate: &AccessCandidate) -> Result<Acl>;

    async fn read(&self, req: &AccessRequest, path: &str) -> Result<Bytes>;

    /// Writes the object; an omitted ACL defaults to sole ownership for the
    /// writing candidate on first write, and keeps the existing ACL on
    /// overwrite.
    async fn write(
        &self,
        req: &AccessRequest,
        path: &str,
        data: Bytes,
        acl: Option<Acl>,
        metadata: Option<StorageMetadata>,
    ) -> Result<()>;

    async fn delete(&self, req: &AccessRequest, path: &str) -> Result<()>;

    async fn exists(&self, req: &AccessRequest, path: &str) -> Result<bool>;

    async fn get_metadata(&self, req: &AccessRequest, path: &str) -> Result<StorageMetadata>;

    async fn set_metadata(
        &self,
        req: &AccessRequest,
        path: &str,
        metadata: StorageMetadata,
    ) -> Result<()>;

    async fn get_acl(&self, req: &AccessRequest, path: &str) -> Result<Option<Acl>>;

    async fn set_acl(&self, req: &AccessRequest, path: &str, acl: Acl) -> Result<()>;

    /// Marks the object to expire after `ttl`. Backends that cannot honor
    /// expiry return [`crate::error::Error::Unsupported`] rather than
    /// silently succeeding.
    async fn expire(&self, req: &AccessRequest, path: &str, ttl: Duration) -> Result<()>;
}
