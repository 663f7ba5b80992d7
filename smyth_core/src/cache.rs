//! Cache connector contract.
//!
//! Short-lived, best-effort storage: ACL decisions, resolved temp-URL
//! tokens. Callers must tolerate cold misses; nothing correctness-critical
//! may live only in the cache.

use async_trait::async_trait;
use std::time::Duration;

use crate::access::{AccessCandidate, AccessRequest};
use crate::acl::Acl;
use crate::connector::Connector;
use crate::error::Result;

/// Cache expiration policy for cached items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheExpiry {
    /// Time-to-Live: expires after duration from when it was set.
    TTL(Duration),
    /// Time-to-Idle: expires after duration from last access.
    TTI(Duration),
}

/// Best-effort key/value cache with per-entry expiry. Values are opaque
/// strings; callers bring their own encoding.
#[async_trait]
pub trait CacheConnector: Connector {
    async fn resource_acl(&self, key: &str, candidate: &AccessCandidate) -> Result<Acl>;

    async fn get(&self, req: &AccessRequest, key: &str) -> Result<Option<String>>;

    async fn set(
        &self,
        req: &AccessRequest,
        key: &str,
        value: String,
        expiry: Option<CacheExpiry>,
    ) -> Result<()>;

    /// Returns true iff the value was stored (the key was absent).
    async fn set_if_not_exists(
        &self,
        req: &AccessRequest,
        key: &str,
        value: String,
        expiry: Option<CacheExpiry>,
    ) -> Result<bool>;

    /// Returns true iff the key existed.
    async fn delete(&self, req: &AccessRequest, key: &str) -> Result<bool>;

    /// Drops every key of the candidate starting with `prefix`; used to
    /// invalidate ACL entries when a resource's grants change.
    async fn delete_prefix(&self, req: &AccessRequest, prefix: &str) -> Result<()>;
}
