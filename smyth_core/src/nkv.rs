//! Namespaced key/value connector contract.
//!
//! NKV is the small durable table other subsystems lean on; the vector
//! connectors keep their datasource descriptors here. Values are opaque
//! strings. The ACL is held per `(store, candidate)`; the resource id of an
//! entry is `<store>:<key>`.

use async_trait::async_trait;

use crate::access::{AccessCandidate, AccessRequest};
use crate::acl::Acl;
use crate::connector::Connector;
use crate::error::Result;

#[async_trait]
pub trait NkvConnector: Connector {
    /// Store-level ACL; a store that does not exist yet answers with
    /// ownership for the candidate.
    async fn resource_acl(&self, store: &str, candidate: &AccessCandidate) -> Result<Acl>;

    async fn set(&self, req: &AccessRequest, store: &str, key: &str, value: String) -> Result<()>;

    async fn get(&self, req: &AccessRequest, store: &str, key: &str) -> Result<Option<String>>;

    async fn delete(&self, req: &AccessRequest, store: &str, key: &str) -> Result<()>;

    /// Lists `(key, value)` pairs in key order; an unknown store lists empty.
    async fn list(&self, req: &AccessRequest, store: &str) -> Result<Vec<(String, String)>>;

    /// Drops the whole store with its ACL record.
    async fn delete_store(&self, req: &AccessRequest, store: &str) -> Result<()>;
}
