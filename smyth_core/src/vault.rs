//! Vault connector contract.
//!
//! A per-team secret store. Key ids resolve as `<team_id>.<key_name>`; a
//! configured `shared` team may act as a read-only fallback for all teams.
//! String values may embed `$env(VAR)` placeholders, resolved once at read
//! time; unresolved references are left intact and logged by the connector.

use async_trait::async_trait;

use crate::access::{AccessCandidate, AccessRequest};
use crate::acl::Acl;
use crate::connector::Connector;
use crate::error::Result;

/// Team name whose keys are readable by every team when present.
pub const SHARED_VAULT_TEAM: &str = "shared";

#[async_trait]
pub trait VaultConnector: Connector {
    /// Key-level ACL: team Owner, plus wildcard Read when the key lives in
    /// the `shared` team.
    async fn resource_acl(&self, key_id: &str, candidate: &AccessCandidate) -> Result<Acl>;

    /// Resolved secret value, or None when the key is absent.
    async fn get(&self, req: &AccessRequest, team_id: &str, key: &str) -> Result<Option<String>>;

    async fn exists(&self, req: &AccessRequest, team_id: &str, key: &str) -> Result<bool>;

    /// Ordered set of key names visible to the team.
    async fn list_keys(&self, req: &AccessRequest, team_id: &str) -> Result<Vec<String>>;

    /// Effective ACL of a key. For file-backed vaults the ACL is derived
    /// from the team layout, so this is the same document
    /// [`VaultConnector::resource_acl`] answers.
    async fn get_acl(&self, req: &AccessRequest, key_id: &str) -> Result<Acl> {
        self.resource_acl(key_id, req.candidate()).await
    }

    /// Vault grants are structural (team Owner, shared-team Read);
    /// backends without their own grant storage reject mutation.
    async fn set_acl(&self, _req: &AccessRequest, key_id: &str, _acl: Acl) -> Result<()> {
        Err(crate::error::Error::Unsupported(format!(
            "vault ACLs are derived from the team layout; cannot set ACL for {key_id}"
        )))
    }
}
