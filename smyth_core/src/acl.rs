//! Per-resource grant tables.
//!
//! An [`Acl`] maps `role -> hashed id -> set of levels`. Candidate ids are
//! stored hashed (xxh3, recorded in the serialized form) so a persisted ACL
//! never reveals the original ids. Granting Owner always grants Read and
//! Write as well; an empty ACL denies everything.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::access::{AccessCandidate, AccessLevel, AccessRequest, AccessRole};
use crate::error::{Error, Result};

/// Hash algorithm tag recorded in serialized ACLs.
pub const ACL_HASH_ALGORITHM: &str = "xxh3";

/// Wildcard entry matching any id of a role. Stored verbatim, never hashed.
pub const ACL_WILDCARD: &str = "*";

fn hash_id(id: &str) -> String {
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(id.as_bytes()))
}

/// Per-resource grant table. BTree collections keep the serialized form
/// deterministic, so a deserialize/serialize cycle is byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    hash: String,
    entries: BTreeMap<AccessRole, BTreeMap<String, BTreeSet<AccessLevel>>>,
}

impl Default for Acl {
    fn default() -> Self {
        Self {
            hash: ACL_HASH_ALGORITHM.to_string(),
            entries: BTreeMap::new(),
        }
    }
}

impl Acl {
    pub fn new() -> Self {
        Self::default()
    }

    /// The ACL every connector answers for a not-yet-existing resource:
    /// full ownership for the asking candidate, so creation is permitted.
    pub fn for_candidate(candidate: &AccessCandidate) -> Self {
        let mut acl = Self::new();
        acl.grant(candidate.role(), candidate.id(), AccessLevel::Owner);
        acl
    }

    /// Adds a grant. Owner implies Read and Write; the implied levels are
    /// materialized so checks are a plain set lookup.
    pub fn grant(&mut self, role: AccessRole, id: &str, level: AccessLevel) -> &mut Self {
        let key = if id == ACL_WILDCARD {
            ACL_WILDCARD.to_string()
        } else {
            hash_id(id)
        };
        let levels = self
            .entries
            .entry(role)
            .or_default()
            .entry(key)
            .or_default();
        levels.insert(level);
        if level == AccessLevel::Owner {
            levels.insert(AccessLevel::Read);
            levels.insert(AccessLevel::Write);
        }
        self
    }

    /// Builder-style [`Acl::grant`].
    pub fn with_grant(mut self, role: AccessRole, id: &str, level: AccessLevel) -> Self {
        self.grant(role, id, level);
        self
    }

    pub fn grant_candidate(&mut self, candidate: &AccessCandidate, level: AccessLevel) -> &mut Self {
        self.grant(candidate.role(), candidate.id(), level)
    }

    /// Grants a level to every id of the given role.
    pub fn grant_wildcard(&mut self, role: AccessRole, level: AccessLevel) -> &mut Self {
        self.grant(role, ACL_WILDCARD, level)
    }

    /// Removes every grant held by `(role, id)`.
    pub fn revoke(&mut self, role: AccessRole, id: &str) -> &mut Self {
        if let Some(ids) = self.entries.get_mut(&role) {
            let key = if id == ACL_WILDCARD {
                ACL_WILDCARD.to_string()
            } else {
                hash_id(id)
            };
            ids.remove(&key);
            if ids.is_empty() {
                self.entries.remove(&role);
            }
        }
        self
    }

    /// True iff the request's candidate holds at least the requested level,
    /// via an exact entry or a role wildcard. An ACL that arrived from a
    /// foreign writer may carry a bare Owner entry, so Owner is always
    /// accepted as implying the lower levels.
    pub fn check(&self, request: &AccessRequest) -> bool {
        let Some(ids) = self.entries.get(&request.candidate().role()) else {
            return false;
        };
        let key = hash_id(request.candidate().id());
        [key.as_str(), ACL_WILDCARD].iter().any(|k| {
            ids.get(*k)
                .map(|levels| {
                    levels.contains(&request.level()) || levels.contains(&AccessLevel::Owner)
                })
                .unwrap_or(false)
        })
    }

    /// Presence of any explicit Owner entry marks the resource as created.
    pub fn has_owner(&self) -> bool {
        self.entries
            .values()
            .any(|ids| ids.values().any(|levels| levels.contains(&AccessLevel::Owner)))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stable serialized form; ids are already hashed, the algorithm tag
    /// travels with the data.
    pub fn serialize(&self) -> serde_json::Value {
        serde_json::json!(self)
    }

    pub fn from_serialized(data: serde_json::Value) -> Result<Self> {
        let acl: Acl = serde_json::from_value(data)
            .map_err(|err| Error::invalid(format!("malformed ACL: {err}")))?;
        if acl.hash != ACL_HASH_ALGORITHM {
            return Err(Error::invalid(format!(
                "unsupported ACL hash algorithm: {}",
                acl.hash
            )));
        }
        Ok(acl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_denies_all() {
        let acl = Acl::new();
        let alice = AccessCandidate::user("alice");
        assert!(!acl.check(&alice.read_request()));
        assert!(!acl.has_owner());
    }

    #[test]
    fn test_owner_implies_read_write() {
        let alice = AccessCandidate::user("alice");
        let acl = Acl::for_candidate(&alice);
        assert!(acl.check(&alice.read_request()));
        assert!(acl.check(&alice.write_request()));
        assert!(acl.check(&alice.owner_request()));
        assert!(acl.has_owner());
    }

    #[test]
    fn test_monotonicity() {
        // A grant at level L satisfies every request at a lower level.
        let bob = AccessCandidate::user("bob");
        let mut acl = Acl::new();
        acl.grant(AccessRole::User, "bob", AccessLevel::Write);
        assert!(acl.check(&bob.write_request()));
        assert!(acl.check(&bob.read_request()));
        assert!(!acl.check(&bob.owner_request()));
    }

    #[test]
    fn test_ids_are_hashed() {
        let mut acl = Acl::new();
        acl.grant(AccessRole::Team, "team-123456", AccessLevel::Owner);
        let data = serde_json::to_string(&acl.serialize()).unwrap();
        assert!(!data.contains("team-123456"));
        assert!(data.contains("xxh3"));
    }

    #[test]
    fn test_round_trip() {
        let mut acl = Acl::new();
        acl.grant(AccessRole::User, "alice", AccessLevel::Owner);
        acl.grant(AccessRole::Team, "team-1", AccessLevel::Read);
        acl.grant_wildcard(AccessRole::Agent, AccessLevel::Read);

        let data = acl.serialize();
        let restored = Acl::from_serialized(data.clone()).unwrap();
        assert_eq!(restored, acl);
        assert_eq!(restored.serialize(), data);
    }

    #[test]
    fn test_wildcard() {
        let mut acl = Acl::new();
        acl.grant_wildcard(AccessRole::User, AccessLevel::Read);
        assert!(acl.check(&AccessCandidate::user("anyone").read_request()));
        assert!(!acl.check(&AccessCandidate::user("anyone").write_request()));
        assert!(!acl.check(&AccessCandidate::agent("a-1").read_request()));
    }

    #[test]
    fn test_revoke() {
        let alice = AccessCandidate::user("alice");
        let mut acl = Acl::for_candidate(&alice);
        acl.revoke(AccessRole::User, "alice");
        assert!(!acl.check(&alice.read_request()));
        assert!(acl.is_empty());
    }

    #[test]
    fn test_rejects_foreign_hash() {
        let data = serde_json::json!({"hash": "sha256", "entries": {}});
        assert!(Acl::from_serialized(data).is_err());
    }
}
