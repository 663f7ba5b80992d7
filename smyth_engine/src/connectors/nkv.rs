//! In-memory namespaced key/value connector.
//!
//! Stores live in a concurrent map; each store carries the ACL written by
//! its creator. The vector connectors use this as the sidecar for
//! datasource descriptors.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

use smyth_core::nkv::NkvConnector;
use smyth_core::{AccessCandidate, AccessRequest, Acl, Connector, Result, Subsystem};

#[derive(Debug, Clone)]
struct NkvStore {
    acl: Acl,
    items: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryNkv {
    stores: DashMap<String, NkvStore>,
}

impl MemoryNkv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for MemoryNkv {
    fn name(&self) -> &str {
        "RAM"
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Nkv
    }
}

#[async_trait]
impl NkvConnector for MemoryNkv {
    async fn resource_acl(&self, store: &str, candidate: &AccessCandidate) -> Result<Acl> {
        match self.stores.get(store) {
            Some(entry) => Ok(entry.acl.clone()),
            None => Ok(Acl::for_candidate(candidate)),
        }
    }

    async fn set(&self, req: &AccessRequest, store: &str, key: &str, value: String) -> Result<()> {
        let mut entry = self.stores.entry(store.to_string()).or_insert_with(|| NkvStore {
            acl: Acl::for_candidate(req.candidate()),
            items: BTreeMap::new(),
        });
        entry.items.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, _req: &AccessRequest, store: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .stores
            .get(store)
            .and_then(|entry| entry.items.get(key).cloned()))
    }

    async fn delete(&self, _req: &AccessRequest, store: &str, key: &str) -> Result<()> {
        if let Some(mut entry) = self.stores.get_mut(store) {
            entry.items.remove(key);
        }
        Ok(())
    }

    async fn list(&self, _req: &AccessRequest, store: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .stores
            .get(store)
            .map(|entry| {
                entry
                    .items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_store(&self, _req: &AccessRequest, store: &str) -> Result<()> {
        self.stores.remove(store);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smyth_core::AccessLevel;

    #[tokio::test(flavor = "current_thread")]
    async fn test_set_get_list() {
        let nkv = MemoryNkv::new();
        let req = AccessCandidate::user("alice").write_request();
        nkv.set(&req, "store", "b", "2".into()).await.unwrap();
        nkv.set(&req, "store", "a", "1".into()).await.unwrap();

        let read = req.at(AccessLevel::Read);
        assert_eq!(nkv.get(&read, "store", "a").await.unwrap(), Some("1".into()));
        assert_eq!(nkv.get(&read, "store", "zz").await.unwrap(), None);
        // Listing is key-ordered.
        assert_eq!(
            nkv.list(&read, "store").await.unwrap(),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
        assert!(nkv.list(&read, "missing").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_store_acl_claimed_by_creator() {
        let nkv = MemoryNkv::new();
        let alice = AccessCandidate::user("alice");
        let bob = AccessCandidate::user("bob");
        nkv.set(&alice.write_request(), "store", "k", "v".into())
            .await
            .unwrap();

        let acl = nkv.resource_acl("store", &bob).await.unwrap();
        assert!(!acl.check(&bob.read_request()));
        assert!(acl.check(&alice.read_request()));

        // A store that does not exist yet is claimable by anyone.
        let acl = nkv.resource_acl("fresh", &bob).await.unwrap();
        assert!(acl.check(&bob.owner_request()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_delete_store() {
        let nkv = MemoryNkv::new();
        let req = AccessCandidate::user("alice").owner_request();
        nkv.set(&req, "store", "k", "v".into()).await.unwrap();
        nkv.delete_store(&req, "store").await.unwrap();
        assert!(nkv.list(&req, "store").await.unwrap().is_empty());
    }
}
