//! In-memory cache connector.
//!
//! LRU cache with per-entry TTL/TTI expiry on top of `moka`. Entries are
//! namespaced per candidate inside the shared cache instance, so each
//! candidate only ever sees its own keys. Data is lost on restart; callers
//! treat every read as a potential cold miss.

use async_trait::async_trait;
use moka::{future::Cache, policy::Expiry};
use std::sync::Arc;
use std::time::{Duration, Instant};

use smyth_core::cache::{CacheConnector, CacheExpiry};
use smyth_core::{AccessCandidate, AccessRequest, Acl, Connector, Result, Subsystem};

const CACHE_MAX_CAPACITY: u64 = 1_000_000;
// Idle entries are dropped after a week even without an explicit policy.
const CACHE_MAX_TTI: Duration = Duration::from_secs(3600 * 24 * 7);

type Entry = Arc<(String, Option<CacheExpiry>)>;

pub struct MemoryCache {
    cache: Cache<String, Entry>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(CACHE_MAX_CAPACITY)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_idle(CACHE_MAX_TTI)
                .expire_after(EntryExpiry)
                .build(),
        }
    }

    fn scoped_key(req: &AccessRequest, key: &str) -> String {
        format!("{}/{}", req.candidate().cache_key(), key)
    }
}

impl Connector for MemoryCache {
    fn name(&self) -> &str {
        "RAM"
    }

    fn subsystem(&self) -> Subsystem {
        Subsystem::Cache
    }
}

#[async_trait]
impl CacheConnector for MemoryCache {
    async fn resource_acl(&self, _key: &str, candidate: &AccessCandidate) -> Result<Acl> {
        // Keys are candidate-scoped; every candidate owns its own keyspace.
        Ok(Acl::for_candidate(candidate))
    }

    async fn get(&self, req: &AccessRequest, key: &str) -> Result<Option<String>> {
        let entry = self.cache.get(&Self::scoped_key(req, key)).await;
        Ok(entry.map(|e| e.0.clone()))
    }

    async fn set(
        &self,
        req: &AccessRequest,
        key: &str,
        value: String,
        expiry: Option<CacheExpiry>,
    ) -> Result<()> {
        self.cache
            .insert(Self::scoped_key(req, key), Arc::new((value, expiry)))
            .await;
        Ok(())
    }

    async fn set_if_not_exists(
        &self,
        req: &AccessRequest,
        key: &str,
        value: String,
        expiry: Option<CacheExpiry>,
    ) -> Result<bool> {
        let entry = self
            .cache
            .entry(Self::scoped_key(req, key))
            .or_insert_with(async { Arc::new((value, expiry)) })
            .await;
        Ok(entry.is_fresh())
    }

    async fn delete(&self, req: &AccessRequest, key: &str) -> Result<bool> {
        Ok(self
            .cache
            .remove(&Self::scoped_key(req, key))
            .await
            .is_some())
    }

    async fn delete_prefix(&self, req: &AccessRequest, prefix: &str) -> Result<()> {
        let scoped = Self::scoped_key(req, prefix);
        let keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(k, _)| k.starts_with(&scoped))
            .map(|(k, _)| k.as_ref().clone())
            .collect();
        for key in keys {
            self.cache.remove(&key).await;
        }
        Ok(())
    }
}

struct EntryExpiry;

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        match value.1 {
            Some(CacheExpiry::TTL(du)) => Some(du),
            Some(CacheExpiry::TTI(du)) => Some(du),
            None => None,
        }
    }

    fn expire_after_read(
        &self,
        _key: &String,
        value: &Entry,
        _read_at: Instant,
        duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        match value.1 {
            Some(CacheExpiry::TTL(_)) => duration_until_expiry,
            Some(CacheExpiry::TTI(du)) => Some(du),
            None => None,
        }
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        match value.1 {
            Some(CacheExpiry::TTL(du)) => Some(du),
            Some(CacheExpiry::TTI(du)) => Some(du),
            None => None,
        }
    }
}
