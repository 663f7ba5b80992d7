//! Secure call pipeline.
//!
//! Every protected connector method is reached through [`authorize`]:
//! derive the resource id, fetch the resource ACL (optionally through the
//! cache connector, TTL-capped at 60 s), check the candidate at the
//! required level, then dispatch. The guard itself never caches decisions,
//! only ACL documents, and never reveals whether a denied resource exists.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use smyth_core::cache::{CacheConnector, CacheExpiry};
use smyth_core::{AccessCandidate, AccessLevel, AccessRequest, Acl, Error, Result};
use tokio_util::sync::CancellationToken;

/// Upper bound for cached ACL entries.
pub const ACL_CACHE_TTL: Duration = Duration::from_secs(60);

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

fn acl_cache_key(resource_id: &str, candidate: &AccessCandidate) -> String {
    format!("acl:{}:{}", resource_id, candidate.cache_key())
}

/// Runs the access check and returns the [`AccessRequest`] to dispatch
/// with. `fetch_acl` is the connector's `resource_acl`; it is consulted on
/// cache miss only.
pub async fn authorize<F, Fut>(
    cache: Option<&Arc<dyn CacheConnector>>,
    candidate: &AccessCandidate,
    level: AccessLevel,
    resource_id: &str,
    fetch_acl: F,
) -> Result<AccessRequest>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Acl>>,
{
    let key = acl_cache_key(resource_id, candidate);
    let mut acl: Option<Acl> = None;

    if let Some(cache) = cache {
        // Cache misses and malformed entries both fall through to the
        // connector; the cache is best-effort.
        if let Ok(Some(raw)) = cache.get(&candidate.read_request(), &key).await {
            acl = serde_json::from_str(&raw).ok();
        }
    }

    let acl = match acl {
        Some(acl) => acl,
        None => {
            let fetched = fetch_acl().await?;
            if let Some(cache) = cache {
                let _ = cache
                    .set(
                        &candidate.write_request(),
                        &key,
                        serde_json::to_string(&fetched).unwrap_or_default(),
                        Some(CacheExpiry::TTL(ACL_CACHE_TTL)),
                    )
                    .await;
            }
            fetched
        }
    };

    let request = candidate.request(level);
    if !acl.check(&request) {
        return Err(Error::AccessDenied);
    }
    Ok(request)
}

/// Drops cached ACL entries for a resource after a grant-changing write.
pub async fn invalidate_acl(
    cache: Option<&Arc<dyn CacheConnector>>,
    candidate: &AccessCandidate,
    resource_id: &str,
) {
    if let Some(cache) = cache {
        let _ = cache
            .delete_prefix(&candidate.write_request(), &format!("acl:{resource_id}:"))
            .await;
    }
}

/// Retries idempotent operations on backend failures with exponential
/// backoff, at most three attempts. Everything else surfaces immediately.
pub async fn retry_idempotent<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(val) => return Ok(val),
            Err(err) if err.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                log::warn!(target: "guard", attempt = attempt + 1, error = err.to_string(); "retrying idempotent operation");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Bounds a connector call by the per-connector timeout and the ambient
/// cancellation token.
pub async fn bounded<T, Fut>(
    connector: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(Error::backend(connector, format!("timed out after {timeout:?}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(flavor = "current_thread")]
    async fn test_authorize_denies_foreign_candidate() {
        let owner = AccessCandidate::agent("agent-123456");
        let intruder = AccessCandidate::agent("agent-000000");
        let acl = Acl::for_candidate(&owner);

        let granted = authorize(None, &owner, AccessLevel::Read, "res", || async {
            Ok(acl.clone())
        })
        .await;
        assert!(granted.is_ok());

        let denied = authorize(None, &intruder, AccessLevel::Read, "res", || async {
            Ok(acl.clone())
        })
        .await;
        assert!(matches!(denied, Err(Error::AccessDenied)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = retry_idempotent(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::backend("test", "boom")) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_retry_does_not_touch_non_backend_errors() {
        let calls = AtomicU32::new(0);
        let res: Result<()> = retry_idempotent(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Cancelled) }
        })
        .await;
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_bounded_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<()> = bounded("test", Duration::from_secs(1), &cancel, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }
}
