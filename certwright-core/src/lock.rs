//! Distributed lock service (spec.md §4.3) plus the fail-safe blocker used by
//! the coordinator's backoff policy (spec.md §3/§4.6).

use crate::error::Result;
use crate::kv::KvClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// A held lease. Dropping this without calling `release` is safe — the lease
/// still expires after `lease_ms` — but callers should release explicitly on
/// every exit path (the scoped-cleanup discipline spec.md §9 calls for).
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    pub fencing_token: String,
}

/// Outcome of an `acquire` call.
pub struct AcquireResult {
    pub ok: bool,
    pub handle: Option<LockHandle>,
}

pub struct LockService {
    kv: Arc<dyn KvClient>,
}

const POLL_INTERVAL_MS: u64 = 100;

impl LockService {
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    /// Blocks up to `wait_budget_ms` attempting to acquire mutual exclusion
    /// on `key`; on success, the holder is guaranteed exclusivity for
    /// `lease_ms` (enforced by the underlying store's TTL, identified by a
    /// fencing token so a stale holder's release can never affect a newer
    /// lease).
    pub async fn acquire(&self, key: &str, lease_ms: i64, wait_budget_ms: i64) -> Result<AcquireResult> {
        let fencing_token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(wait_budget_ms.max(0) as u64);

        loop {
            if self.kv.set_nx_px(key, fencing_token.as_bytes(), lease_ms).await? {
                return Ok(AcquireResult {
                    ok: true,
                    handle: Some(LockHandle {
                        key: key.to_string(),
                        fencing_token,
                    }),
                });
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(AcquireResult { ok: false, handle: None });
            }

            sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
    }

    /// Idempotent; never releases a lease held by a different holder (the
    /// compare-and-delete is keyed on the fencing token).
    pub async fn release(&self, handle: &LockHandle) -> Result<()> {
        self.kv
            .compare_del(&handle.key, handle.fencing_token.as_bytes())
            .await?;
        Ok(())
    }

    /// Sets the fail-safe blocker `lock:safe:<D>` for `ttl_ms`, suppressing
    /// renewal attempts after a recent issuance error.
    pub async fn set_fail_safe(&self, key: &str, ttl_ms: i64) -> Result<()> {
        let _ = self.kv.set_nx_px(key, b"1", ttl_ms).await?;
        Ok(())
    }

    pub async fn is_fail_safe_set(&self, key: &str) -> Result<bool> {
        self.kv.exists(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvClient;

    #[tokio::test]
    async fn only_one_holder_at_a_time() {
        let lock = LockService::new(Arc::new(InMemoryKvClient::new()));
        let first = lock.acquire("lock:op:example.com", 10_000, 0).await.unwrap();
        assert!(first.ok);

        let second = lock.acquire("lock:op:example.com", 10_000, 0).await.unwrap();
        assert!(!second.ok);
    }

    #[tokio::test]
    async fn release_frees_the_key_for_a_new_holder() {
        let lock = LockService::new(Arc::new(InMemoryKvClient::new()));
        let first = lock.acquire("lock:op:example.com", 10_000, 0).await.unwrap();
        lock.release(first.handle.as_ref().unwrap()).await.unwrap();

        let second = lock.acquire("lock:op:example.com", 10_000, 0).await.unwrap();
        assert!(second.ok);
    }

    #[tokio::test]
    async fn release_with_wrong_token_does_not_release_another_holders_lease() {
        let lock = LockService::new(Arc::new(InMemoryKvClient::new()));
        let first = lock.acquire("lock:op:example.com", 10_000, 0).await.unwrap();

        let bogus = LockHandle {
            key: "lock:op:example.com".to_string(),
            fencing_token: "not-the-real-token".to_string(),
        };
        lock.release(&bogus).await.unwrap();

        // Original holder's lease must still stand.
        let second = lock.acquire("lock:op:example.com", 10_000, 0).await.unwrap();
        assert!(!second.ok);
        assert!(first.ok);
    }

    #[tokio::test]
    async fn fail_safe_lock_is_observable_until_ttl_expires() {
        let lock = LockService::new(Arc::new(InMemoryKvClient::new()));
        lock.set_fail_safe("lock:safe:example.com", 20).await.unwrap();
        assert!(lock.is_fail_safe_set("lock:safe:example.com").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!lock.is_fail_safe_set("lock:safe:example.com").await.unwrap());
    }

    #[tokio::test]
    async fn acquire_respects_wait_budget() {
        let lock = LockService::new(Arc::new(InMemoryKvClient::new()));
        let first = lock.acquire("lock:op:example.com", 10_000, 0).await.unwrap();
        assert!(first.ok);

        let started = tokio::time::Instant::now();
        let second = lock.acquire("lock:op:example.com", 10_000, 150).await.unwrap();
        assert!(!second.ok);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
