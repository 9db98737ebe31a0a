use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::StoreError;
use crate::storage::Storage;
use crate::types::{now_secs, LockStatus, TenantId};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_warn(message: &'static str) {
    tracing::warn!(message);
}

#[cfg(not(feature = "tracing"))]
fn trace_warn(_message: &'static str) {}

/// Tuning for the per-notification lock protocol.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// A `processing` lock older than this is considered dead.
    pub stale_after_secs: u64,
    /// Takeover verification tolerance between the written and re-read
    /// `received_at` values.
    pub verify_tolerance_secs: u64,
    /// Release persistence retries before giving up.
    pub release_retries: u32,
    pub release_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            verify_tolerance_secs: 2,
            release_retries: 3,
            release_backoff_ms: 50,
        }
    }
}

/// Result of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    pub acquired: bool,
    /// Whether a lock row for this notification already existed.
    pub existing: bool,
}

/// Per-notification distributed mutex over (tenant, notification id, topic).
///
/// Backed by a unique-constrained row in the shared store, so concurrent
/// processing instances deduplicate notifications without coordinating
/// directly. A dead `processing` row may be taken over exactly once through
/// a verified conditional update.
pub struct IdempotencyGate {
    storage: Arc<dyn Storage>,
    config: LockConfig,
}

impl IdempotencyGate {
    pub fn new(storage: Arc<dyn Storage>, config: LockConfig) -> Self {
        Self { storage, config }
    }

    /// Attempt to acquire the processing lock for a notification.
    ///
    /// A missing notification id always acquires: without an id there is
    /// nothing to deduplicate on, and dropping the notification would lose
    /// an order.
    pub async fn acquire(
        &self,
        tenant: &TenantId,
        notification_id: Option<&str>,
        topic: &str,
    ) -> Result<Acquire, StoreError> {
        let Some(notification_id) = notification_id else {
            trace_warn("notification id header missing, skipping deduplication");
            metric_inc("conversion.lock.no_id");
            return Ok(Acquire { acquired: true, existing: false });
        };

        let now = now_secs();
        if self
            .storage
            .try_insert_lock(tenant, notification_id, topic, now)
            .await?
        {
            metric_inc("conversion.lock.acquired");
            return Ok(Acquire { acquired: true, existing: false });
        }

        let Some(existing) = self.storage.get_lock(tenant, notification_id, topic).await? else {
            // Row vanished between insert and read; one more insert attempt,
            // then yield to whoever owns it now.
            let acquired = self
                .storage
                .try_insert_lock(tenant, notification_id, topic, now)
                .await?;
            return Ok(Acquire { acquired, existing: !acquired });
        };

        let stale_before = now.saturating_sub(self.config.stale_after_secs);
        if existing.status == LockStatus::Processing && existing.received_at < stale_before {
            if self
                .storage
                .takeover_stale_lock(tenant, notification_id, topic, stale_before, now)
                .await?
            {
                // Re-read and verify our write survived; a competing
                // instance may have performed its own takeover in between.
                let reread = self.storage.get_lock(tenant, notification_id, topic).await?;
                let verified = reread.map_or(false, |lock| {
                    lock.status == LockStatus::Processing
                        && lock.received_at.abs_diff(now) <= self.config.verify_tolerance_secs
                });
                if verified {
                    metric_inc("conversion.lock.takeover");
                    return Ok(Acquire { acquired: true, existing: true });
                }
            }
        }

        metric_inc("conversion.lock.duplicate");
        Ok(Acquire { acquired: false, existing: true })
    }

    /// Mark the lock processed or failed.
    ///
    /// Persistence failures are retried a bounded number of times and then
    /// dropped: the caller's business result must not be lost because a
    /// status write failed.
    pub async fn release(
        &self,
        tenant: &TenantId,
        notification_id: Option<&str>,
        topic: &str,
        success: bool,
    ) {
        let Some(notification_id) = notification_id else { return };
        let status = if success { LockStatus::Processed } else { LockStatus::Failed };

        let mut delay = Duration::from_millis(self.config.release_backoff_ms);
        for attempt in 0..=self.config.release_retries {
            match self
                .storage
                .set_lock_status(tenant, notification_id, topic, status, now_secs())
                .await
            {
                Ok(()) => return,
                Err(_) if attempt < self.config.release_retries => {
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(_) => {
                    trace_warn("lock release failed after retries, giving up");
                    metric_inc("conversion.lock.release_failed");
                    return;
                }
            }
        }
    }

    /// Run `handler` only if the lock is acquired.
    ///
    /// Returns `Ok(None)` for duplicates. On handler error the lock is
    /// marked failed before the error propagates.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        tenant: &TenantId,
        notification_id: Option<&str>,
        topic: &str,
        handler: F,
    ) -> Result<Option<T>, E>
    where
        E: From<StoreError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let acquire = self.acquire(tenant, notification_id, topic).await.map_err(E::from)?;
        if !acquire.acquired {
            return Ok(None);
        }

        match handler().await {
            Ok(value) => {
                self.release(tenant, notification_id, topic, true).await;
                Ok(Some(value))
            }
            Err(err) => {
                self.release(tenant, notification_id, topic, false).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::WebhookLock;

    fn tenant() -> TenantId {
        TenantId("shop-1".to_string())
    }

    fn gate(storage: Arc<InMemoryStorage>) -> IdempotencyGate {
        IdempotencyGate::new(storage, LockConfig::default())
    }

    #[tokio::test]
    async fn first_acquire_wins_second_is_duplicate() {
        let storage = Arc::new(InMemoryStorage::new());
        let gate = gate(storage);

        let first = gate.acquire(&tenant(), Some("n-1"), "orders/paid").await.unwrap();
        assert!(first.acquired);
        assert!(!first.existing);

        let second = gate.acquire(&tenant(), Some("n-1"), "orders/paid").await.unwrap();
        assert!(!second.acquired);
        assert!(second.existing);
    }

    #[tokio::test]
    async fn missing_notification_id_always_acquires() {
        let storage = Arc::new(InMemoryStorage::new());
        let gate = gate(storage);

        let first = gate.acquire(&tenant(), None, "orders/paid").await.unwrap();
        let second = gate.acquire(&tenant(), None, "orders/paid").await.unwrap();
        assert!(first.acquired);
        assert!(second.acquired);
    }

    #[tokio::test]
    async fn stale_processing_lock_is_taken_over() {
        let storage = Arc::new(InMemoryStorage::new());
        let stale_received = now_secs() - 600;
        storage
            .insert_lock_row(WebhookLock {
                tenant: tenant(),
                notification_id: "n-1".to_string(),
                topic: "orders/paid".to_string(),
                status: LockStatus::Processing,
                received_at: stale_received,
                processed_at: None,
            })
            .await;

        let gate = gate(storage);
        let result = gate.acquire(&tenant(), Some("n-1"), "orders/paid").await.unwrap();
        assert!(result.acquired);
        assert!(result.existing);
    }

    #[tokio::test]
    async fn fresh_processing_lock_is_not_taken_over() {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .insert_lock_row(WebhookLock {
                tenant: tenant(),
                notification_id: "n-1".to_string(),
                topic: "orders/paid".to_string(),
                status: LockStatus::Processing,
                received_at: now_secs() - 30,
                processed_at: None,
            })
            .await;

        let gate = gate(storage);
        let result = gate.acquire(&tenant(), Some("n-1"), "orders/paid").await.unwrap();
        assert!(!result.acquired);
        assert!(result.existing);
    }

    #[tokio::test]
    async fn processed_lock_is_never_taken_over() {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .insert_lock_row(WebhookLock {
                tenant: tenant(),
                notification_id: "n-1".to_string(),
                topic: "orders/paid".to_string(),
                status: LockStatus::Processed,
                received_at: now_secs() - 600,
                processed_at: Some(now_secs() - 590),
            })
            .await;

        let gate = gate(storage);
        let result = gate.acquire(&tenant(), Some("n-1"), "orders/paid").await.unwrap();
        assert!(!result.acquired);
    }

    #[tokio::test]
    async fn concurrent_acquires_grant_exactly_one() {
        let storage = Arc::new(InMemoryStorage::new());
        let gate = Arc::new(IdempotencyGate::new(storage, LockConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.acquire(&TenantId("shop-1".to_string()), Some("n-1"), "orders/paid")
                    .await
                    .unwrap()
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap().acquired {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn with_lock_short_circuits_duplicates() {
        let storage = Arc::new(InMemoryStorage::new());
        let gate = gate(storage.clone());

        let ran: Result<Option<u32>, StoreError> = gate
            .with_lock(&tenant(), Some("n-1"), "orders/paid", || async { Ok(7) })
            .await;
        assert_eq!(ran.unwrap(), Some(7));

        let duplicate: Result<Option<u32>, StoreError> = gate
            .with_lock(&tenant(), Some("n-1"), "orders/paid", || async { Ok(8) })
            .await;
        assert_eq!(duplicate.unwrap(), None);

        let lock = storage
            .get_lock(&tenant(), "n-1", "orders/paid")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.status, LockStatus::Processed);
    }

    #[tokio::test]
    async fn with_lock_marks_failed_on_handler_error() {
        let storage = Arc::new(InMemoryStorage::new());
        let gate = gate(storage.clone());

        let result: Result<Option<u32>, StoreError> = gate
            .with_lock(&tenant(), Some("n-1"), "orders/paid", || async {
                Err(StoreError::Query("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        let lock = storage
            .get_lock(&tenant(), "n-1", "orders/paid")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.status, LockStatus::Failed);
    }
}
