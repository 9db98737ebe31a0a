use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{
    ConversionJob, JobId, JobStatus, JobUpdate, LockStatus, NewConversionJob, OrderId, Receipt,
    ShopConfig, TenantId, TrustLevel, WebhookLock,
};

/// Persistence seam for the delivery pipeline.
///
/// The contract mirrors a relational store: unique-constrained inserts for
/// lock rows, conditional updates for stale-lock takeover, and a claim
/// operation that must skip rows concurrently claimed elsewhere rather
/// than block on them.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a lock row with status `processing`.
    ///
    /// Returns `false` when the unique constraint on
    /// (tenant, notification id, topic) was violated.
    async fn try_insert_lock(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
        now: u64,
    ) -> Result<bool, StoreError>;

    async fn get_lock(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
    ) -> Result<Option<WebhookLock>, StoreError>;

    /// Atomic conditional takeover of a dead `processing` lock.
    ///
    /// Sets `received_at = now` only when the row is still `processing` and
    /// its `received_at` is still older than `stale_before`. Returns whether
    /// a row was updated. Never a blind write; a competing instance doing
    /// its own takeover must not be silently overwritten.
    async fn takeover_stale_lock(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
        stale_before: u64,
        now: u64,
    ) -> Result<bool, StoreError>;

    async fn set_lock_status(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
        status: LockStatus,
        now: u64,
    ) -> Result<(), StoreError>;

    /// Create or refresh a conversion job, keyed by (tenant, order id).
    ///
    /// Re-delivery of the same notification updates the payload fields in
    /// place; lifecycle fields are left untouched.
    async fn upsert_job(&self, job: NewConversionJob, now: u64) -> Result<JobId, StoreError>;

    /// Atomically claim up to `batch_size` eligible jobs.
    ///
    /// Eligible: `queued`, or `failed` with `next_retry_at <= now` and
    /// `attempts < max_attempts`. Oldest-created-first. Rows locked by a
    /// concurrent claimer are skipped, not waited on. Claimed rows are
    /// transitioned to `processing` in the same transaction.
    async fn claim_jobs(&self, batch_size: usize, now: u64) -> Result<Vec<ConversionJob>, StoreError>;

    /// Apply a batch of job updates in one round trip.
    async fn apply_updates(&self, updates: &[JobUpdate]) -> Result<(), StoreError>;

    /// Apply a single job update (fallback path when the batch fails).
    async fn apply_update(&self, update: &JobUpdate) -> Result<(), StoreError>;

    async fn job_by_order(
        &self,
        tenant: &TenantId,
        order_id: &OrderId,
    ) -> Result<Option<ConversionJob>, StoreError>;

    /// Reset dead-lettered jobs for a tenant back to `queued` (operator
    /// action). Returns the number of jobs requeued.
    async fn requeue_dead_letters(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<usize, StoreError>;

    /// One batched read of receipts for a whole claim: every receipt whose
    /// (tenant, order key) or (tenant, checkout token) appears in the input.
    async fn receipts_by_keys(
        &self,
        order_keys: &[(TenantId, String)],
        tokens: &[(TenantId, String)],
    ) -> Result<Vec<Receipt>, StoreError>;

    /// Receipts for one tenant received within `window_secs` of `center`,
    /// newest first, bounded by `limit`. Fuel for the fuzzy match fallback.
    async fn receipts_in_window(
        &self,
        tenant: &TenantId,
        center: u64,
        window_secs: u64,
        limit: usize,
    ) -> Result<Vec<Receipt>, StoreError>;

    /// Persist the evaluated trust level onto a receipt.
    async fn set_receipt_trust(
        &self,
        tenant: &TenantId,
        order_key: &str,
        level: TrustLevel,
    ) -> Result<(), StoreError>;

    async fn shop_config(&self, tenant: &TenantId) -> Result<Option<ShopConfig>, StoreError>;
}

#[derive(Default)]
struct InMemoryState {
    next_job_id: u64,
    jobs: HashMap<JobId, ConversionJob>,
    jobs_by_order: HashMap<(String, String), JobId>,
    locks: HashMap<(String, String, String), WebhookLock>,
    receipts: Vec<Receipt>,
    shops: HashMap<String, ShopConfig>,
}

/// In-memory storage for embedded deployments and tests.
///
/// One mutex over the whole state; claim and takeover run inside a single
/// critical section, which gives the same atomicity the Postgres backend
/// gets from transactions and row locks.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<InMemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a receipt, as the out-of-scope ingestion path would.
    pub async fn insert_receipt(&self, receipt: Receipt) {
        self.state.lock().await.receipts.push(receipt);
    }

    /// Seed a shop configuration.
    pub async fn insert_shop(&self, shop: ShopConfig) {
        let mut state = self.state.lock().await;
        state.shops.insert(shop.tenant.0.clone(), shop);
    }

    /// Seed a lock row directly, bypassing the unique-insert path.
    pub async fn insert_lock_row(&self, lock: WebhookLock) {
        let key = (
            lock.tenant.0.clone(),
            lock.notification_id.clone(),
            lock.topic.clone(),
        );
        self.state.lock().await.locks.insert(key, lock);
    }

    pub async fn job(&self, id: JobId) -> Option<ConversionJob> {
        self.state.lock().await.jobs.get(&id).cloned()
    }

    pub async fn receipt_by_order_key(&self, tenant: &TenantId, order_key: &str) -> Option<Receipt> {
        self.state
            .lock()
            .await
            .receipts
            .iter()
            .find(|r| r.tenant == *tenant && r.order_key == order_key)
            .cloned()
    }
}

fn job_eligible(job: &ConversionJob, now: u64) -> bool {
    match job.status {
        JobStatus::Queued => true,
        JobStatus::Failed => {
            job.attempts < job.max_attempts
                && job.next_retry_at.map_or(false, |at| at <= now)
        }
        _ => false,
    }
}

fn apply_update_to(job: &mut ConversionJob, update: &JobUpdate) {
    job.status = update.status;
    job.attempts = update.attempts;
    job.last_attempt_at = update.last_attempt_at;
    job.next_retry_at = update.next_retry_at;
    job.processed_at = update.processed_at;
    job.completed_at = update.completed_at;
    job.error_message = update.error_message.clone();
    job.platform_results = update.platform_results.clone();
    job.trust_metadata = update.trust_metadata.clone();
    job.consent_evidence = update.consent_evidence.clone();
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn try_insert_lock(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
        now: u64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = (tenant.0.clone(), notification_id.to_string(), topic.to_string());
        if state.locks.contains_key(&key) {
            return Ok(false);
        }
        state.locks.insert(
            key,
            WebhookLock {
                tenant: tenant.clone(),
                notification_id: notification_id.to_string(),
                topic: topic.to_string(),
                status: LockStatus::Processing,
                received_at: now,
                processed_at: None,
            },
        );
        Ok(true)
    }

    async fn get_lock(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
    ) -> Result<Option<WebhookLock>, StoreError> {
        let state = self.state.lock().await;
        let key = (tenant.0.clone(), notification_id.to_string(), topic.to_string());
        Ok(state.locks.get(&key).cloned())
    }

    async fn takeover_stale_lock(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
        stale_before: u64,
        now: u64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = (tenant.0.clone(), notification_id.to_string(), topic.to_string());
        match state.locks.get_mut(&key) {
            Some(lock)
                if lock.status == LockStatus::Processing && lock.received_at < stale_before =>
            {
                lock.received_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_lock_status(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
        status: LockStatus,
        now: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = (tenant.0.clone(), notification_id.to_string(), topic.to_string());
        if let Some(lock) = state.locks.get_mut(&key) {
            lock.status = status;
            lock.processed_at = Some(now);
        }
        Ok(())
    }

    async fn upsert_job(&self, job: NewConversionJob, now: u64) -> Result<JobId, StoreError> {
        let mut state = self.state.lock().await;
        let order_key = (job.tenant.0.clone(), job.order_id.0.clone());

        if let Some(&id) = state.jobs_by_order.get(&order_key) {
            if let Some(existing) = state.jobs.get_mut(&id) {
                existing.order_number = job.order_number;
                existing.value = job.value;
                existing.currency = job.currency;
                existing.event = job.event;
            }
            return Ok(id);
        }

        state.next_job_id += 1;
        let id = JobId(state.next_job_id);
        state.jobs.insert(
            id,
            ConversionJob {
                id,
                tenant: job.tenant,
                order_id: job.order_id,
                order_number: job.order_number,
                value: job.value,
                currency: job.currency,
                event: job.event,
                status: JobStatus::Queued,
                attempts: 0,
                max_attempts: job.max_attempts,
                created_at: now,
                last_attempt_at: None,
                next_retry_at: None,
                processed_at: None,
                completed_at: None,
                error_message: None,
                platform_results: HashMap::new(),
                trust_metadata: None,
                consent_evidence: None,
            },
        );
        state.jobs_by_order.insert(order_key, id);
        Ok(id)
    }

    async fn claim_jobs(&self, batch_size: usize, now: u64) -> Result<Vec<ConversionJob>, StoreError> {
        let mut state = self.state.lock().await;

        let mut eligible: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job_eligible(job, now))
            .map(|job| job.id)
            .collect();
        eligible.sort_by_key(|id| {
            let job = &state.jobs[id];
            (job.created_at, job.id)
        });
        eligible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn apply_updates(&self, updates: &[JobUpdate]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for update in updates {
            if let Some(job) = state.jobs.get_mut(&update.id) {
                apply_update_to(job, update);
            }
        }
        Ok(())
    }

    async fn apply_update(&self, update: &JobUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&update.id) {
            apply_update_to(job, update);
        }
        Ok(())
    }

    async fn job_by_order(
        &self,
        tenant: &TenantId,
        order_id: &OrderId,
    ) -> Result<Option<ConversionJob>, StoreError> {
        let state = self.state.lock().await;
        let key = (tenant.0.clone(), order_id.0.clone());
        Ok(state
            .jobs_by_order
            .get(&key)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn requeue_dead_letters(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        let mut ids: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.tenant == *tenant && job.status == JobStatus::DeadLetter)
            .map(|job| job.id)
            .collect();
        ids.sort();
        for id in ids.into_iter().take(limit) {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Queued;
                job.attempts = 0;
                job.next_retry_at = None;
                job.error_message = None;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn receipts_by_keys(
        &self,
        order_keys: &[(TenantId, String)],
        tokens: &[(TenantId, String)],
    ) -> Result<Vec<Receipt>, StoreError> {
        let state = self.state.lock().await;
        let found = state
            .receipts
            .iter()
            .filter(|r| {
                order_keys.iter().any(|(tenant, key)| {
                    r.tenant == *tenant
                        && (r.order_key == *key || r.alt_order_key.as_deref() == Some(key))
                }) || tokens.iter().any(|(tenant, token)| {
                    r.tenant == *tenant && r.checkout_token.as_deref() == Some(token)
                })
            })
            .cloned()
            .collect();
        Ok(found)
    }

    async fn receipts_in_window(
        &self,
        tenant: &TenantId,
        center: u64,
        window_secs: u64,
        limit: usize,
    ) -> Result<Vec<Receipt>, StoreError> {
        let state = self.state.lock().await;
        let lower = center.saturating_sub(window_secs);
        let upper = center.saturating_add(window_secs);
        let mut found: Vec<Receipt> = state
            .receipts
            .iter()
            .filter(|r| r.tenant == *tenant && r.received_ts >= lower && r.received_ts <= upper)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.received_ts.cmp(&a.received_ts));
        found.truncate(limit);
        Ok(found)
    }

    async fn set_receipt_trust(
        &self,
        tenant: &TenantId,
        order_key: &str,
        level: TrustLevel,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for receipt in state.receipts.iter_mut() {
            if receipt.tenant == *tenant && receipt.order_key == order_key {
                receipt.trust_level = Some(level);
            }
        }
        Ok(())
    }

    async fn shop_config(&self, tenant: &TenantId) -> Result<Option<ShopConfig>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.shops.get(&tenant.0).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HashedIdentifiers, LineItem, OrderEvent};

    fn new_job(tenant: &str, order: &str) -> NewConversionJob {
        NewConversionJob {
            tenant: TenantId(tenant.to_string()),
            order_id: OrderId(order.to_string()),
            order_number: format!("#{order}"),
            value: 42.0,
            currency: "USD".to_string(),
            event: OrderEvent::Purchase {
                checkout_token: Some(format!("tok_{order}")),
                line_items: vec![LineItem {
                    product_id: "sku-1".to_string(),
                    title: None,
                    quantity: 1,
                    price: 42.0,
                }],
                customer: HashedIdentifiers::default(),
            },
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_tenant_and_order() {
        let storage = InMemoryStorage::new();
        let first = storage.upsert_job(new_job("shop-1", "1001"), 100).await.unwrap();
        let second = storage.upsert_job(new_job("shop-1", "1001"), 200).await.unwrap();
        assert_eq!(first, second);

        let other = storage.upsert_job(new_job("shop-2", "1001"), 100).await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn claim_selects_queued_and_due_retries_only() {
        let storage = InMemoryStorage::new();
        let queued = storage.upsert_job(new_job("shop-1", "1"), 100).await.unwrap();
        let retry_due = storage.upsert_job(new_job("shop-1", "2"), 101).await.unwrap();
        let retry_later = storage.upsert_job(new_job("shop-1", "3"), 102).await.unwrap();
        let exhausted = storage.upsert_job(new_job("shop-1", "4"), 103).await.unwrap();

        let failed = |id: JobId, attempts: u32, retry_at: Option<u64>| JobUpdate {
            id,
            status: JobStatus::Failed,
            attempts,
            last_attempt_at: Some(150),
            next_retry_at: retry_at,
            processed_at: Some(150),
            completed_at: None,
            error_message: Some("timeout".to_string()),
            platform_results: HashMap::new(),
            trust_metadata: None,
            consent_evidence: None,
        };
        storage.apply_update(&failed(retry_due, 1, Some(500))).await.unwrap();
        storage.apply_update(&failed(retry_later, 1, Some(5_000))).await.unwrap();
        storage.apply_update(&failed(exhausted, 3, Some(500))).await.unwrap();

        let claimed = storage.claim_jobs(10, 1_000).await.unwrap();
        let ids: Vec<JobId> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![queued, retry_due]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Processing));
    }

    #[tokio::test]
    async fn claim_orders_oldest_first_and_respects_batch_size() {
        let storage = InMemoryStorage::new();
        let old = storage.upsert_job(new_job("shop-1", "a"), 50).await.unwrap();
        let _newer = storage.upsert_job(new_job("shop-1", "b"), 60).await.unwrap();

        let claimed = storage.claim_jobs(1, 1_000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, old);
    }

    #[tokio::test]
    async fn claimed_jobs_are_not_claimable_again() {
        let storage = InMemoryStorage::new();
        storage.upsert_job(new_job("shop-1", "a"), 50).await.unwrap();

        let first = storage.claim_jobs(10, 1_000).await.unwrap();
        let second = storage.claim_jobs(10, 1_000).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn requeue_dead_letters_resets_lifecycle() {
        let storage = InMemoryStorage::new();
        let id = storage.upsert_job(new_job("shop-1", "a"), 50).await.unwrap();
        storage
            .apply_update(&JobUpdate {
                id,
                status: JobStatus::DeadLetter,
                attempts: 3,
                last_attempt_at: Some(100),
                next_retry_at: None,
                processed_at: Some(100),
                completed_at: None,
                error_message: Some("exhausted".to_string()),
                platform_results: HashMap::new(),
                trust_metadata: None,
                consent_evidence: None,
            })
            .await
            .unwrap();

        let count = storage
            .requeue_dead_letters(&TenantId("shop-1".to_string()), 10)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let job = storage.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.next_retry_at.is_none());
    }
}
