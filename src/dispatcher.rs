use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::sleep;

use crate::backoff::{BatchBackoff, BatchBackoffConfig, RetryPolicy};
use crate::error::PipelineError;
use crate::lock::{IdempotencyGate, LockConfig};
use crate::platforms::{CredentialResolver, DestinationRegistry};
use crate::receipts::{ReceiptIndex, ReceiptMatchConfig};
use crate::storage::Storage;
use crate::trust::TrustConfig;
use crate::types::{now_secs, JobId, JobStatus, JobUpdate, NewConversionJob, TenantId};
use crate::worker::JobProcessor;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_event(message: &'static str) {
    tracing::info!(message);
}

#[cfg(not(feature = "tracing"))]
fn trace_event(_message: &'static str) {}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Jobs claimed per batch pass.
    pub batch_size: usize,

    /// Concurrent job workers within one batch. Caps simultaneous
    /// outbound connections and credential decryptions.
    pub worker_count: usize,

    /// Default attempt budget for newly enqueued jobs.
    pub max_attempts: u32,

    pub retry: RetryPolicy,
    pub trust: TrustConfig,
    pub matching: ReceiptMatchConfig,
    pub lock: LockConfig,
    pub batch_backoff: BatchBackoffConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            worker_count: 10,
            max_attempts: 8,
            retry: RetryPolicy::default(),
            trust: TrustConfig::default(),
            matching: ReceiptMatchConfig::default(),
            lock: LockConfig::default(),
            batch_backoff: BatchBackoffConfig::default(),
        }
    }
}

/// Counters for one batch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub sent_platforms: usize,
    pub skipped_platforms: usize,
}

/// Trust-gated conversion delivery pipeline.
///
/// Multiple instances may run batch passes on independent schedules;
/// correctness under concurrency comes from the idempotency lock protocol
/// at the notification boundary and skip-locked claiming at the job
/// boundary, both enforced by the storage layer.
pub struct Pipeline {
    storage: Arc<dyn Storage>,
    processor: Arc<JobProcessor>,
    gate: IdempotencyGate,
    backoff: Mutex<BatchBackoff>,
    retry: RetryPolicy,
    batch_size: usize,
    worker_count: usize,
    max_attempts: u32,
}

impl Pipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<DestinationRegistry>,
        credentials: Arc<dyn CredentialResolver>,
        config: PipelineConfig,
    ) -> Self {
        let processor = Arc::new(JobProcessor::new(
            storage.clone(),
            registry,
            credentials,
            config.trust.clone(),
            config.matching.clone(),
            config.retry.clone(),
        ));
        let gate = IdempotencyGate::new(storage.clone(), config.lock.clone());

        Self {
            storage,
            processor,
            gate,
            backoff: Mutex::new(BatchBackoff::new(config.batch_backoff)),
            retry: config.retry,
            batch_size: config.batch_size.max(1),
            worker_count: config.worker_count.max(1),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// The notification-level idempotency gate.
    pub fn gate(&self) -> &IdempotencyGate {
        &self.gate
    }

    /// Validate and upsert a conversion job.
    ///
    /// Keyed by (tenant, order id): re-delivery of the same notification
    /// updates the existing row instead of duplicating it.
    pub async fn enqueue(&self, mut job: NewConversionJob) -> Result<JobId, PipelineError> {
        job.event
            .validate()
            .map_err(PipelineError::InvalidEvent)?;
        if !job.value.is_finite() || job.value < 0.0 {
            return Err(PipelineError::InvalidEvent("order value is not a valid amount".to_string()));
        }
        if job.currency.is_empty() {
            return Err(PipelineError::InvalidEvent("currency is empty".to_string()));
        }
        if job.max_attempts == 0 {
            job.max_attempts = self.max_attempts;
        }

        let id = self.storage.upsert_job(job, now_secs()).await?;
        metric_inc("conversion.job.enqueued");
        Ok(id)
    }

    /// Idempotency-gated notification intake: enqueue the job only when
    /// this instance wins the notification lock. `Ok(None)` is a duplicate.
    pub async fn handle_notification(
        &self,
        tenant: &TenantId,
        notification_id: Option<&str>,
        topic: &str,
        job: NewConversionJob,
    ) -> Result<Option<JobId>, PipelineError> {
        self.gate
            .with_lock(tenant, notification_id, topic, || self.enqueue(job))
            .await
    }

    /// Run one batch pass: batch backoff, claim, receipt prefetch, bounded
    /// concurrent processing, one batched status update.
    pub async fn run_batch(&self) -> Result<BatchReport, PipelineError> {
        let delay = self.backoff.lock().await.current_delay();
        if delay > Duration::ZERO {
            metric_inc("conversion.batch.backoff_applied");
            sleep(delay).await;
        }

        let now = now_secs();
        let jobs = self.storage.claim_jobs(self.batch_size, now).await?;
        if jobs.is_empty() {
            return Ok(BatchReport::default());
        }
        let claimed = jobs.len();
        trace_event("conversion.batch.claimed");

        // One batched read for the whole claim; per-job lookups stay O(1).
        let receipts = Arc::new(ReceiptIndex::batch_fetch(self.storage.as_ref(), &jobs).await?);

        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let permit = semaphore.clone();
            let processor = self.processor.clone();
            let receipts = receipts.clone();
            let job_identity = (job.id, job.attempts, job.max_attempts);
            let handle = tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore never closed");
                processor.process(job, receipts, now).await
            });
            handles.push((job_identity, handle));
        }

        let mut report = BatchReport {
            claimed,
            ..BatchReport::default()
        };
        let mut updates: Vec<JobUpdate> = Vec::with_capacity(claimed);

        for ((job_id, prior_attempts, job_max_attempts), handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(_join_err) => {
                    // A panicked worker must still leave the job actionable.
                    metric_inc("conversion.worker.panicked");
                    let attempts = prior_attempts + 1;
                    let exhausted = attempts >= job_max_attempts;
                    crate::worker::JobOutcome {
                        update: JobUpdate {
                            id: job_id,
                            status: if exhausted { JobStatus::DeadLetter } else { JobStatus::Failed },
                            attempts,
                            last_attempt_at: Some(now),
                            next_retry_at: if exhausted {
                                None
                            } else {
                                Some(now + self.retry.next_retry_delay(attempts).as_secs().max(1))
                            },
                            processed_at: Some(now),
                            completed_at: None,
                            error_message: Some("worker task panicked".to_string()),
                            platform_results: Default::default(),
                            trust_metadata: None,
                            consent_evidence: None,
                        },
                        sent_platforms: 0,
                        skipped_platforms: 0,
                        failed_platforms: 0,
                    }
                }
            };

            match outcome.status() {
                JobStatus::Completed => report.completed += 1,
                JobStatus::DeadLetter => report.dead_lettered += 1,
                _ => report.failed += 1,
            }
            report.sent_platforms += outcome.sent_platforms;
            report.skipped_platforms += outcome.skipped_platforms;
            updates.push(outcome.update);
        }

        // One batched write; on failure fall back to per-row updates rather
        // than losing the whole batch's work.
        if self.storage.apply_updates(&updates).await.is_err() {
            metric_inc("conversion.batch.update_fallback");
            for update in &updates {
                if self.storage.apply_update(update).await.is_err() {
                    metric_inc("conversion.batch.update_row_failed");
                }
            }
        }

        self.backoff
            .lock()
            .await
            .observe_batch(claimed, report.failed + report.dead_lettered, 0);

        trace_event("conversion.batch.finished");
        Ok(report)
    }

    /// Delay the next batch pass will sleep before claiming.
    pub async fn current_batch_delay(&self) -> Duration {
        self.backoff.lock().await.current_delay()
    }

    /// Operator action: make dead-lettered jobs claimable again.
    pub async fn requeue_dead_letters(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<usize, PipelineError> {
        let count = self.storage.requeue_dead_letters(tenant, limit).await?;
        if count > 0 {
            metric_inc("conversion.dead_letter.requeued");
        }
        Ok(count)
    }
}
