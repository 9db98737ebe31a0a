use std::collections::HashMap;
use std::sync::Arc;

use crate::backoff::RetryPolicy;
use crate::platforms::{build_payload, CredentialResolver, DestinationRegistry};
use crate::receipts::{ReceiptIndex, ReceiptMatchConfig};
use crate::trust::{check_platform_eligibility, evaluate_trust, TrustConfig};
use crate::types::{ConversionJob, JobStatus, JobUpdate, PlatformConfig, PlatformKey};

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

/// Result of processing one claimed job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub update: JobUpdate,
    pub sent_platforms: usize,
    pub skipped_platforms: usize,
    pub failed_platforms: usize,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        self.update.status
    }
}

/// Processes one claimed job: trust evaluation, per-destination
/// eligibility, concurrent sends, and the finalize decision.
pub struct JobProcessor {
    storage: Arc<dyn crate::storage::Storage>,
    registry: Arc<DestinationRegistry>,
    credentials: Arc<dyn CredentialResolver>,
    trust: TrustConfig,
    matching: ReceiptMatchConfig,
    retry: RetryPolicy,
}

impl JobProcessor {
    pub fn new(
        storage: Arc<dyn crate::storage::Storage>,
        registry: Arc<DestinationRegistry>,
        credentials: Arc<dyn CredentialResolver>,
        trust: TrustConfig,
        matching: ReceiptMatchConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            registry,
            credentials,
            trust,
            matching,
            retry,
        }
    }

    /// Process a single claimed job against the prefetched receipt index.
    ///
    /// Never returns an error: every path finalizes the job into a state a
    /// later pass or an operator can act on.
    pub async fn process(
        &self,
        job: ConversionJob,
        receipts: Arc<ReceiptIndex>,
        now: u64,
    ) -> JobOutcome {
        let attempts = job.attempts + 1;

        let shop = match self.storage.shop_config(&job.tenant).await {
            Ok(shop) => shop,
            Err(err) => {
                return self.finalize_failure(
                    &job,
                    attempts,
                    now,
                    HashMap::new(),
                    None,
                    None,
                    true,
                    format!("shop config lookup failed: {err}"),
                    0,
                    0,
                );
            }
        };

        let active: Vec<PlatformConfig> = shop
            .as_ref()
            .map(|s| {
                s.platforms
                    .iter()
                    .filter(|p| p.enabled && self.registry.contains(&p.platform))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        // No destinations configured is a terminal success, not a failure.
        if active.is_empty() {
            trace_event("conversion.job.no_platforms_configured");
            metric_inc("conversion.job.no_platforms");
            return JobOutcome {
                update: JobUpdate {
                    id: job.id,
                    status: JobStatus::Completed,
                    attempts,
                    last_attempt_at: Some(now),
                    next_retry_at: None,
                    processed_at: Some(now),
                    completed_at: Some(now),
                    error_message: None,
                    platform_results: HashMap::new(),
                    trust_metadata: None,
                    consent_evidence: None,
                },
                sent_platforms: 0,
                skipped_platforms: 0,
                failed_platforms: 0,
            };
        }
        let shop = shop.expect("active platforms imply a shop config");

        let checkout_token = job.event.checkout_token().map(str::to_string);
        let receipt = match receipts
            .find_for_job(
                self.storage.as_ref(),
                &job.tenant,
                &job.order_id.0,
                checkout_token.as_deref(),
                job.created_at,
                &self.matching,
            )
            .await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                return self.finalize_failure(
                    &job,
                    attempts,
                    now,
                    HashMap::new(),
                    None,
                    None,
                    true,
                    format!("receipt lookup failed: {err}"),
                    0,
                    0,
                );
            }
        };

        let evaluation = evaluate_trust(
            receipt.as_ref(),
            checkout_token.as_deref(),
            &shop,
            &self.trust,
            now,
        );

        // Trust write-back is a side channel; its failure must not change
        // the job's fate.
        if let Some(receipt) = &receipt {
            if self
                .storage
                .set_receipt_trust(&job.tenant, &receipt.order_key, evaluation.result.level)
                .await
                .is_err()
            {
                metric_inc("conversion.receipt.trust_writeback_failed");
            }
        }

        let mut results: HashMap<PlatformKey, String> = HashMap::new();
        let mut skipped = 0usize;
        let mut sends = Vec::new();

        for platform_cfg in &active {
            let decision = check_platform_eligibility(
                platform_cfg,
                &evaluation.result,
                &evaluation.consent,
                shop.strategy,
            );
            if !decision.allowed {
                let reason = decision.skip_reason.unwrap_or_else(|| "policy".to_string());
                results.insert(platform_cfg.platform.clone(), format!("skipped:{reason}"));
                skipped += 1;
                metric_inc("conversion.platform.skipped");
                continue;
            }

            let destination = self
                .registry
                .get(&platform_cfg.platform)
                .expect("active platforms are registry-checked");

            let creds = match self
                .credentials
                .decrypt(&platform_cfg.credentials, &platform_cfg.platform)
                .await
            {
                Ok(creds) => creds,
                Err(err) => {
                    results.insert(
                        platform_cfg.platform.clone(),
                        format!("failed:{err}"),
                    );
                    sends.push((platform_cfg.platform.clone(), None));
                    metric_inc("conversion.platform.bad_credentials");
                    continue;
                }
            };

            let payload = build_payload(&job, &platform_cfg.platform);
            let handle = tokio::spawn(async move { destination.send(&creds, &payload).await });
            sends.push((platform_cfg.platform.clone(), Some(handle)));
        }

        // All eligible destinations run concurrently; each is awaited
        // independently so one failure cannot cancel the others.
        let mut sent = 0usize;
        let mut failed = 0usize;
        let mut any_retryable = false;
        let mut last_error: Option<String> = None;

        for (platform, handle) in sends {
            let Some(handle) = handle else {
                // Credential failure already recorded; permanent.
                failed += 1;
                last_error.get_or_insert_with(|| {
                    results.get(&platform).cloned().unwrap_or_default()
                });
                continue;
            };
            match handle.await {
                Ok(Ok(())) => {
                    results.insert(platform, "sent".to_string());
                    sent += 1;
                    metric_inc("conversion.platform.sent");
                }
                Ok(Err(failure)) => {
                    results.insert(platform.clone(), format!("failed:{failure}"));
                    failed += 1;
                    any_retryable |= failure.is_retryable();
                    last_error = Some(format!("{platform}: {failure}"));
                    metric_inc("conversion.platform.failed");
                }
                Err(join_err) => {
                    results.insert(platform.clone(), "failed:internal_error".to_string());
                    failed += 1;
                    any_retryable = true;
                    last_error = Some(format!("{platform}: send task failed: {join_err}"));
                    metric_inc("conversion.platform.failed");
                }
            }
        }

        // At least one delivered, or everything skipped by policy: terminal
        // success either way. Only send failures drive the retry path.
        if sent > 0 || failed == 0 {
            trace_event("conversion.job.completed");
            return JobOutcome {
                update: JobUpdate {
                    id: job.id,
                    status: JobStatus::Completed,
                    attempts,
                    last_attempt_at: Some(now),
                    next_retry_at: None,
                    processed_at: Some(now),
                    completed_at: Some(now),
                    error_message: None,
                    platform_results: results,
                    trust_metadata: Some(evaluation.summary),
                    consent_evidence: Some(evaluation.consent),
                },
                sent_platforms: sent,
                skipped_platforms: skipped,
                failed_platforms: failed,
            };
        }

        self.finalize_failure(
            &job,
            attempts,
            now,
            results,
            Some(evaluation.summary),
            Some(evaluation.consent),
            any_retryable,
            last_error.unwrap_or_else(|| "all destination sends failed".to_string()),
            skipped,
            failed,
        )
    }

    /// Decide queued-retry vs dead-letter for a failed processing pass.
    #[allow(clippy::too_many_arguments)]
    fn finalize_failure(
        &self,
        job: &ConversionJob,
        attempts: u32,
        now: u64,
        results: HashMap<PlatformKey, String>,
        trust_metadata: Option<crate::types::TrustSummary>,
        consent_evidence: Option<crate::types::ConsentState>,
        retryable: bool,
        error_message: String,
        skipped: usize,
        failed: usize,
    ) -> JobOutcome {
        let exhausted = attempts >= job.max_attempts;
        let (status, next_retry_at) = if !retryable {
            // Every failure was permanent; retrying cannot help.
            (JobStatus::Failed, None)
        } else if exhausted {
            metric_inc("conversion.job.dead_letter");
            (JobStatus::DeadLetter, None)
        } else {
            let delay = self.retry.next_retry_delay(attempts);
            (JobStatus::Failed, Some(now + delay.as_secs().max(1)))
        };

        trace_event("conversion.job.failed");
        JobOutcome {
            update: JobUpdate {
                id: job.id,
                status,
                attempts,
                last_attempt_at: Some(now),
                next_retry_at,
                processed_at: Some(now),
                completed_at: None,
                error_message: Some(error_message),
                platform_results: results,
                trust_metadata,
                consent_evidence,
            },
            sent_platforms: 0,
            skipped_platforms: skipped,
            failed_platforms: failed,
        }
    }
}
