#[cfg(feature = "postgres")]
use std::collections::HashMap;

#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use tokio::sync::Mutex;
#[cfg(feature = "postgres")]
use tokio_postgres::{Client, GenericClient};

#[cfg(feature = "postgres")]
use crate::error::StoreError;
#[cfg(feature = "postgres")]
use crate::storage::Storage;
#[cfg(feature = "postgres")]
use crate::types::{
    ConsentState, ConversionJob, JobId, JobStatus, JobUpdate, LockStatus, NewConversionJob,
    OrderEvent, OrderId, Receipt, ShopConfig, TenantId, TrustLevel, TrustSummary, WebhookLock,
};

/// Postgres-backed storage.
///
/// Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent pipeline instances
/// never wait on each other's rows; the idempotency lock rides the primary
/// key constraint on `webhook_locks`. The connection is serialized behind a
/// mutex because transactions need exclusive access to it; each pipeline
/// instance carries its own connection.
#[cfg(feature = "postgres")]
pub struct PostgresStorage {
    client: Mutex<Client>,
}

#[cfg(feature = "postgres")]
fn db_err(err: tokio_postgres::Error) -> StoreError {
    if err.is_closed() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Query(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl PostgresStorage {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS conversion_jobs (
                    id BIGSERIAL PRIMARY KEY,
                    tenant TEXT NOT NULL,
                    order_id TEXT NOT NULL,
                    order_number TEXT NOT NULL,
                    value DOUBLE PRECISION NOT NULL,
                    currency TEXT NOT NULL,
                    event JSONB NOT NULL,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    created_at BIGINT NOT NULL,
                    last_attempt_at BIGINT,
                    next_retry_at BIGINT,
                    processed_at BIGINT,
                    completed_at BIGINT,
                    error_message TEXT,
                    platform_results JSONB NOT NULL DEFAULT '{}'::jsonb,
                    trust_metadata JSONB,
                    consent_evidence JSONB,
                    UNIQUE (tenant, order_id)
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_locks (
                    tenant TEXT NOT NULL,
                    notification_id TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    status TEXT NOT NULL,
                    received_at BIGINT NOT NULL,
                    processed_at BIGINT,
                    PRIMARY KEY (tenant, notification_id, topic)
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS pixel_receipts (
                    tenant TEXT NOT NULL,
                    order_key TEXT NOT NULL,
                    alt_order_key TEXT,
                    checkout_token TEXT,
                    event_type TEXT NOT NULL,
                    origin_host TEXT,
                    client_ts BIGINT NOT NULL,
                    received_ts BIGINT NOT NULL,
                    key_match BOOLEAN NOT NULL DEFAULT FALSE,
                    consent JSONB,
                    trust_level TEXT
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS shop_configs (
                    tenant TEXT PRIMARY KEY,
                    config JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        Ok(Self { client: Mutex::new(client) })
    }

    fn job_from_row(row: &tokio_postgres::Row) -> Result<ConversionJob, StoreError> {
        let event: serde_json::Value = row.try_get("event").map_err(db_err)?;
        let event: OrderEvent = serde_json::from_value(event)
            .map_err(|e| StoreError::Query(format!("bad event payload: {e}")))?;

        let platform_results: serde_json::Value =
            row.try_get("platform_results").map_err(db_err)?;
        let platform_results: HashMap<crate::types::PlatformKey, String> =
            serde_json::from_value(platform_results).unwrap_or_default();

        let trust_metadata: Option<serde_json::Value> =
            row.try_get("trust_metadata").map_err(db_err)?;
        let trust_metadata: Option<TrustSummary> =
            trust_metadata.and_then(|v| serde_json::from_value(v).ok());

        let consent_evidence: Option<serde_json::Value> =
            row.try_get("consent_evidence").map_err(db_err)?;
        let consent_evidence: Option<ConsentState> =
            consent_evidence.and_then(|v| serde_json::from_value(v).ok());

        let status: String = row.try_get("status").map_err(db_err)?;
        let status = JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Query(format!("unknown job status: {status}")))?;

        Ok(ConversionJob {
            id: JobId(row.try_get::<_, i64>("id").map_err(db_err)? as u64),
            tenant: TenantId(row.try_get("tenant").map_err(db_err)?),
            order_id: OrderId(row.try_get("order_id").map_err(db_err)?),
            order_number: row.try_get("order_number").map_err(db_err)?,
            value: row.try_get("value").map_err(db_err)?,
            currency: row.try_get("currency").map_err(db_err)?,
            event,
            status,
            attempts: row.try_get::<_, i32>("attempts").map_err(db_err)?.max(0) as u32,
            max_attempts: row.try_get::<_, i32>("max_attempts").map_err(db_err)?.max(1) as u32,
            created_at: row.try_get::<_, i64>("created_at").map_err(db_err)? as u64,
            last_attempt_at: opt_u64(row, "last_attempt_at")?,
            next_retry_at: opt_u64(row, "next_retry_at")?,
            processed_at: opt_u64(row, "processed_at")?,
            completed_at: opt_u64(row, "completed_at")?,
            error_message: row.try_get("error_message").map_err(db_err)?,
            platform_results,
            trust_metadata,
            consent_evidence,
        })
    }

    fn receipt_from_row(row: &tokio_postgres::Row) -> Result<Receipt, StoreError> {
        let trust_level: Option<String> = row.try_get("trust_level").map_err(db_err)?;
        Ok(Receipt {
            tenant: TenantId(row.try_get("tenant").map_err(db_err)?),
            order_key: row.try_get("order_key").map_err(db_err)?,
            alt_order_key: row.try_get("alt_order_key").map_err(db_err)?,
            checkout_token: row.try_get("checkout_token").map_err(db_err)?,
            event_type: row.try_get("event_type").map_err(db_err)?,
            origin_host: row.try_get("origin_host").map_err(db_err)?,
            client_ts: row.try_get::<_, i64>("client_ts").map_err(db_err)? as u64,
            received_ts: row.try_get::<_, i64>("received_ts").map_err(db_err)? as u64,
            key_match: row.try_get("key_match").map_err(db_err)?,
            consent: row.try_get("consent").map_err(db_err)?,
            trust_level: trust_level.as_deref().and_then(TrustLevel::parse),
        })
    }
}

#[cfg(feature = "postgres")]
fn opt_u64(row: &tokio_postgres::Row, column: &str) -> Result<Option<u64>, StoreError> {
    let value: Option<i64> = row.try_get(column).map_err(db_err)?;
    Ok(value.map(|v| v as u64))
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Storage for PostgresStorage {
    async fn try_insert_lock(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
        now: u64,
    ) -> Result<bool, StoreError> {
        let client = self.client.lock().await;
        let inserted = client
            .execute(
                "INSERT INTO webhook_locks (tenant, notification_id, topic, status, received_at)
                 VALUES ($1, $2, $3, 'processing', $4)
                 ON CONFLICT (tenant, notification_id, topic) DO NOTHING",
                &[&tenant.0, &notification_id, &topic, &(now as i64)],
            )
            .await
            .map_err(db_err)?;
        Ok(inserted == 1)
    }

    async fn get_lock(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
    ) -> Result<Option<WebhookLock>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT tenant, notification_id, topic, status, received_at, processed_at
                 FROM webhook_locks
                 WHERE tenant = $1 AND notification_id = $2 AND topic = $3",
                &[&tenant.0, &notification_id, &topic],
            )
            .await
            .map_err(db_err)?;

        row.map(|row| {
            let status: String = row.try_get("status").map_err(db_err)?;
            Ok(WebhookLock {
                tenant: TenantId(row.try_get("tenant").map_err(db_err)?),
                notification_id: row.try_get("notification_id").map_err(db_err)?,
                topic: row.try_get("topic").map_err(db_err)?,
                status: LockStatus::parse(&status)
                    .ok_or_else(|| StoreError::Query(format!("unknown lock status: {status}")))?,
                received_at: row.try_get::<_, i64>("received_at").map_err(db_err)? as u64,
                processed_at: opt_u64(&row, "processed_at")?,
            })
        })
        .transpose()
    }

    async fn takeover_stale_lock(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
        stale_before: u64,
        now: u64,
    ) -> Result<bool, StoreError> {
        // Conditional, not a blind write: only a still-stale, still-processing
        // row may be taken over.
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE webhook_locks
                 SET received_at = $4
                 WHERE tenant = $1 AND notification_id = $2 AND topic = $3
                   AND status = 'processing' AND received_at < $5",
                &[
                    &tenant.0,
                    &notification_id,
                    &topic,
                    &(now as i64),
                    &(stale_before as i64),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(updated == 1)
    }

    async fn set_lock_status(
        &self,
        tenant: &TenantId,
        notification_id: &str,
        topic: &str,
        status: LockStatus,
        now: u64,
    ) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        client
            .execute(
                "UPDATE webhook_locks
                 SET status = $4, processed_at = $5
                 WHERE tenant = $1 AND notification_id = $2 AND topic = $3",
                &[
                    &tenant.0,
                    &notification_id,
                    &topic,
                    &status.as_str(),
                    &(now as i64),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn upsert_job(&self, job: NewConversionJob, now: u64) -> Result<JobId, StoreError> {
        let event = serde_json::to_value(&job.event)
            .map_err(|e| StoreError::Query(format!("event serialization failed: {e}")))?;
        let client = self.client.lock().await;
        let row = client
            .query_one(
                "INSERT INTO conversion_jobs
                     (tenant, order_id, order_number, value, currency, event,
                      status, max_attempts, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, 'queued', $7, $8)
                 ON CONFLICT (tenant, order_id) DO UPDATE SET
                     order_number = EXCLUDED.order_number,
                     value = EXCLUDED.value,
                     currency = EXCLUDED.currency,
                     event = EXCLUDED.event
                 RETURNING id",
                &[
                    &job.tenant.0,
                    &job.order_id.0,
                    &job.order_number,
                    &job.value,
                    &job.currency,
                    &event,
                    &(job.max_attempts as i32),
                    &(now as i64),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(JobId(row.try_get::<_, i64>("id").map_err(db_err)? as u64))
    }

    async fn claim_jobs(
        &self,
        batch_size: usize,
        now: u64,
    ) -> Result<Vec<ConversionJob>, StoreError> {
        // Select-then-update inside one transaction; SKIP LOCKED keeps
        // concurrent claimers off each other's rows without blocking.
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;

        let ids: Vec<i64> = tx
            .query(
                "SELECT id FROM conversion_jobs
                 WHERE status = 'queued'
                    OR (status = 'failed'
                        AND next_retry_at IS NOT NULL AND next_retry_at <= $1
                        AND attempts < max_attempts)
                 ORDER BY created_at ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED",
                &[&(now as i64), &(batch_size as i64)],
            )
            .await
            .map_err(db_err)?
            .into_iter()
            .map(|row| row.get::<_, i64>(0))
            .collect();

        if ids.is_empty() {
            tx.rollback().await.map_err(db_err)?;
            return Ok(Vec::new());
        }

        let rows = tx
            .query(
                "UPDATE conversion_jobs
                 SET status = 'processing'
                 WHERE id = ANY($1)
                 RETURNING id, tenant, order_id, order_number, value, currency, event,
                           status, attempts, max_attempts, created_at, last_attempt_at,
                           next_retry_at, processed_at, completed_at, error_message,
                           platform_results, trust_metadata, consent_evidence",
                &[&ids],
            )
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let mut jobs = rows
            .iter()
            .map(Self::job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn apply_updates(&self, updates: &[JobUpdate]) -> Result<(), StoreError> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await.map_err(db_err)?;
        for update in updates {
            apply_update_sql(&tx, update).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn apply_update(&self, update: &JobUpdate) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        apply_update_sql(&*client, update).await
    }

    async fn job_by_order(
        &self,
        tenant: &TenantId,
        order_id: &OrderId,
    ) -> Result<Option<ConversionJob>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT id, tenant, order_id, order_number, value, currency, event,
                        status, attempts, max_attempts, created_at, last_attempt_at,
                        next_retry_at, processed_at, completed_at, error_message,
                        platform_results, trust_metadata, consent_evidence
                 FROM conversion_jobs
                 WHERE tenant = $1 AND order_id = $2",
                &[&tenant.0, &order_id.0],
            )
            .await
            .map_err(db_err)?;
        row.map(|row| Self::job_from_row(&row)).transpose()
    }

    async fn requeue_dead_letters(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE conversion_jobs
                 SET status = 'queued', attempts = 0,
                     next_retry_at = NULL, error_message = NULL
                 WHERE id IN (
                     SELECT id FROM conversion_jobs
                     WHERE tenant = $1 AND status = 'dead_letter'
                     ORDER BY created_at ASC
                     LIMIT $2
                 )",
                &[&tenant.0, &(limit as i64)],
            )
            .await
            .map_err(db_err)?;
        Ok(updated as usize)
    }

    async fn receipts_by_keys(
        &self,
        order_keys: &[(TenantId, String)],
        tokens: &[(TenantId, String)],
    ) -> Result<Vec<Receipt>, StoreError> {
        if order_keys.is_empty() && tokens.is_empty() {
            return Ok(Vec::new());
        }

        // Superset filter: tenants and keys as flat arrays. The in-process
        // index re-keys by (tenant, key), so cross-tenant rows returned by
        // the coarse filter never match a lookup.
        let mut tenants: Vec<&str> = order_keys
            .iter()
            .chain(tokens.iter())
            .map(|(tenant, _)| tenant.0.as_str())
            .collect();
        tenants.sort_unstable();
        tenants.dedup();

        let keys: Vec<&str> = order_keys.iter().map(|(_, key)| key.as_str()).collect();
        let token_values: Vec<&str> = tokens.iter().map(|(_, token)| token.as_str()).collect();

        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT tenant, order_key, alt_order_key, checkout_token, event_type,
                        origin_host, client_ts, received_ts, key_match, consent, trust_level
                 FROM pixel_receipts
                 WHERE tenant = ANY($1)
                   AND (order_key = ANY($2) OR alt_order_key = ANY($2)
                        OR checkout_token = ANY($3))",
                &[&tenants, &keys, &token_values],
            )
            .await
            .map_err(db_err)?;

        rows.iter().map(Self::receipt_from_row).collect()
    }

    async fn receipts_in_window(
        &self,
        tenant: &TenantId,
        center: u64,
        window_secs: u64,
        limit: usize,
    ) -> Result<Vec<Receipt>, StoreError> {
        let lower = center.saturating_sub(window_secs) as i64;
        let upper = center.saturating_add(window_secs) as i64;
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT tenant, order_key, alt_order_key, checkout_token, event_type,
                        origin_host, client_ts, received_ts, key_match, consent, trust_level
                 FROM pixel_receipts
                 WHERE tenant = $1 AND received_ts BETWEEN $2 AND $3
                 ORDER BY received_ts DESC
                 LIMIT $4",
                &[&tenant.0, &lower, &upper, &(limit as i64)],
            )
            .await
            .map_err(db_err)?;

        rows.iter().map(Self::receipt_from_row).collect()
    }

    async fn set_receipt_trust(
        &self,
        tenant: &TenantId,
        order_key: &str,
        level: TrustLevel,
    ) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        client
            .execute(
                "UPDATE pixel_receipts SET trust_level = $3
                 WHERE tenant = $1 AND order_key = $2",
                &[&tenant.0, &order_key, &level.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn shop_config(&self, tenant: &TenantId) -> Result<Option<ShopConfig>, StoreError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT config FROM shop_configs WHERE tenant = $1",
                &[&tenant.0],
            )
            .await
            .map_err(db_err)?;

        row.map(|row| {
            let config: serde_json::Value = row.try_get("config").map_err(db_err)?;
            serde_json::from_value(config)
                .map_err(|e| StoreError::Query(format!("bad shop config: {e}")))
        })
        .transpose()
    }
}

#[cfg(feature = "postgres")]
async fn apply_update_sql(
    executor: &impl GenericClient,
    update: &JobUpdate,
) -> Result<(), StoreError> {
    let platform_results = serde_json::to_value(&update.platform_results)
        .map_err(|e| StoreError::Query(format!("platform results serialization failed: {e}")))?;
    let trust_metadata = update
        .trust_metadata
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Query(format!("trust metadata serialization failed: {e}")))?;
    let consent_evidence = update
        .consent_evidence
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Query(format!("consent serialization failed: {e}")))?;

    executor
        .execute(
            "UPDATE conversion_jobs
             SET status = $2, attempts = $3, last_attempt_at = $4, next_retry_at = $5,
                 processed_at = $6, completed_at = $7, error_message = $8,
                 platform_results = $9, trust_metadata = $10, consent_evidence = $11
             WHERE id = $1",
            &[
                &(update.id.0 as i64),
                &update.status.as_str(),
                &(update.attempts as i32),
                &update.last_attempt_at.map(|v| v as i64),
                &update.next_retry_at.map(|v| v as i64),
                &update.processed_at.map(|v| v as i64),
                &update.completed_at.map(|v| v as i64),
                &update.error_message,
                &platform_results,
                &trust_metadata,
                &consent_evidence,
            ],
        )
        .await
        .map_err(db_err)?;
    Ok(())
}
