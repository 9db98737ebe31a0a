use std::collections::HashMap;

use crate::error::StoreError;
use crate::storage::Storage;
use crate::types::{ConversionJob, Receipt, TenantId};

/// Constant-time byte comparison for checkout tokens and order keys.
///
/// Length is public; contents are not. The whole input is always folded
/// so equal-length comparisons take the same time regardless of where
/// the first difference sits.
pub(crate) fn ct_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Tuning for the fuzzy receipt-match fallback.
///
/// The fallback is best-effort: a checkout token recorded client-side and
/// an order id assigned server-side are correlated asynchronously and may
/// not be indexed together at match time. Window and candidate count stay
/// small on purpose.
#[derive(Debug, Clone)]
pub struct ReceiptMatchConfig {
    pub fuzzy_window_secs: u64,
    pub fuzzy_candidate_limit: usize,
}

impl Default for ReceiptMatchConfig {
    fn default() -> Self {
        Self {
            fuzzy_window_secs: 3_600,
            fuzzy_candidate_limit: 25,
        }
    }
}

/// Receipts for one claimed batch, prefetched in a single store read and
/// indexed twice for O(1) lookups: by (tenant, order key) and by
/// (tenant, checkout token).
#[derive(Debug, Default)]
pub struct ReceiptIndex {
    by_order: HashMap<(String, String), Receipt>,
    by_token: HashMap<(String, String), Receipt>,
}

impl ReceiptIndex {
    /// One query across all tenants, order ids and checkout tokens present
    /// in the batch; never one query per job.
    pub async fn batch_fetch(
        storage: &dyn Storage,
        jobs: &[ConversionJob],
    ) -> Result<Self, StoreError> {
        let mut order_keys = Vec::with_capacity(jobs.len());
        let mut tokens = Vec::new();
        for job in jobs {
            order_keys.push((job.tenant.clone(), job.order_id.0.clone()));
            if let Some(token) = job.event.checkout_token() {
                tokens.push((job.tenant.clone(), token.to_string()));
            }
        }

        let receipts = storage.receipts_by_keys(&order_keys, &tokens).await?;

        let mut index = Self::default();
        for receipt in receipts {
            index.insert(receipt);
        }
        Ok(index)
    }

    fn insert(&mut self, receipt: Receipt) {
        let tenant = receipt.tenant.0.clone();

        // Purchase receipts are authoritative; never displace one with a
        // receipt of another event type for the same key.
        let prefer = |slot: &mut HashMap<(String, String), Receipt>, key: (String, String), r: &Receipt| {
            match slot.get(&key) {
                Some(existing) if existing.event_type == "purchase" => {}
                _ => {
                    slot.insert(key, r.clone());
                }
            }
        };

        prefer(
            &mut self.by_order,
            (tenant.clone(), receipt.order_key.clone()),
            &receipt,
        );
        if let Some(alt) = &receipt.alt_order_key {
            prefer(&mut self.by_order, (tenant.clone(), alt.clone()), &receipt);
        }
        if let Some(token) = &receipt.checkout_token {
            prefer(&mut self.by_token, (tenant, token.clone()), &receipt);
        }
    }

    pub fn lookup_order(&self, tenant: &TenantId, order_key: &str) -> Option<&Receipt> {
        self.by_order.get(&(tenant.0.clone(), order_key.to_string()))
    }

    pub fn lookup_token(&self, tenant: &TenantId, token: &str) -> Option<&Receipt> {
        self.by_token.get(&(tenant.0.clone(), token.to_string()))
    }

    /// Find the receipt for a job: exact order-key match, then checkout
    /// token, then the time-windowed fuzzy fallback against the store.
    pub async fn find_for_job(
        &self,
        storage: &dyn Storage,
        tenant: &TenantId,
        order_id: &str,
        checkout_token: Option<&str>,
        created_at: u64,
        config: &ReceiptMatchConfig,
    ) -> Result<Option<Receipt>, StoreError> {
        if let Some(receipt) = self.lookup_order(tenant, order_id) {
            return Ok(Some(receipt.clone()));
        }

        if let Some(token) = checkout_token {
            if let Some(receipt) = self.lookup_token(tenant, token) {
                return Ok(Some(receipt.clone()));
            }
        }

        let candidates = storage
            .receipts_in_window(
                tenant,
                created_at,
                config.fuzzy_window_secs,
                config.fuzzy_candidate_limit,
            )
            .await?;

        for candidate in candidates {
            if ct_eq(&candidate.order_key, order_id) {
                return Ok(Some(candidate));
            }
            if candidate
                .alt_order_key
                .as_deref()
                .map_or(false, |alt| ct_eq(alt, order_id))
            {
                return Ok(Some(candidate));
            }
            if let (Some(token), Some(candidate_token)) =
                (checkout_token, candidate.checkout_token.as_deref())
            {
                if ct_eq(candidate_token, token) {
                    return Ok(Some(candidate));
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::{HashedIdentifiers, JobId, JobStatus, LineItem, OrderEvent, OrderId};

    fn receipt(tenant: &str, order_key: &str, token: Option<&str>, received_ts: u64) -> Receipt {
        Receipt {
            tenant: TenantId(tenant.to_string()),
            order_key: order_key.to_string(),
            alt_order_key: None,
            checkout_token: token.map(str::to_string),
            event_type: "purchase".to_string(),
            origin_host: Some("shop.example".to_string()),
            client_ts: received_ts,
            received_ts,
            key_match: true,
            consent: None,
            trust_level: None,
        }
    }

    fn job(tenant: &str, order: &str, token: Option<&str>, created_at: u64) -> ConversionJob {
        ConversionJob {
            id: JobId(1),
            tenant: TenantId(tenant.to_string()),
            order_id: OrderId(order.to_string()),
            order_number: format!("#{order}"),
            value: 10.0,
            currency: "USD".to_string(),
            event: OrderEvent::Purchase {
                checkout_token: token.map(str::to_string),
                line_items: vec![LineItem {
                    product_id: "sku".to_string(),
                    title: None,
                    quantity: 1,
                    price: 10.0,
                }],
                customer: HashedIdentifiers::default(),
            },
            status: JobStatus::Processing,
            attempts: 0,
            max_attempts: 3,
            created_at,
            last_attempt_at: None,
            next_retry_at: None,
            processed_at: None,
            completed_at: None,
            error_message: None,
            platform_results: HashMap::new(),
            trust_metadata: None,
            consent_evidence: None,
        }
    }

    #[test]
    fn ct_eq_matches_equal_strings_only() {
        assert!(ct_eq("tok_abc", "tok_abc"));
        assert!(!ct_eq("tok_abc", "tok_abd"));
        assert!(!ct_eq("tok_abc", "tok_ab"));
        assert!(ct_eq("", ""));
    }

    #[tokio::test]
    async fn batch_fetch_indexes_by_order_and_token() {
        let storage = InMemoryStorage::new();
        storage.insert_receipt(receipt("shop-1", "1001", Some("tok_a"), 500)).await;
        storage.insert_receipt(receipt("shop-1", "1002", None, 510)).await;

        let jobs = vec![
            job("shop-1", "1001", Some("tok_a"), 520),
            job("shop-1", "1002", None, 520),
        ];
        let index = ReceiptIndex::batch_fetch(&storage, &jobs).await.unwrap();

        let tenant = TenantId("shop-1".to_string());
        assert!(index.lookup_order(&tenant, "1001").is_some());
        assert!(index.lookup_order(&tenant, "1002").is_some());
        assert!(index.lookup_token(&tenant, "tok_a").is_some());
        assert!(index.lookup_order(&tenant, "9999").is_none());
    }

    #[tokio::test]
    async fn token_lookup_covers_order_id_mismatch() {
        let storage = InMemoryStorage::new();
        // Receipt recorded under the checkout token before the server-side
        // order id existed.
        storage
            .insert_receipt(receipt("shop-1", "checkout-77", Some("tok_x"), 500))
            .await;

        let jobs = vec![job("shop-1", "1001", Some("tok_x"), 520)];
        let index = ReceiptIndex::batch_fetch(&storage, &jobs).await.unwrap();

        let found = index
            .find_for_job(
                &storage,
                &TenantId("shop-1".to_string()),
                "1001",
                Some("tok_x"),
                520,
                &ReceiptMatchConfig::default(),
            )
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn fuzzy_fallback_finds_receipt_in_window() {
        let storage = InMemoryStorage::new();
        let tenant = TenantId("shop-1".to_string());
        storage
            .insert_receipt(receipt("shop-1", "1001", Some("tok_y"), 1_000))
            .await;

        // Empty prefetch index forces the fuzzy path.
        let index = ReceiptIndex::default();
        let found = index
            .find_for_job(
                &storage,
                &tenant,
                "wrong-key",
                Some("tok_y"),
                1_800,
                &ReceiptMatchConfig::default(),
            )
            .await
            .unwrap();
        assert!(found.is_some());

        // Outside the window there is nothing to find.
        let missed = index
            .find_for_job(
                &storage,
                &tenant,
                "wrong-key",
                Some("tok_y"),
                10_000,
                &ReceiptMatchConfig::default(),
            )
            .await
            .unwrap();
        assert!(missed.is_none());
    }

    #[tokio::test]
    async fn fuzzy_fallback_respects_candidate_limit() {
        let storage = InMemoryStorage::new();
        let tenant = TenantId("shop-1".to_string());
        for i in 0..30 {
            storage
                .insert_receipt(receipt("shop-1", &format!("other-{i}"), None, 2_000 + i))
                .await;
        }
        // The matching receipt is the oldest; with newest-first ordering and
        // a tiny limit it falls outside the candidate set.
        storage
            .insert_receipt(receipt("shop-1", "target", Some("tok_z"), 1_500))
            .await;

        let index = ReceiptIndex::default();
        let config = ReceiptMatchConfig {
            fuzzy_window_secs: 3_600,
            fuzzy_candidate_limit: 5,
        };
        let found = index
            .find_for_job(&storage, &tenant, "target", Some("tok_z"), 2_000, &config)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn receipts_do_not_leak_across_tenants() {
        let storage = InMemoryStorage::new();
        storage.insert_receipt(receipt("shop-2", "1001", Some("tok_a"), 500)).await;

        let jobs = vec![job("shop-1", "1001", Some("tok_a"), 520)];
        let index = ReceiptIndex::batch_fetch(&storage, &jobs).await.unwrap();
        assert!(index.lookup_order(&TenantId("shop-1".to_string()), "1001").is_none());
    }
}
