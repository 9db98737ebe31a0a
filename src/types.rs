use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Tenant (shop) identifier.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of tenant identifiers with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// Order identifier assigned by the commerce platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

/// Logical identifier for an advertising platform destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformKey(pub String);

impl PlatformKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Row identity of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

/// Lifecycle status of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    DeadLetter,
    LimitExceeded,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLetter => "dead_letter",
            JobStatus::LimitExceeded => "limit_exceeded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "dead_letter" => Some(JobStatus::DeadLetter),
            "limit_exceeded" => Some(JobStatus::LimitExceeded),
            _ => None,
        }
    }
}

/// Pre-hashed customer identifiers forwarded to destination platforms.
///
/// Raw identifiers never enter this pipeline; hashing happens upstream
/// at the intake boundary. Values are lowercase hex SHA-256 digests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedIdentifiers {
    pub email_sha256: Option<String>,
    pub phone_sha256: Option<String>,
}

impl HashedIdentifiers {
    fn digest_ok(value: &str) -> bool {
        value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// True when every present identifier looks like a SHA-256 hex digest.
    pub fn is_valid(&self) -> bool {
        self.email_sha256.as_deref().map_or(true, Self::digest_ok)
            && self.phone_sha256.as_deref().map_or(true, Self::digest_ok)
    }
}

/// A single purchased line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    pub title: Option<String>,
    pub quantity: u32,
    pub price: f64,
}

/// Order event carried by a conversion job.
///
/// A tagged sum over the event kinds this pipeline understands, with
/// explicit fields. Validated once at the queue-write boundary via
/// [`OrderEvent::validate`]; read sites can rely on the shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OrderEvent {
    Purchase {
        checkout_token: Option<String>,
        line_items: Vec<LineItem>,
        customer: HashedIdentifiers,
    },
    Refund {
        checkout_token: Option<String>,
        reason: Option<String>,
    },
}

impl OrderEvent {
    /// Event kind tag used in destination event ids and payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            OrderEvent::Purchase { .. } => "purchase",
            OrderEvent::Refund { .. } => "refund",
        }
    }

    /// Checkout token recorded with the notification, if any.
    pub fn checkout_token(&self) -> Option<&str> {
        match self {
            OrderEvent::Purchase { checkout_token, .. }
            | OrderEvent::Refund { checkout_token, .. } => checkout_token.as_deref(),
        }
    }

    /// Validate the event shape before it is written to the queue.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            OrderEvent::Purchase { line_items, customer, .. } => {
                if line_items.is_empty() {
                    return Err("purchase event has no line items".to_string());
                }
                for item in line_items {
                    if item.product_id.is_empty() {
                        return Err("line item missing product id".to_string());
                    }
                    if item.quantity == 0 {
                        return Err("line item quantity is zero".to_string());
                    }
                    if !item.price.is_finite() || item.price < 0.0 {
                        return Err("line item price is not a valid amount".to_string());
                    }
                }
                if !customer.is_valid() {
                    return Err("customer identifiers are not sha256 hex digests".to_string());
                }
                Ok(())
            }
            OrderEvent::Refund { .. } => Ok(()),
        }
    }
}

/// One conversion job per (tenant, order).
///
/// Created on notification receipt (upsert keyed by tenant + order id, so
/// re-delivery updates rather than duplicates), mutated only by the claim
/// operation and the per-job finalize step. Never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionJob {
    pub id: JobId,
    pub tenant: TenantId,
    pub order_id: OrderId,
    pub order_number: String,
    pub value: f64,
    pub currency: String,
    pub event: OrderEvent,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: u64,
    pub last_attempt_at: Option<u64>,
    pub next_retry_at: Option<u64>,
    pub processed_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error_message: Option<String>,
    /// Per-destination outcome: `sent`, `skipped:<reason>` or `failed:<reason>`.
    pub platform_results: HashMap<PlatformKey, String>,
    pub trust_metadata: Option<TrustSummary>,
    pub consent_evidence: Option<ConsentState>,
}

/// Input for creating (or re-delivering) a conversion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConversionJob {
    pub tenant: TenantId,
    pub order_id: OrderId,
    pub order_number: String,
    pub value: f64,
    pub currency: String,
    pub event: OrderEvent,
    pub max_attempts: u32,
}

/// Finalized per-job state written back after a processing pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobUpdate {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<u64>,
    pub next_retry_at: Option<u64>,
    pub processed_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error_message: Option<String>,
    pub platform_results: HashMap<PlatformKey, String>,
    pub trust_metadata: Option<TrustSummary>,
    pub consent_evidence: Option<ConsentState>,
}

/// Client-side event record, written by the ingestion path and read here.
///
/// At most one purchase receipt is authoritative per (tenant, order key);
/// matching may also go through the alternate key or the checkout token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub tenant: TenantId,
    pub order_key: String,
    pub alt_order_key: Option<String>,
    pub checkout_token: Option<String>,
    pub event_type: String,
    pub origin_host: Option<String>,
    /// Timestamp recorded in the customer's browser (epoch seconds).
    pub client_ts: u64,
    /// Timestamp the server recorded the receipt (epoch seconds).
    pub received_ts: u64,
    /// Whether the receipt's signature matched a known key at ingestion.
    pub key_match: bool,
    pub consent: Option<serde_json::Value>,
    pub trust_level: Option<TrustLevel>,
}

/// Status of a per-notification lock row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Processing,
    Processed,
    Failed,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Processing => "processing",
            LockStatus::Processed => "processed",
            LockStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(LockStatus::Processing),
            "processed" => Some(LockStatus::Processed),
            "failed" => Some(LockStatus::Failed),
            _ => None,
        }
    }
}

/// Distributed mutex row over (tenant, notification id, topic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLock {
    pub tenant: TenantId,
    pub notification_id: String,
    pub topic: String,
    pub status: LockStatus,
    pub received_at: u64,
    pub processed_at: Option<u64>,
}

/// Trust verdict level, ordered from least to most trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    Partial,
    Trusted,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Partial => "partial",
            TrustLevel::Trusted => "trusted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "untrusted" => Some(TrustLevel::Untrusted),
            "partial" => Some(TrustLevel::Partial),
            "trusted" => Some(TrustLevel::Trusted),
            _ => None,
        }
    }

    /// Numeric rank for threshold comparisons.
    pub fn rank(&self) -> u8 {
        match self {
            TrustLevel::Untrusted => 0,
            TrustLevel::Partial => 1,
            TrustLevel::Trusted => 2,
        }
    }
}

/// Fixed vocabulary of trust outcomes, stored and aggregated downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustReason {
    NoReceipt,
    TokenMismatch,
    KeyMismatch,
    OriginInvalid,
    Stale,
    Ok,
}

impl TrustReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustReason::NoReceipt => "no_receipt",
            TrustReason::TokenMismatch => "token_mismatch",
            TrustReason::KeyMismatch => "key_mismatch",
            TrustReason::OriginInvalid => "origin_invalid",
            TrustReason::Stale => "stale",
            TrustReason::Ok => "ok",
        }
    }
}

/// Transient trust verdict produced fresh on every evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustResult {
    pub trusted: bool,
    pub level: TrustLevel,
    pub reason: TrustReason,
    pub details: Option<String>,
}

/// Persisted summary of a trust evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustSummary {
    pub level: TrustLevel,
    pub reason: TrustReason,
    pub token_match: bool,
    pub key_match: bool,
    pub origin_valid: bool,
    pub within_time_bounds: bool,
}

/// Parsed consent flags from a receipt's consent payload.
///
/// Absence of a field means "no signal", never "false".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentState {
    pub marketing: Option<bool>,
    pub analytics: Option<bool>,
    pub sale_of_data_allowed: Option<bool>,
}

/// Consent category a destination falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentCategory {
    Marketing,
    Analytics,
}

/// Shop-level policy for trust and consent gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Untrusted events never reach marketing destinations; consent must
    /// always be explicit.
    Strict,
    /// Partial trust suffices for marketing; a verified receipt may imply
    /// consent for a category with no explicit signal.
    Balanced,
}

/// Per-destination configuration held by a shop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub platform: PlatformKey,
    pub category: ConsentCategory,
    /// Evaluate this destination under marketing rules regardless of its
    /// declared category.
    pub treat_as_marketing: bool,
    /// Encrypted credential blob, resolved through a `CredentialResolver`.
    pub credentials: String,
    pub enabled: bool,
}

impl PlatformConfig {
    pub fn effective_category(&self) -> ConsentCategory {
        if self.treat_as_marketing {
            ConsentCategory::Marketing
        } else {
            self.category
        }
    }
}

/// Per-tenant shop context: domains for origin validation, gating strategy
/// and the set of configured destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopConfig {
    pub tenant: TenantId,
    pub primary_domain: Option<String>,
    pub storefront_domains: Vec<String>,
    pub default_domain: Option<String>,
    pub strategy: Strategy,
    pub platforms: Vec<PlatformConfig>,
}

impl ShopConfig {
    /// Case-insensitive membership test against the shop's domain allow-list.
    pub fn allows_origin(&self, host: &str) -> bool {
        let host = host.trim().to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }
        self.primary_domain
            .iter()
            .chain(self.storefront_domains.iter())
            .chain(self.default_domain.iter())
            .any(|d| d.eq_ignore_ascii_case(&host))
    }
}

/// Canonical conversion payload handed to destination adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionPayload {
    /// Deterministic destination-scoped event id. Stable across re-delivery
    /// so downstream platforms can deduplicate.
    pub event_id: String,
    pub event_type: String,
    pub tenant: TenantId,
    pub order_id: OrderId,
    pub order_number: String,
    pub value: f64,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub customer: HashedIdentifiers,
}

/// Current epoch time in seconds.
pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purchase(items: Vec<LineItem>) -> OrderEvent {
        OrderEvent::Purchase {
            checkout_token: Some("tok_1".to_string()),
            line_items: items,
            customer: HashedIdentifiers::default(),
        }
    }

    #[test]
    fn purchase_without_line_items_is_rejected() {
        let event = purchase(vec![]);
        assert!(event.validate().is_err());
    }

    #[test]
    fn purchase_with_zero_quantity_is_rejected() {
        let event = purchase(vec![LineItem {
            product_id: "sku-1".to_string(),
            title: None,
            quantity: 0,
            price: 10.0,
        }]);
        assert!(event.validate().is_err());
    }

    #[test]
    fn valid_purchase_passes_validation() {
        let event = purchase(vec![LineItem {
            product_id: "sku-1".to_string(),
            title: Some("Widget".to_string()),
            quantity: 2,
            price: 19.99,
        }]);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn hashed_identifiers_must_be_hex_digests() {
        let bad = HashedIdentifiers {
            email_sha256: Some("plain@example.com".to_string()),
            phone_sha256: None,
        };
        assert!(!bad.is_valid());

        let good = HashedIdentifiers {
            email_sha256: Some("a".repeat(64)),
            phone_sha256: None,
        };
        assert!(good.is_valid());
    }

    #[test]
    fn origin_allow_list_is_case_insensitive() {
        let shop = ShopConfig {
            tenant: TenantId("shop-1".to_string()),
            primary_domain: Some("shop.example".to_string()),
            storefront_domains: vec!["store.example".to_string()],
            default_domain: Some("shop-1.myshopify.com".to_string()),
            strategy: Strategy::Strict,
            platforms: vec![],
        };

        assert!(shop.allows_origin("SHOP.example"));
        assert!(shop.allows_origin("store.example"));
        assert!(!shop.allows_origin("evil.example"));
        assert!(!shop.allows_origin(""));
    }
}
