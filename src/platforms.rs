use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

#[cfg(not(feature = "http"))]
use std::time::Duration;
#[cfg(not(feature = "http"))]
use tokio::time::sleep;

use crate::error::{CredentialError, ErrorClass, SendFailure};
use crate::types::{ConsentCategory, ConversionJob, ConversionPayload, PlatformKey, TenantId};

/// Decrypted destination credentials as a flat field map.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    values: HashMap<String, String>,
}

impl Credentials {
    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    fn require(&self, field: &str) -> Result<&str, CredentialError> {
        self.get(field)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CredentialError::Invalid(format!("missing field: {field}")))
    }
}

/// Resolves a stored encrypted credential blob into usable credentials.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn decrypt(
        &self,
        blob: &str,
        platform: &PlatformKey,
    ) -> Result<Credentials, CredentialError>;
}

/// Resolver for deployments that store credential blobs as plain JSON
/// objects (tests, local development, stores with disk-level encryption).
#[derive(Default)]
pub struct PlaintextCredentials;

#[async_trait]
impl CredentialResolver for PlaintextCredentials {
    async fn decrypt(
        &self,
        blob: &str,
        _platform: &PlatformKey,
    ) -> Result<Credentials, CredentialError> {
        let values: HashMap<String, String> = serde_json::from_str(blob)
            .map_err(|e| CredentialError::DecryptFailed(e.to_string()))?;
        Ok(Credentials::from_map(values))
    }
}

/// Capability interface for one advertising platform.
///
/// One implementation per platform, resolved through the registry; the
/// pipeline never switches on platform names.
#[async_trait]
pub trait Destination: Send + Sync {
    fn key(&self) -> PlatformKey;

    /// Category the platform falls under when the shop does not override it.
    fn default_category(&self) -> ConsentCategory;

    /// Cheap structural check before any send is attempted.
    fn validate_credentials(&self, creds: &Credentials) -> Result<(), CredentialError>;

    /// Deliver one conversion event. The payload carries the deterministic
    /// event id; re-delivery produces the same id so the platform can
    /// deduplicate on its side.
    async fn send(&self, creds: &Credentials, payload: &ConversionPayload)
        -> Result<(), SendFailure>;

    /// Default HTTP status classification: rate limits and server errors
    /// retry, other client errors are permanent.
    fn classify_status(&self, status: u16) -> ErrorClass {
        match status {
            429 => ErrorClass::Retryable,
            500..=599 => ErrorClass::Retryable,
            _ => ErrorClass::Permanent,
        }
    }
}

/// Lookup table of registered destination adapters.
#[derive(Default)]
pub struct DestinationRegistry {
    destinations: HashMap<PlatformKey, Arc<dyn Destination>>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in platform adapters.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MetaCapi::new()));
        registry.register(Arc::new(GoogleAds::new()));
        registry.register(Arc::new(TiktokEvents::new()));
        registry
    }

    pub fn register(&mut self, destination: Arc<dyn Destination>) {
        self.destinations.insert(destination.key(), destination);
    }

    pub fn get(&self, key: &PlatformKey) -> Option<Arc<dyn Destination>> {
        self.destinations.get(key).cloned()
    }

    pub fn contains(&self, key: &PlatformKey) -> bool {
        self.destinations.contains_key(key)
    }
}

/// Deterministic destination-scoped event id.
///
/// Stable hash of order id, event kind, tenant and destination, so that
/// re-delivery of the same notification produces the same id.
pub fn conversion_event_id(
    tenant: &TenantId,
    order_id: &str,
    event_kind: &str,
    platform: &PlatformKey,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(order_id.as_bytes());
    hasher.update(b"|");
    hasher.update(event_kind.as_bytes());
    hasher.update(b"|");
    hasher.update(tenant.0.as_bytes());
    hasher.update(b"|");
    hasher.update(platform.0.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the canonical payload for one (job, destination) pairing.
pub fn build_payload(job: &ConversionJob, platform: &PlatformKey) -> ConversionPayload {
    let (line_items, customer) = match &job.event {
        crate::types::OrderEvent::Purchase { line_items, customer, .. } => {
            (line_items.clone(), customer.clone())
        }
        crate::types::OrderEvent::Refund { .. } => (Vec::new(), Default::default()),
    };

    ConversionPayload {
        event_id: conversion_event_id(&job.tenant, &job.order_id.0, job.event.kind(), platform),
        event_type: job.event.kind().to_string(),
        tenant: job.tenant.clone(),
        order_id: job.order_id.clone(),
        order_number: job.order_number.clone(),
        value: job.value,
        currency: job.currency.clone(),
        line_items,
        customer,
    }
}

#[cfg(feature = "http")]
async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    classify: impl Fn(u16) -> ErrorClass,
) -> Result<(), SendFailure> {
    let response = client.post(url).json(body).send().await;
    match response {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if resp.status().is_success() {
                Ok(())
            } else {
                let class = classify(status);
                let body = resp.text().await.unwrap_or_default();
                Err(SendFailure {
                    class,
                    status_code: Some(status),
                    message: truncate(&body, 512),
                })
            }
        }
        Err(err) if err.is_timeout() => Err(SendFailure::retryable("request timed out")),
        Err(err) => Err(SendFailure::retryable(err.to_string())),
    }
}

#[cfg(feature = "http")]
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

/// Simulated delivery used when the `http` feature is off.
#[cfg(not(feature = "http"))]
async fn simulated_send() -> Result<(), SendFailure> {
    sleep(Duration::from_millis(5)).await;
    Ok(())
}

/// Meta (Facebook) Conversions API.
pub struct MetaCapi {
    api_version: String,
    #[cfg(feature = "http")]
    client: reqwest::Client,
}

impl MetaCapi {
    pub fn new() -> Self {
        Self {
            api_version: "v19.0".to_string(),
            #[cfg(feature = "http")]
            client: reqwest::Client::new(),
        }
    }
}

impl Default for MetaCapi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for MetaCapi {
    fn key(&self) -> PlatformKey {
        PlatformKey::new("meta")
    }

    fn default_category(&self) -> ConsentCategory {
        ConsentCategory::Marketing
    }

    fn validate_credentials(&self, creds: &Credentials) -> Result<(), CredentialError> {
        creds.require("pixel_id")?;
        creds.require("access_token")?;
        Ok(())
    }

    async fn send(
        &self,
        creds: &Credentials,
        payload: &ConversionPayload,
    ) -> Result<(), SendFailure> {
        self.validate_credentials(creds)
            .map_err(|e| SendFailure::permanent(e.to_string()))?;

        #[cfg(feature = "http")]
        {
            let pixel_id = creds.require("pixel_id").map_err(|e| SendFailure::permanent(e.to_string()))?;
            let token = creds.require("access_token").map_err(|e| SendFailure::permanent(e.to_string()))?;
            let url = format!(
                "https://graph.facebook.com/{}/{}/events?access_token={}",
                self.api_version, pixel_id, token
            );
            let body = serde_json::json!({
                "data": [{
                    "event_name": "Purchase",
                    "event_id": payload.event_id,
                    "action_source": "website",
                    "user_data": {
                        "em": payload.customer.email_sha256,
                        "ph": payload.customer.phone_sha256,
                    },
                    "custom_data": {
                        "order_id": payload.order_id.0,
                        "value": payload.value,
                        "currency": payload.currency,
                        "contents": payload.line_items.iter().map(|item| serde_json::json!({
                            "id": item.product_id,
                            "quantity": item.quantity,
                            "item_price": item.price,
                        })).collect::<Vec<_>>(),
                    },
                }],
            });
            post_json(&self.client, &url, &body, |s| self.classify_status(s)).await
        }

        #[cfg(not(feature = "http"))]
        {
            let _ = payload;
            simulated_send().await
        }
    }
}

/// Google Ads offline conversion upload.
pub struct GoogleAds {
    #[cfg(feature = "http")]
    client: reqwest::Client,
}

impl GoogleAds {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "http")]
            client: reqwest::Client::new(),
        }
    }
}

impl Default for GoogleAds {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for GoogleAds {
    fn key(&self) -> PlatformKey {
        PlatformKey::new("google")
    }

    fn default_category(&self) -> ConsentCategory {
        ConsentCategory::Marketing
    }

    fn validate_credentials(&self, creds: &Credentials) -> Result<(), CredentialError> {
        creds.require("customer_id")?;
        creds.require("conversion_action")?;
        creds.require("access_token")?;
        Ok(())
    }

    async fn send(
        &self,
        creds: &Credentials,
        payload: &ConversionPayload,
    ) -> Result<(), SendFailure> {
        self.validate_credentials(creds)
            .map_err(|e| SendFailure::permanent(e.to_string()))?;

        #[cfg(feature = "http")]
        {
            let customer_id = creds.require("customer_id").map_err(|e| SendFailure::permanent(e.to_string()))?;
            let url = format!(
                "https://googleads.googleapis.com/v16/customers/{customer_id}:uploadClickConversions"
            );
            let body = serde_json::json!({
                "conversions": [{
                    "conversionAction": creds.get("conversion_action"),
                    "orderId": payload.order_id.0,
                    "conversionValue": payload.value,
                    "currencyCode": payload.currency,
                }],
                "partialFailure": true,
            });
            post_json(&self.client, &url, &body, |s| self.classify_status(s)).await
        }

        #[cfg(not(feature = "http"))]
        {
            let _ = payload;
            simulated_send().await
        }
    }
}

/// TikTok Events API.
pub struct TiktokEvents {
    #[cfg(feature = "http")]
    client: reqwest::Client,
}

impl TiktokEvents {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "http")]
            client: reqwest::Client::new(),
        }
    }
}

impl Default for TiktokEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for TiktokEvents {
    fn key(&self) -> PlatformKey {
        PlatformKey::new("tiktok")
    }

    fn default_category(&self) -> ConsentCategory {
        ConsentCategory::Marketing
    }

    fn validate_credentials(&self, creds: &Credentials) -> Result<(), CredentialError> {
        creds.require("pixel_code")?;
        creds.require("access_token")?;
        Ok(())
    }

    async fn send(
        &self,
        creds: &Credentials,
        payload: &ConversionPayload,
    ) -> Result<(), SendFailure> {
        self.validate_credentials(creds)
            .map_err(|e| SendFailure::permanent(e.to_string()))?;

        #[cfg(feature = "http")]
        {
            let url = "https://business-api.tiktok.com/open_api/v1.3/event/track/";
            let body = serde_json::json!({
                "event_source": "web",
                "event_source_id": creds.get("pixel_code"),
                "data": [{
                    "event": "CompletePayment",
                    "event_id": payload.event_id,
                    "properties": {
                        "order_id": payload.order_id.0,
                        "value": payload.value,
                        "currency": payload.currency,
                    },
                    "user": {
                        "email": payload.customer.email_sha256,
                        "phone": payload.customer.phone_sha256,
                    },
                }],
            });
            post_json(&self.client, url, &body, |s| self.classify_status(s)).await
        }

        #[cfg(not(feature = "http"))]
        {
            let _ = payload;
            simulated_send().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HashedIdentifiers, JobId, JobStatus, LineItem, OrderEvent, OrderId};

    fn job() -> ConversionJob {
        ConversionJob {
            id: JobId(1),
            tenant: TenantId("shop-1".to_string()),
            order_id: OrderId("1001".to_string()),
            order_number: "#1001".to_string(),
            value: 99.5,
            currency: "EUR".to_string(),
            event: OrderEvent::Purchase {
                checkout_token: Some("tok_a".to_string()),
                line_items: vec![LineItem {
                    product_id: "sku-1".to_string(),
                    title: None,
                    quantity: 1,
                    price: 99.5,
                }],
                customer: HashedIdentifiers::default(),
            },
            status: JobStatus::Processing,
            attempts: 0,
            max_attempts: 3,
            created_at: 0,
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
    fn event_id_is_deterministic_and_destination_scoped() {
        let tenant = TenantId("shop-1".to_string());
        let meta = PlatformKey::new("meta");
        let google = PlatformKey::new("google");

        let a = conversion_event_id(&tenant, "1001", "purchase", &meta);
        let b = conversion_event_id(&tenant, "1001", "purchase", &meta);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, conversion_event_id(&tenant, "1001", "purchase", &google));
        assert_ne!(a, conversion_event_id(&tenant, "1002", "purchase", &meta));
        assert_ne!(a, conversion_event_id(&tenant, "1001", "refund", &meta));
    }

    #[test]
    fn payload_carries_order_fields_and_event_id() {
        let payload = build_payload(&job(), &PlatformKey::new("meta"));
        assert_eq!(payload.order_id.0, "1001");
        assert_eq!(payload.currency, "EUR");
        assert_eq!(payload.event_type, "purchase");
        assert_eq!(payload.line_items.len(), 1);
        assert_eq!(
            payload.event_id,
            conversion_event_id(
                &TenantId("shop-1".to_string()),
                "1001",
                "purchase",
                &PlatformKey::new("meta"),
            )
        );
    }

    #[test]
    fn builtin_registry_resolves_known_platforms() {
        let registry = DestinationRegistry::with_builtin();
        assert!(registry.contains(&PlatformKey::new("meta")));
        assert!(registry.contains(&PlatformKey::new("google")));
        assert!(registry.contains(&PlatformKey::new("tiktok")));
        assert!(!registry.contains(&PlatformKey::new("pinterest")));
    }

    #[test]
    fn credential_validation_requires_fields() {
        let meta = MetaCapi::new();
        let empty = Credentials::default();
        assert!(meta.validate_credentials(&empty).is_err());

        let mut values = HashMap::new();
        values.insert("pixel_id".to_string(), "123".to_string());
        values.insert("access_token".to_string(), "tok".to_string());
        assert!(meta.validate_credentials(&Credentials::from_map(values)).is_ok());
    }

    #[test]
    fn status_classification_defaults() {
        let meta = MetaCapi::new();
        assert_eq!(meta.classify_status(429), ErrorClass::Retryable);
        assert_eq!(meta.classify_status(503), ErrorClass::Retryable);
        assert_eq!(meta.classify_status(400), ErrorClass::Permanent);
        assert_eq!(meta.classify_status(401), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn plaintext_resolver_parses_json_blobs() {
        let resolver = PlaintextCredentials;
        let creds = resolver
            .decrypt(r#"{"pixel_id":"123","access_token":"tok"}"#, &PlatformKey::new("meta"))
            .await
            .unwrap();
        assert_eq!(creds.get("pixel_id"), Some("123"));

        assert!(resolver.decrypt("not json", &PlatformKey::new("meta")).await.is_err());
    }
}
