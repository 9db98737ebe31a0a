//! Trust-gated delivery of e-commerce conversion events to advertising
//! platforms' server-side APIs.
//!
//! This crate implements the **delivery core**: a durable job queue with
//! atomic claiming, per-notification idempotency locks, receipt-based
//! provenance checks, a trust + consent decision model, concurrent
//! per-destination dispatch, and adaptive retry/backoff.
//!
//! ## Guarantees
//! - At-least-once delivery with deterministic destination event ids
//! - Notification-level deduplication across concurrent instances
//! - No job is silently dropped; every outcome is persisted
//! - Consent opt-outs block delivery regardless of trust
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Sub-second delivery latency
//! - Cross-tenant batching beyond simple chunking
//!
//! The HTTP intake layer, schema migrations, report generation and GDPR
//! tooling live outside this crate; it consumes notifications and a
//! relational store, and produces per-destination outcomes.

mod backoff;
mod dispatcher;
mod error;
mod lock;
mod platforms;
mod receipts;
mod storage;
mod trust;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use backoff::{BatchBackoff, BatchBackoffConfig, JitterProfile, RetryPolicy};
pub use dispatcher::{BatchReport, Pipeline, PipelineConfig};
pub use error::{CredentialError, ErrorClass, PipelineError, SendFailure, StoreError};
pub use lock::{Acquire, IdempotencyGate, LockConfig};
pub use platforms::{
    build_payload, conversion_event_id, CredentialResolver, Credentials, Destination,
    DestinationRegistry, GoogleAds, MetaCapi, PlaintextCredentials, TiktokEvents,
};
pub use receipts::{ReceiptIndex, ReceiptMatchConfig};
pub use storage::{InMemoryStorage, Storage};
pub use trust::{
    check_platform_eligibility, evaluate_trust, parse_consent, Eligibility, TrustConfig,
    TrustEvaluation,
};
pub use types::{
    ConsentCategory, ConsentState, ConversionJob, ConversionPayload, HashedIdentifiers, JobId,
    JobStatus, JobUpdate, LineItem, LockStatus, NewConversionJob, OrderEvent, OrderId,
    PlatformConfig, PlatformKey, Receipt, ShopConfig, Strategy, TenantId, TrustLevel, TrustReason,
    TrustResult, TrustSummary, WebhookLock,
};
pub use worker::{JobOutcome, JobProcessor};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
