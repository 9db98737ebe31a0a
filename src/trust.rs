use crate::receipts::ct_eq;
use crate::types::{
    ConsentCategory, ConsentState, PlatformConfig, Receipt, ShopConfig, Strategy, TrustLevel,
    TrustReason, TrustResult, TrustSummary,
};

/// Time bounds for receipt trust.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    /// Maximum allowed skew between the receipt's client timestamp and the
    /// server receipt timestamp.
    pub max_clock_skew_secs: u64,
    /// Maximum receipt age at evaluation time.
    pub max_receipt_age_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 900,
            max_receipt_age_secs: 3_600,
        }
    }
}

/// Outcome of one trust evaluation: the verdict, its persistable summary
/// and the consent state parsed from the receipt.
#[derive(Debug, Clone)]
pub struct TrustEvaluation {
    pub result: TrustResult,
    pub summary: TrustSummary,
    pub consent: ConsentState,
}

/// Per-destination eligibility decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    pub allowed: bool,
    /// Normalized lowercase underscore-joined reason, suitable for storage
    /// and aggregation.
    pub skip_reason: Option<String>,
    /// Which consent signal carried the decision: `explicit` or `implied`.
    pub used_consent: Option<&'static str>,
}

impl Eligibility {
    fn allowed(used_consent: &'static str) -> Self {
        Self {
            allowed: true,
            skip_reason: None,
            used_consent: Some(used_consent),
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            skip_reason: Some(reason.into()),
            used_consent: None,
        }
    }
}

fn read_flag(value: &serde_json::Value, snake: &str, camel: &str) -> Option<bool> {
    value
        .get(snake)
        .or_else(|| value.get(camel))
        .and_then(serde_json::Value::as_bool)
}

/// Parse consent flags from a receipt's stored consent payload.
///
/// Unknown keys are ignored; absent fields stay `None`. The payload is
/// written client-side, so both snake_case and camelCase spellings occur.
pub fn parse_consent(payload: Option<&serde_json::Value>) -> ConsentState {
    let Some(value) = payload else {
        return ConsentState::default();
    };
    ConsentState {
        marketing: read_flag(value, "marketing", "marketing"),
        analytics: read_flag(value, "analytics", "analytics"),
        sale_of_data_allowed: read_flag(value, "sale_of_data_allowed", "saleOfDataAllowed"),
    }
}

/// Evaluate how much the pipeline trusts a (receipt, notification) pairing.
///
/// `trusted` requires all of: checkout token equality, signature key match,
/// origin host in the shop allow-list, and both time bounds. A receipt with
/// some passing signals is `partial`; anything else, including no receipt,
/// is `untrusted`.
pub fn evaluate_trust(
    receipt: Option<&Receipt>,
    webhook_checkout_token: Option<&str>,
    shop: &ShopConfig,
    config: &TrustConfig,
    now: u64,
) -> TrustEvaluation {
    let Some(receipt) = receipt else {
        let summary = TrustSummary {
            level: TrustLevel::Untrusted,
            reason: TrustReason::NoReceipt,
            token_match: false,
            key_match: false,
            origin_valid: false,
            within_time_bounds: false,
        };
        return TrustEvaluation {
            result: TrustResult {
                trusted: false,
                level: TrustLevel::Untrusted,
                reason: TrustReason::NoReceipt,
                details: Some("no client-side receipt recorded for this order".to_string()),
            },
            summary,
            consent: ConsentState::default(),
        };
    };

    let token_match = match (receipt.checkout_token.as_deref(), webhook_checkout_token) {
        (Some(a), Some(b)) => ct_eq(a, b),
        _ => false,
    };
    let key_match = receipt.key_match;
    let origin_valid = receipt
        .origin_host
        .as_deref()
        .map_or(false, |host| shop.allows_origin(host));

    let skew = receipt.client_ts.abs_diff(receipt.received_ts);
    let age = now.saturating_sub(receipt.received_ts);
    let within_time_bounds =
        skew <= config.max_clock_skew_secs && age <= config.max_receipt_age_secs;

    let passing = [token_match, key_match, origin_valid, within_time_bounds]
        .iter()
        .filter(|s| **s)
        .count();

    let level = if passing == 4 {
        TrustLevel::Trusted
    } else if passing > 0 {
        TrustLevel::Partial
    } else {
        TrustLevel::Untrusted
    };

    let (reason, details) = if level == TrustLevel::Trusted {
        (TrustReason::Ok, None)
    } else if !token_match {
        (
            TrustReason::TokenMismatch,
            Some("receipt checkout token does not match the notification".to_string()),
        )
    } else if !key_match {
        (
            TrustReason::KeyMismatch,
            Some("receipt signature did not match a known key".to_string()),
        )
    } else if !origin_valid {
        (
            TrustReason::OriginInvalid,
            receipt
                .origin_host
                .as_deref()
                .map(|h| format!("origin host not in allow list: {h}")),
        )
    } else {
        (
            TrustReason::Stale,
            Some(format!("receipt skew {skew}s, age {age}s")),
        )
    };

    TrustEvaluation {
        result: TrustResult {
            trusted: level == TrustLevel::Trusted,
            level,
            reason,
            details,
        },
        summary: TrustSummary {
            level,
            reason,
            token_match,
            key_match,
            origin_valid,
            within_time_bounds,
        },
        consent: parse_consent(receipt.consent.as_ref()),
    }
}

/// Minimum trust level a destination's consent category requires under a
/// given strategy.
fn required_trust(strategy: Strategy, category: ConsentCategory) -> TrustLevel {
    match (strategy, category) {
        (Strategy::Strict, ConsentCategory::Marketing) => TrustLevel::Trusted,
        (Strategy::Strict, ConsentCategory::Analytics) => TrustLevel::Partial,
        (Strategy::Balanced, ConsentCategory::Marketing) => TrustLevel::Partial,
        (Strategy::Balanced, ConsentCategory::Analytics) => TrustLevel::Untrusted,
    }
}

/// Decide whether an event may be forwarded to one destination.
///
/// Evaluated in strict order: the sale-of-data opt-out first (a legal
/// signal, not a trust signal; it blocks every destination regardless of
/// trust), then the trust gate, then the consent gate. An absent consent
/// signal is never treated as granted; only the balanced strategy may imply
/// consent, and only from a receipt that evaluated at least partial.
pub fn check_platform_eligibility(
    platform: &PlatformConfig,
    trust: &TrustResult,
    consent: &ConsentState,
    strategy: Strategy,
) -> Eligibility {
    if consent.sale_of_data_allowed == Some(false) {
        return Eligibility::denied("sale_of_data_opted_out");
    }

    let category = platform.effective_category();
    let required = required_trust(strategy, category);
    if trust.level.rank() < required.rank() {
        return Eligibility::denied(format!("trust_{}", trust.reason.as_str()));
    }

    let (flag, missing_reason) = match category {
        ConsentCategory::Marketing => (consent.marketing, "no_marketing_consent"),
        ConsentCategory::Analytics => (consent.analytics, "no_analytics_consent"),
    };

    match flag {
        Some(true) => Eligibility::allowed("explicit"),
        Some(false) => Eligibility::denied(missing_reason),
        None => {
            let implied = strategy == Strategy::Balanced
                && trust.level.rank() >= TrustLevel::Partial.rank();
            if implied {
                Eligibility::allowed("implied")
            } else {
                Eligibility::denied(missing_reason)
            }
        }
    }
}
