//! Adapter contract shared by all providers.

use http::HeaderMap;
use notiq_core::{CanonicalEvent, Provider, Result};

/// What an adapter can do with a provider's payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Verifies webhook signatures.
    Validate,
    /// Parses payloads into canonical events.
    Parse,
    /// Extracts customer details from payloads.
    CustomerData,
    /// Extracts subscription details from payloads.
    SubscriptionData,
}

/// Outcome of parsing a webhook body.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// A real event to enqueue and process.
    Event(Box<CanonicalEvent>),
    /// A provider test ping; acknowledged with 200 but never enqueued.
    Test,
}

/// Contract each payment/e-commerce provider implements.
///
/// `validate` must use constant-time signature comparison and treat a
/// missing or malformed signature header as a plain `false`. `parse` must
/// tolerate missing optional fields by substituting documented defaults
/// (an absent amount becomes [`notiq_core::Amount::Unknown`]) and map
/// unrecognized provider event names onto the generic fallback kind.
pub trait SourceAdapter: Send + Sync {
    /// Which provider this adapter handles.
    fn provider(&self) -> Provider;

    /// Content type the provider sends; anything else is rejected with 415.
    fn expected_content_type(&self) -> &'static str;

    /// Capabilities this adapter supports.
    fn capabilities(&self) -> &'static [Capability];

    /// Verifies the webhook signature against the shared secret.
    fn validate(&self, body: &[u8], headers: &HeaderMap, secret: &str) -> bool;

    /// Parses the raw body into a canonical event.
    ///
    /// # Errors
    ///
    /// Returns [`notiq_core::IngestError::InvalidPayload`] when required
    /// fields are missing or the body cannot be decoded.
    fn parse(&self, body: &[u8], headers: &HeaderMap) -> Result<Parsed>;
}

/// Parses a decimal money string like `"29.99"` into cents.
///
/// Avoids float rounding by splitting on the decimal point. Returns `None`
/// for anything that is not a plain decimal number.
pub(crate) fn parse_decimal_cents(s: &str) -> Option<i64> {
    let s = s.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        return None;
    }

    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let frac_cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        2 => frac.parse().ok()?,
        // Truncate sub-cent precision.
        _ => frac.get(..2)?.parse().ok()?,
    };

    let cents = whole.checked_mul(100)?.checked_add(frac_cents)?;
    Some(if negative { -cents } else { cents })
}
