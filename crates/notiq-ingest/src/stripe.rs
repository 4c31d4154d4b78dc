//! Stripe webhook adapter.
//!
//! Stripe signs `"{timestamp}.{body}"` with HMAC-SHA256 and sends the
//! result in a `Stripe-Signature` header of the form
//! `t=<unix>,v1=<hex>[,v1=<hex>...]`. The timestamp is checked against a
//! replay tolerance window before any digest comparison.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use http::HeaderMap;
use notiq_core::{
    Amount, CanonicalEvent, Clock, CustomerData, EventKind, IngestError, Provider, Result,
    SubscriptionData,
};
use serde_json::Value;
use tracing::debug;

use crate::{
    adapter::{Capability, Parsed, SourceAdapter},
    crypto::{hmac_sha256_hex, timing_safe_eq},
};

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Replay tolerance for the signature timestamp.
const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Adapter for Stripe payment webhooks.
pub struct StripeAdapter {
    clock: Arc<dyn Clock>,
    tolerance: Duration,
}

impl StripeAdapter {
    /// Creates the adapter with the default 5-minute replay tolerance.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, tolerance: DEFAULT_TOLERANCE }
    }

    /// Overrides the replay tolerance window.
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }
}

/// Parsed `Stripe-Signature` header.
struct SignatureElements {
    timestamp: i64,
    v1_signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> Option<SignatureElements> {
    let mut timestamp = None;
    let mut v1_signatures = Vec::new();

    for element in header.split(',') {
        match element.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => v1_signatures.push(value.to_string()),
            _ => {},
        }
    }

    let timestamp = timestamp?;
    if v1_signatures.is_empty() {
        return None;
    }
    Some(SignatureElements { timestamp, v1_signatures })
}

fn map_event_type(event_type: &str) -> EventKind {
    match event_type {
        "invoice.payment_succeeded" | "invoice.paid" => EventKind::PaymentSuccess,
        "invoice.payment_failed" => EventKind::PaymentFailure,
        "customer.subscription.created" => EventKind::SubscriptionCreated,
        "customer.subscription.deleted" => EventKind::SubscriptionCancelled,
        "customer.subscription.trial_will_end" => EventKind::TrialEnding,
        "invoice.upcoming" => EventKind::SubscriptionRenewed,
        _ => EventKind::GenericUpdate,
    }
}

fn string_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl SourceAdapter for StripeAdapter {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    fn expected_content_type(&self) -> &'static str {
        "application/json"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::Validate,
            Capability::Parse,
            Capability::CustomerData,
            Capability::SubscriptionData,
        ]
    }

    fn validate(&self, body: &[u8], headers: &HeaderMap, secret: &str) -> bool {
        let Some(header) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
            debug!("stripe signature header missing");
            return false;
        };

        let Some(elements) = parse_signature_header(header) else {
            debug!("stripe signature header malformed");
            return false;
        };

        let age = (self.clock.now_utc().timestamp() - elements.timestamp).unsigned_abs();
        if age > self.tolerance.as_secs() {
            debug!(age_seconds = age, "stripe signature timestamp outside tolerance");
            return false;
        }

        let Ok(body_str) = std::str::from_utf8(body) else {
            return false;
        };
        let signed_payload = format!("{}.{body_str}", elements.timestamp);
        let expected = hmac_sha256_hex(signed_payload.as_bytes(), secret);

        elements.v1_signatures.iter().any(|sig| timing_safe_eq(sig, &expected))
    }

    fn parse(&self, body: &[u8], _headers: &HeaderMap) -> Result<Parsed> {
        let envelope: Value = serde_json::from_slice(body)
            .map_err(|e| IngestError::payload(format!("invalid JSON body: {e}")))?;
        if !envelope.is_object() {
            return Err(IngestError::payload("expected a JSON object"));
        }

        let event_type = envelope
            .get("type")
            .and_then(string_of)
            .ok_or_else(|| IngestError::payload("missing event type"))?;

        let external_id = envelope
            .get("id")
            .and_then(string_of)
            .ok_or_else(|| IngestError::payload("missing event id"))?;

        let object = envelope
            .get("data")
            .and_then(|d| d.get("object"))
            .filter(|o| o.is_object())
            .ok_or_else(|| IngestError::payload("missing data.object"))?;

        let kind = map_event_type(&event_type);

        let customer_id = object
            .get("customer")
            .and_then(string_of)
            .ok_or_else(|| IngestError::payload("missing customer reference"))?;

        let is_subscription_object =
            object.get("object").and_then(Value::as_str) == Some("subscription");

        // Invoices carry amount_due; subscription objects carry the plan
        // amount. Anything else stays unknown rather than guessing.
        let amount = if is_subscription_object {
            object
                .get("plan")
                .and_then(|p| p.get("amount"))
                .or_else(|| {
                    object
                        .get("items")
                        .and_then(|i| i.get("data"))
                        .and_then(|d| d.get(0))
                        .and_then(|f| f.get("plan"))
                        .and_then(|p| p.get("amount"))
                })
                .and_then(Value::as_i64)
                .map_or(Amount::Unknown, Amount::Cents)
        } else {
            object.get("amount_due").and_then(Value::as_i64).map_or(Amount::Unknown, Amount::Cents)
        };

        let currency = object
            .get("currency")
            .and_then(string_of)
            .map_or_else(|| "USD".to_string(), |c| c.to_ascii_uppercase());

        let occurred_at = envelope
            .get("created")
            .or_else(|| object.get("created"))
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| self.clock.now_utc());

        let email = object
            .get("customer_email")
            .and_then(string_of)
            .unwrap_or_default();

        let name = object.get("customer_name").and_then(string_of).unwrap_or_default();
        let (first_name, last_name) = match name.split_once(' ') {
            Some((first, last)) => (first.to_string(), last.to_string()),
            None => (name, String::new()),
        };

        let customer = CustomerData {
            external_customer_id: customer_id,
            email,
            first_name,
            last_name,
            company_name: String::new(),
            company_domain: None,
        };

        let subscription = if is_subscription_object {
            object.get("id").and_then(string_of).map(|id| SubscriptionData {
                id,
                status: object.get("status").and_then(string_of).unwrap_or_default(),
                plan_name: object
                    .get("plan")
                    .and_then(|p| p.get("nickname"))
                    .and_then(string_of)
                    .unwrap_or_default(),
                cancel_at_period_end: object
                    .get("cancel_at_period_end")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                previous_status: None,
            })
        } else {
            object.get("subscription").and_then(string_of).map(|id| SubscriptionData {
                id,
                status: String::new(),
                plan_name: String::new(),
                cancel_at_period_end: false,
                previous_status: None,
            })
        };

        let mut raw_metadata = BTreeMap::new();
        raw_metadata.insert("stripe_event_type".to_string(), event_type);
        if let Some(invoice_id) = object
            .get("object")
            .and_then(Value::as_str)
            .filter(|o| *o == "invoice")
            .and_then(|_| object.get("id"))
            .and_then(string_of)
        {
            raw_metadata.insert("invoice_id".to_string(), invoice_id);
        }
        if let Some(status) = object.get("status").and_then(string_of) {
            raw_metadata.insert("status".to_string(), status);
        }

        Ok(Parsed::Event(Box::new(CanonicalEvent {
            provider: Provider::Stripe,
            kind,
            customer,
            subscription,
            amount,
            currency,
            external_id,
            occurred_at,
            raw_metadata,
        })))
    }
}

#[cfg(test)]
mod tests {
    use notiq_core::TestClock;
    use serde_json::json;

    use super::*;

    fn adapter_with_clock() -> (StripeAdapter, TestClock) {
        let clock = TestClock::new();
        (StripeAdapter::new(Arc::new(clock.clone())), clock)
    }

    fn invoice_paid_body() -> Vec<u8> {
        json!({
            "id": "evt_1",
            "type": "invoice.payment_succeeded",
            "created": 1704067200,
            "data": {
                "object": {
                    "object": "invoice",
                    "id": "in_1",
                    "customer": "cus_1",
                    "customer_email": "jane@acme.io",
                    "customer_name": "Jane Doe",
                    "amount_due": 2999,
                    "currency": "usd",
                    "status": "paid",
                    "subscription": "sub_42"
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    fn sign(body: &[u8], secret: &str, timestamp: i64) -> HeaderMap {
        let signed = format!("{timestamp}.{}", std::str::from_utf8(body).expect("utf8 body"));
        let digest = hmac_sha256_hex(signed.as_bytes(), secret);
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            format!("t={timestamp},v1={digest}").parse().expect("header value"),
        );
        headers
    }

    #[test]
    fn validates_fresh_signature() {
        let (adapter, clock) = adapter_with_clock();
        let body = invoice_paid_body();
        let headers = sign(&body, "whsec_test", clock.now_utc().timestamp());
        assert!(adapter.validate(&body, &headers, "whsec_test"));
    }

    #[test]
    fn rejects_wrong_secret() {
        let (adapter, clock) = adapter_with_clock();
        let body = invoice_paid_body();
        let headers = sign(&body, "whsec_test", clock.now_utc().timestamp());
        assert!(!adapter.validate(&body, &headers, "whsec_other"));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let (adapter, clock) = adapter_with_clock();
        let body = invoice_paid_body();
        let headers = sign(&body, "whsec_test", clock.now_utc().timestamp() - 600);
        assert!(!adapter.validate(&body, &headers, "whsec_test"));
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        let (adapter, _clock) = adapter_with_clock();
        let body = invoice_paid_body();
        assert!(!adapter.validate(&body, &HeaderMap::new(), "whsec_test"));

        let mut headers = HeaderMap::new();
        headers.insert(SIGNATURE_HEADER, "v1=deadbeef".parse().expect("header value"));
        assert!(!adapter.validate(&body, &headers, "whsec_test"));
    }

    #[test]
    fn parses_invoice_payment_succeeded() {
        let (adapter, _clock) = adapter_with_clock();
        let body = invoice_paid_body();

        let Parsed::Event(event) = adapter.parse(&body, &HeaderMap::new()).expect("parse") else {
            panic!("expected event");
        };
        assert_eq!(event.kind, EventKind::PaymentSuccess);
        assert_eq!(event.amount, Amount::Cents(2999));
        assert_eq!(event.currency, "USD");
        assert_eq!(event.external_id, "evt_1");
        assert_eq!(event.customer.external_customer_id, "cus_1");
        assert_eq!(event.customer.first_name, "Jane");
        assert_eq!(event.subscription.expect("subscription data").id, "sub_42");
    }

    #[test]
    fn parses_subscription_created_with_plan_amount() {
        let (adapter, _clock) = adapter_with_clock();
        let body = json!({
            "id": "evt_2",
            "type": "customer.subscription.created",
            "created": 1704067200,
            "data": {
                "object": {
                    "object": "subscription",
                    "id": "sub_42",
                    "customer": "cus_1",
                    "status": "trialing",
                    "cancel_at_period_end": false,
                    "plan": {"amount": 4900, "nickname": "Scale Monthly"}
                }
            }
        })
        .to_string()
        .into_bytes();

        let Parsed::Event(event) = adapter.parse(&body, &HeaderMap::new()).expect("parse") else {
            panic!("expected event");
        };
        assert_eq!(event.kind, EventKind::SubscriptionCreated);
        assert_eq!(event.amount, Amount::Cents(4900));
        let sub = event.subscription.expect("subscription data");
        assert_eq!(sub.plan_name, "Scale Monthly");
        assert_eq!(sub.status, "trialing");
    }

    #[test]
    fn payment_failure_without_amount_is_unknown() {
        let (adapter, _clock) = adapter_with_clock();
        let body = json!({
            "id": "evt_3",
            "type": "invoice.payment_failed",
            "data": {"object": {"object": "invoice", "id": "in_2", "customer": "cus_1"}}
        })
        .to_string()
        .into_bytes();

        let Parsed::Event(event) = adapter.parse(&body, &HeaderMap::new()).expect("parse") else {
            panic!("expected event");
        };
        assert_eq!(event.kind, EventKind::PaymentFailure);
        assert_eq!(event.amount, Amount::Unknown);
    }

    #[test]
    fn unknown_event_type_falls_back_to_generic() {
        let (adapter, _clock) = adapter_with_clock();
        let body = json!({
            "id": "evt_4",
            "type": "charge.dispute.created",
            "data": {"object": {"customer": "cus_1"}}
        })
        .to_string()
        .into_bytes();

        let Parsed::Event(event) = adapter.parse(&body, &HeaderMap::new()).expect("parse") else {
            panic!("expected event");
        };
        assert_eq!(event.kind, EventKind::GenericUpdate);
    }

    #[test]
    fn missing_event_type_is_invalid() {
        let (adapter, _clock) = adapter_with_clock();
        let body = json!({"id": "evt_5", "data": {"object": {}}}).to_string().into_bytes();
        let err = adapter.parse(&body, &HeaderMap::new()).expect_err("should fail");
        assert!(matches!(err, IngestError::InvalidPayload { .. }));
    }
}
