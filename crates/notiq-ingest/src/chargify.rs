//! Chargify webhook adapter.
//!
//! Chargify posts form-encoded bodies with flattened keys like
//! `payload[subscription][customer][email]` and signs the raw body with
//! HMAC-SHA256, hex-encoded in `X-Chargify-Webhook-Signature-Hmac-Sha-256`.
//! Amounts are cents and always USD.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use notiq_core::{
    Amount, CanonicalEvent, CustomerData, EventKind, IngestError, Provider, Result,
    SubscriptionData,
};
use regex::Regex;
use tracing::debug;

use crate::{
    adapter::{Capability, Parsed, SourceAdapter},
    crypto::{hmac_sha256_hex, timing_safe_eq},
};

const SIGNATURE_HEADER: &str = "x-chargify-webhook-signature-hmac-sha-256";
const WEBHOOK_ID_HEADER: &str = "x-chargify-webhook-id";

/// Adapter for Chargify subscription billing webhooks.
pub struct ChargifyAdapter {
    order_ref_patterns: Vec<Regex>,
}

impl ChargifyAdapter {
    /// Creates the adapter, compiling the memo cross-reference patterns.
    pub fn new() -> Self {
        // Payment memos frequently reference the Shopify order the charge
        // settles; three patterns from most to least specific.
        let order_ref_patterns = [
            r"(?i)Shopify Order[^\d]*(\d+)",
            r"(?i)allocated to[^$]*?(\d+)",
            r"(?i)order[^\d]*(\d+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

        Self { order_ref_patterns }
    }

    /// Extracts a Shopify order reference from a transaction memo.
    fn shopify_order_ref(&self, memo: &str) -> Option<String> {
        if memo.is_empty() {
            return None;
        }
        self.order_ref_patterns
            .iter()
            .find_map(|re| re.captures(memo))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }
}

impl Default for ChargifyAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Form fields split by the flattened-key prefixes Chargify uses.
struct ChargifyFields {
    subscription: BTreeMap<String, String>,
    customer: BTreeMap<String, String>,
    transaction: BTreeMap<String, String>,
    top_level: BTreeMap<String, String>,
}

fn split_fields(data: Vec<(String, String)>) -> ChargifyFields {
    let mut fields = ChargifyFields {
        subscription: BTreeMap::new(),
        customer: BTreeMap::new(),
        transaction: BTreeMap::new(),
        top_level: BTreeMap::new(),
    };

    for (key, value) in data {
        if let Some(rest) = key.strip_prefix("payload[subscription][customer][") {
            fields.customer.insert(rest.trim_end_matches(']').to_string(), value);
        } else if let Some(rest) = key.strip_prefix("payload[subscription][product][") {
            let field = format!("product_{}", rest.trim_end_matches(']'));
            fields.subscription.insert(field, value);
        } else if let Some(rest) = key.strip_prefix("payload[subscription][") {
            fields.subscription.insert(rest.trim_end_matches(']').to_string(), value);
        } else if let Some(rest) = key.strip_prefix("payload[transaction][") {
            fields.transaction.insert(rest.trim_end_matches(']').to_string(), value);
        } else {
            fields.top_level.insert(key, value);
        }
    }

    fields
}

fn map_event_kind(event: &str, subscription_state: &str) -> EventKind {
    match event {
        "payment_success" | "renewal_success" => EventKind::PaymentSuccess,
        "payment_failure" | "renewal_failure" => EventKind::PaymentFailure,
        "signup_success" => EventKind::SubscriptionCreated,
        "subscription_state_change" => match subscription_state {
            "canceled" | "cancelled" => EventKind::SubscriptionCancelled,
            "active" => EventKind::SubscriptionRenewed,
            "trial_ended" | "trialing" => EventKind::TrialEnding,
            _ => EventKind::GenericUpdate,
        },
        _ => EventKind::GenericUpdate,
    }
}

impl SourceAdapter for ChargifyAdapter {
    fn provider(&self) -> Provider {
        Provider::Chargify
    }

    fn expected_content_type(&self) -> &'static str {
        "application/x-www-form-urlencoded"
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
        let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
            debug!("chargify signature header missing");
            return false;
        };

        let expected = hmac_sha256_hex(body, secret);
        timing_safe_eq(&signature.to_ascii_lowercase(), &expected)
    }

    fn parse(&self, body: &[u8], headers: &HeaderMap) -> Result<Parsed> {
        let data: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|e| IngestError::payload(format!("invalid form body: {e}")))?;
        if data.is_empty() {
            return Err(IngestError::payload("empty form body"));
        }

        let fields = split_fields(data);

        let event = fields
            .top_level
            .get("event")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| IngestError::payload("missing event type"))?
            .clone();

        let customer_id = fields
            .customer
            .get("id")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| IngestError::payload("missing customer id"))?
            .clone();

        // Webhook id is the dedupe handle; transactions carry their own id
        // when the header is absent (replayed payloads).
        let external_id = headers
            .get(WEBHOOK_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| fields.transaction.get("id").cloned())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| IngestError::payload("missing webhook id"))?;

        let state = fields.subscription.get("state").cloned().unwrap_or_default();
        let kind = map_event_kind(&event, &state);

        let amount = fields
            .transaction
            .get("amount_in_cents")
            .or_else(|| fields.subscription.get("total_revenue_in_cents"))
            .and_then(|v| v.parse::<i64>().ok())
            .map_or(Amount::Unknown, Amount::Cents);

        let occurred_at = fields
            .top_level
            .get("created_at")
            .or_else(|| fields.transaction.get("created_at"))
            .and_then(|v| DateTime::parse_from_rfc3339(&v.replace("Z", "+00:00")).ok())
            .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

        let customer = CustomerData {
            external_customer_id: customer_id,
            email: fields.customer.get("email").cloned().unwrap_or_default(),
            first_name: fields.customer.get("first_name").cloned().unwrap_or_default(),
            last_name: fields.customer.get("last_name").cloned().unwrap_or_default(),
            company_name: fields.customer.get("organization").cloned().unwrap_or_default(),
            company_domain: None,
        };

        let subscription = fields.subscription.get("id").map(|id| SubscriptionData {
            id: id.clone(),
            status: state.clone(),
            plan_name: fields.subscription.get("product_name").cloned().unwrap_or_default(),
            cancel_at_period_end: fields
                .subscription
                .get("cancel_at_end_of_period")
                .is_some_and(|v| v == "true"),
            previous_status: fields.subscription.get("previous_state").cloned(),
        });

        let mut raw_metadata = BTreeMap::new();
        if let Some(id) = fields.transaction.get("id") {
            raw_metadata.insert("transaction_id".to_string(), id.clone());
        }
        if let Some(plan) = fields.subscription.get("product_name") {
            raw_metadata.insert("plan_name".to_string(), plan.clone());
        }
        if kind == EventKind::PaymentFailure {
            let reason = fields
                .transaction
                .get("failure_message")
                .cloned()
                .unwrap_or_else(|| "Unknown error".to_string());
            raw_metadata.insert("failure_reason".to_string(), reason);
        }
        if let Some(memo) = fields.transaction.get("memo") {
            if !memo.is_empty() {
                raw_metadata.insert("memo".to_string(), memo.clone());
                if let Some(order_ref) = self.shopify_order_ref(memo) {
                    raw_metadata.insert("shopify_order_ref".to_string(), order_ref);
                }
            }
        }

        Ok(Parsed::Event(Box::new(CanonicalEvent {
            provider: Provider::Chargify,
            kind,
            customer,
            subscription,
            amount,
            // Chargify amounts are always USD.
            currency: "USD".to_string(),
            external_id,
            occurred_at,
            raw_metadata,
        })))
    }
}
