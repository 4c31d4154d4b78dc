//! Shopify webhook adapter.
//!
//! Shopify posts JSON bodies signed with HMAC-SHA256, base64-encoded in
//! `X-Shopify-Hmac-SHA256`. The event name arrives out-of-band in the
//! `X-Shopify-Topic` header. Test webhooks are acknowledged but never
//! enqueued.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use notiq_core::{
    Amount, CanonicalEvent, CustomerData, EventKind, IngestError, Provider, Result,
};
use serde_json::Value;
use tracing::debug;

use crate::{
    adapter::{parse_decimal_cents, Capability, Parsed, SourceAdapter},
    crypto::{hmac_sha256_base64, timing_safe_eq},
};

const SIGNATURE_HEADER: &str = "x-shopify-hmac-sha256";
const TOPIC_HEADER: &str = "x-shopify-topic";
const TEST_HEADER: &str = "x-shopify-test";
const SHOP_DOMAIN_HEADER: &str = "x-shopify-shop-domain";

/// Adapter for Shopify order webhooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShopifyAdapter;

impl ShopifyAdapter {
    /// Creates the adapter.
    pub fn new() -> Self {
        Self
    }
}

fn map_topic(topic: &str) -> EventKind {
    match topic {
        "orders/paid" => EventKind::PaymentSuccess,
        // Cancellations and customer updates carry no payment outcome.
        "orders/cancelled" | "customers/update" => EventKind::GenericUpdate,
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

impl SourceAdapter for ShopifyAdapter {
    fn provider(&self) -> Provider {
        Provider::Shopify
    }

    fn expected_content_type(&self) -> &'static str {
        "application/json"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Validate, Capability::Parse, Capability::CustomerData]
    }

    fn validate(&self, body: &[u8], headers: &HeaderMap, secret: &str) -> bool {
        let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
            debug!("shopify hmac header missing");
            return false;
        };

        let expected = hmac_sha256_base64(body, secret);
        timing_safe_eq(signature, &expected)
    }

    fn parse(&self, body: &[u8], headers: &HeaderMap) -> Result<Parsed> {
        let topic = headers
            .get(TOPIC_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| IngestError::payload("missing webhook topic"))?;

        let is_test = topic == "test"
            || headers
                .get(TEST_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if is_test {
            return Ok(Parsed::Test);
        }

        let data: Value = serde_json::from_slice(body)
            .map_err(|e| IngestError::payload(format!("invalid JSON body: {e}")))?;
        let Value::Object(ref obj) = data else {
            return Err(IngestError::payload("expected a JSON object"));
        };
        if obj.is_empty() {
            return Err(IngestError::payload("empty JSON body"));
        }

        let kind = map_topic(topic);

        // Orders nest the customer; customer-update payloads *are* the
        // customer.
        let customer_obj = data
            .get("customer")
            .filter(|c| c.is_object())
            .or_else(|| data.get("order").and_then(|o| o.get("customer")))
            .unwrap_or(&data);

        let customer_id = customer_obj
            .get("id")
            .and_then(string_of)
            .or_else(|| data.get("id").and_then(string_of))
            .ok_or_else(|| IngestError::payload("missing customer id"))?;

        let external_id = data
            .get("id")
            .and_then(string_of)
            .ok_or_else(|| IngestError::payload("missing webhook object id"))?;

        let amount = data
            .get("total_price")
            .and_then(string_of)
            .and_then(|v| parse_decimal_cents(&v))
            .map_or(Amount::Unknown, Amount::Cents);

        let currency =
            data.get("currency").and_then(string_of).unwrap_or_else(|| "USD".to_string());

        let occurred_at = data
            .get("created_at")
            .and_then(string_of)
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

        let email = customer_obj
            .get("email")
            .and_then(string_of)
            .or_else(|| data.get("contact_email").and_then(string_of))
            .unwrap_or_default();

        let shop_domain = headers
            .get(SHOP_DOMAIN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| data.get("shop_domain").and_then(string_of));

        let customer = CustomerData {
            external_customer_id: customer_id,
            email,
            first_name: customer_obj.get("first_name").and_then(string_of).unwrap_or_default(),
            last_name: customer_obj.get("last_name").and_then(string_of).unwrap_or_default(),
            company_name: customer_obj.get("company").and_then(string_of).unwrap_or_default(),
            company_domain: None,
        };

        let mut raw_metadata = BTreeMap::new();
        raw_metadata.insert("topic".to_string(), topic.to_string());
        if let Some(order_number) = data.get("order_number").and_then(string_of) {
            raw_metadata.insert("order_number".to_string(), order_number.clone());
            raw_metadata.insert("order_ref".to_string(), order_number);
        }
        for key in ["financial_status", "fulfillment_status"] {
            if let Some(value) = data.get(key).and_then(string_of) {
                raw_metadata.insert(key.to_string(), value);
            }
        }
        if let Some(orders_count) = customer_obj.get("orders_count").and_then(string_of) {
            raw_metadata.insert("orders_count".to_string(), orders_count);
        }
        if let Some(total_spent) = customer_obj.get("total_spent").and_then(string_of) {
            raw_metadata.insert("total_spent".to_string(), total_spent);
        }
        if let Some(domain) = shop_domain {
            raw_metadata.insert("shop_domain".to_string(), domain);
        }

        Ok(Parsed::Event(Box::new(CanonicalEvent {
            provider: Provider::Shopify,
            kind,
            customer,
            subscription: None,
            amount,
            currency,
            external_id,
            occurred_at,
            raw_metadata,
        })))
    }
}
