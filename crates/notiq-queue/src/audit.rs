//! Best-effort raw webhook capture for operator debugging.
//!
//! Every inbound request is recorded with masked signature headers under a
//! 7-day TTL and indexed per day. This store must never be able to fail the
//! pipeline: every error is caught and logged at `warn`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::BoxFuture;

/// TTL for raw webhook records and their daily indexes.
const AUDIT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Headers whose values are replaced with `[PRESENT]` before storage.
const SIGNATURE_HEADERS: &[&str] = &[
    "x-shopify-hmac-sha256",
    "stripe-signature",
    "x-chargify-webhook-signature-hmac-sha-256",
];

/// One captured inbound webhook request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Provider path segment the request hit.
    pub provider: String,
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Relevant headers, signature values masked.
    pub headers: BTreeMap<String, String>,
    /// Raw request body, lossily decoded.
    pub body: String,
    /// Body size in bytes before decoding.
    pub body_size: usize,
    /// When the request was received.
    pub received_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Builds a record from raw request parts, masking signature headers.
    pub fn from_request(
        provider: &str,
        method: &str,
        path: &str,
        headers: impl IntoIterator<Item = (String, String)>,
        body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Self {
        let mut masked = BTreeMap::new();
        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            let keep = matches!(
                lower.as_str(),
                "content-type" | "content-length" | "user-agent" | "x-forwarded-for"
            ) || lower.starts_with("x-shopify-")
                || lower.starts_with("x-chargify-")
                || lower == "stripe-signature";
            if !keep {
                continue;
            }

            let value =
                if SIGNATURE_HEADERS.contains(&lower.as_str()) { "[PRESENT]".to_string() } else { value };
            masked.insert(lower, value);
        }

        Self {
            provider: provider.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers: masked,
            body: String::from_utf8_lossy(body).into_owned(),
            body_size: body.len(),
            received_at,
        }
    }
}

/// Best-effort sink for raw webhook captures.
pub trait AuditStore: Send + Sync + 'static {
    /// Stores a record. Infallible by contract: implementations swallow and
    /// log their own errors.
    fn capture(&self, record: AuditRecord) -> BoxFuture<'_, ()>;

    /// Returns the records captured on a `YYYY-MM-DD` day, newest first.
    fn records_for_date<'a>(&'a self, date: &'a str) -> BoxFuture<'a, Vec<AuditRecord>>;
}

/// Redis-backed audit store with TTL expiry.
pub struct RedisAuditStore {
    conn: ConnectionManager,
}

impl RedisAuditStore {
    /// Creates the store over an established connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn record_key(record: &AuditRecord) -> String {
        format!(
            "nq:audit:{}:{}",
            record.provider,
            record.received_at.timestamp_millis()
        )
    }

    fn index_key(date: &str) -> String {
        format!("nq:audit_index:{date}")
    }

    async fn store(&self, record: AuditRecord) -> crate::Result<()> {
        let mut conn = self.conn.clone();
        let key = Self::record_key(&record);
        let json = serde_json::to_string(&record)?;

        let _: () = conn.set_ex(&key, json, AUDIT_TTL_SECS).await?;

        let index = Self::index_key(&record.received_at.format("%Y-%m-%d").to_string());
        let _: () = conn.rpush(&index, &key).await?;
        let _: () = conn.expire(&index, i64::try_from(AUDIT_TTL_SECS).unwrap_or(i64::MAX)).await?;
        Ok(())
    }

    async fn load_by_date(&self, date: &str) -> crate::Result<Vec<AuditRecord>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.lrange(Self::index_key(date), 0, -1).await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(json) = raw {
                match serde_json::from_str(&json) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(key = %key, error = %e, "corrupt audit record"),
                }
            }
        }
        records.sort_by(|a: &AuditRecord, b: &AuditRecord| b.received_at.cmp(&a.received_at));
        Ok(records)
    }
}

impl AuditStore for RedisAuditStore {
    fn capture(&self, record: AuditRecord) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.store(record).await {
                // Audit capture is observability, never pipeline-critical.
                warn!(error = %e, "failed to store webhook audit record");
            } else {
                debug!("webhook audit record stored");
            }
        })
    }

    fn records_for_date<'a>(&'a self, date: &'a str) -> BoxFuture<'a, Vec<AuditRecord>> {
        Box::pin(async move {
            match self.load_by_date(date).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(error = %e, "failed to load audit records");
                    Vec::new()
                },
            }
        })
    }
}

/// No-op audit store for tests and Redis-less setups.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditStore;

impl AuditStore for NullAuditStore {
    fn capture(&self, _record: AuditRecord) -> BoxFuture<'_, ()> {
        Box::pin(std::future::ready(()))
    }

    fn records_for_date<'a>(&'a self, _date: &'a str) -> BoxFuture<'a, Vec<AuditRecord>> {
        Box::pin(std::future::ready(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_headers_are_masked() {
        let record = AuditRecord::from_request(
            "stripe",
            "POST",
            "/webhooks/stripe",
            vec![
                ("Stripe-Signature".to_string(), "t=1,v1=deadbeef".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), "Bearer secret".to_string()),
            ],
            br#"{"id":"evt_1"}"#,
            Utc::now(),
        );

        assert_eq!(record.headers.get("stripe-signature").map(String::as_str), Some("[PRESENT]"));
        assert_eq!(
            record.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert!(!record.headers.contains_key("authorization"), "unrelated headers dropped");
        assert_eq!(record.body_size, 14);
    }

    #[test]
    fn chargify_signature_masked_but_webhook_id_kept() {
        let record = AuditRecord::from_request(
            "chargify",
            "POST",
            "/webhooks/chargify",
            vec![
                (
                    "X-Chargify-Webhook-Signature-Hmac-Sha-256".to_string(),
                    "abc123".to_string(),
                ),
                ("X-Chargify-Webhook-Id".to_string(), "wh_1".to_string()),
            ],
            b"event=payment_success",
            Utc::now(),
        );

        assert_eq!(
            record.headers.get("x-chargify-webhook-signature-hmac-sha-256").map(String::as_str),
            Some("[PRESENT]")
        );
        assert_eq!(record.headers.get("x-chargify-webhook-id").map(String::as_str), Some("wh_1"));
    }
}
