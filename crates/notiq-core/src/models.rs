//! Canonical domain models shared across the pipeline.
//!
//! Every provider payload is normalized into a [`CanonicalEvent`] before it
//! touches the queue. The pair `(provider, external_id)` is the idempotency
//! key for the whole system; everything downstream deduplicates on it.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Webhook source platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Chargify subscription billing.
    Chargify,
    /// Shopify e-commerce orders.
    Shopify,
    /// Stripe payment processing.
    Stripe,
}

impl Provider {
    /// Stable lowercase name used in queue keys and log fields.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chargify => "chargify",
            Self::Shopify => "shopify",
            Self::Stripe => "stripe",
        }
    }

    /// Parses a provider from its path segment.
    pub fn from_path(s: &str) -> Option<Self> {
        match s {
            "chargify" => Some(Self::Chargify),
            "shopify" => Some(Self::Shopify),
            "stripe" => Some(Self::Stripe),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed vocabulary of normalized event kinds.
///
/// Provider event names map onto these; anything unrecognized lands in
/// [`EventKind::GenericUpdate`] rather than being rejected, so an unknown
/// provider event still produces a (generic) notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A payment or renewal charge succeeded.
    PaymentSuccess,
    /// A payment or renewal charge failed.
    PaymentFailure,
    /// A new subscription was created.
    SubscriptionCreated,
    /// An existing subscription renewed.
    SubscriptionRenewed,
    /// A subscription was cancelled.
    SubscriptionCancelled,
    /// A trial is about to end.
    TrialEnding,
    /// Fallback bucket for unrecognized provider event names.
    GenericUpdate,
}

impl EventKind {
    /// Human-readable label used in notification titles.
    pub const fn label(self) -> &'static str {
        match self {
            Self::PaymentSuccess => "Payment Success",
            Self::PaymentFailure => "Payment Failure",
            Self::SubscriptionCreated => "Subscription Created",
            Self::SubscriptionRenewed => "Subscription Renewed",
            Self::SubscriptionCancelled => "Subscription Cancelled",
            Self::TrialEnding => "Trial Ending",
            Self::GenericUpdate => "Update",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Monetary amount in minor units, or the explicit unknown marker.
///
/// Providers routinely omit the amount on some event shapes. Parsing maps a
/// missing or malformed amount to [`Amount::Unknown`] instead of failing, and
/// formatting renders it as the literal text `unknown amount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amount {
    /// Amount in minor currency units (cents).
    Cents(i64),
    /// The provider did not supply a usable amount.
    Unknown,
}

impl Amount {
    /// Formats the amount for display, e.g. `29.99 USD` or `unknown amount`.
    pub fn display(&self, currency: &str) -> String {
        match self {
            Self::Cents(cents) => {
                let sign = if *cents < 0 { "-" } else { "" };
                let abs = cents.unsigned_abs();
                format!("{sign}{}.{:02} {currency}", abs / 100, abs % 100)
            },
            Self::Unknown => "unknown amount".to_string(),
        }
    }

    /// Returns the cents value if known.
    pub const fn cents(&self) -> Option<i64> {
        match self {
            Self::Cents(c) => Some(*c),
            Self::Unknown => None,
        }
    }
}

/// Customer details extracted from a provider payload.
///
/// Never persisted independently of an event; enrichment keys off the email
/// and company domain derived here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerData {
    /// Provider-side customer identifier.
    pub external_customer_id: String,
    /// Customer email, empty when the provider omitted it.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Organization name as reported by the provider.
    pub company_name: String,
    /// Explicit company domain, when the provider supplies one.
    pub company_domain: Option<String>,
}

/// Mail providers whose domains say nothing about the customer's company.
const FREE_MAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "live.com",
    "icloud.com",
    "aol.com",
    "proton.me",
    "protonmail.com",
];

impl CustomerData {
    /// Full display name, falling back to the email when both names are empty.
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() { self.email.clone() } else { name.to_string() }
    }

    /// Domain to use for company enrichment.
    ///
    /// Prefers the explicit `company_domain`, then falls back to the email
    /// domain unless it belongs to a free mail provider.
    pub fn enrichment_domain(&self) -> Option<String> {
        if let Some(domain) = &self.company_domain {
            if !domain.is_empty() {
                return Some(normalize_domain(domain));
            }
        }

        let (_, domain) = self.email.rsplit_once('@')?;
        let domain = normalize_domain(domain);
        if domain.is_empty() || FREE_MAIL_DOMAINS.contains(&domain.as_str()) {
            None
        } else {
            Some(domain)
        }
    }
}

/// Lowercases a domain and strips a leading `www.`.
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().to_ascii_lowercase();
    domain.strip_prefix("www.").unwrap_or(&domain).to_string()
}

/// Subscription details extracted from a provider payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionData {
    /// Provider-side subscription identifier.
    pub id: String,
    /// Current subscription state as reported by the provider.
    pub status: String,
    /// Plan or product name.
    pub plan_name: String,
    /// Whether the subscription is set to cancel at period end.
    pub cancel_at_period_end: bool,
    /// Previous state for state-change events.
    pub previous_status: Option<String>,
}

/// Provider-agnostic normalized representation of a webhook occurrence.
///
/// Immutable once parsed. `(provider, external_id)` is the idempotency key;
/// two webhooks carrying the same pair describe the same logical event and
/// must produce at most one delivered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    /// Source platform.
    pub provider: Provider,
    /// Normalized event kind.
    pub kind: EventKind,
    /// Customer details from the payload.
    pub customer: CustomerData,
    /// Subscription details, when the event carries them.
    pub subscription: Option<SubscriptionData>,
    /// Monetary amount, or the unknown marker.
    pub amount: Amount,
    /// ISO currency code, uppercase.
    pub currency: String,
    /// Provider-side unique identifier for this occurrence.
    pub external_id: String,
    /// When the event happened at the provider.
    pub occurred_at: DateTime<Utc>,
    /// Provider-specific leftovers: plan names, transaction ids, order
    /// numbers, failure reasons, cross-platform references.
    pub raw_metadata: BTreeMap<String, String>,
}

impl CanonicalEvent {
    /// Idempotency key deduplicating provider retries.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.provider, self.external_id)
    }

    /// Convenience accessor into `raw_metadata`.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.raw_metadata.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// Strongly-typed tenant identifier.
///
/// All destination credentials, thread mappings, and enrichment entitlements
/// are scoped to a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    /// Creates a new random tenant ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TenantId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Subscription plan tier, totally ordered.
///
/// Person-level enrichment is gated on `Pro` and above; the ordering is the
/// entitlement check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    /// Free or trialing workspace.
    Free,
    /// Entry paid plan.
    Basic,
    /// Professional plan.
    Pro,
    /// Enterprise plan.
    Enterprise,
}

impl PlanTier {
    /// Whether this tier meets the given minimum.
    pub fn meets(self, minimum: Self) -> bool {
        self >= minimum
    }

    /// Parses a tier name, defaulting unknown values to `Free`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "basic" | "starter" => Self::Basic,
            "pro" | "professional" => Self::Pro,
            "enterprise" => Self::Enterprise,
            _ => Self::Free,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Basic => write!(f, "basic"),
            Self::Pro => write!(f, "pro"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, amount: Amount) -> CanonicalEvent {
        CanonicalEvent {
            provider: Provider::Chargify,
            kind,
            customer: CustomerData {
                external_customer_id: "cus_1".into(),
                email: "jane@acme.io".into(),
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                company_name: "Acme".into(),
                company_domain: None,
            },
            subscription: None,
            amount,
            currency: "USD".into(),
            external_id: "evt_1".into(),
            occurred_at: Utc::now(),
            raw_metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn amount_display_formats_cents() {
        assert_eq!(Amount::Cents(2999).display("USD"), "29.99 USD");
        assert_eq!(Amount::Cents(100).display("EUR"), "1.00 EUR");
        assert_eq!(Amount::Cents(5).display("USD"), "0.05 USD");
        assert_eq!(Amount::Cents(-250).display("USD"), "-2.50 USD");
    }

    #[test]
    fn amount_display_unknown_sentinel() {
        assert_eq!(Amount::Unknown.display("USD"), "unknown amount");
    }

    #[test]
    fn idempotency_key_combines_provider_and_external_id() {
        let e = event(EventKind::PaymentSuccess, Amount::Cents(2999));
        assert_eq!(e.idempotency_key(), "chargify:evt_1");
    }

    #[test]
    fn enrichment_domain_prefers_explicit_company_domain() {
        let mut customer = event(EventKind::PaymentSuccess, Amount::Unknown).customer;
        customer.company_domain = Some("www.Acme.IO".into());
        assert_eq!(customer.enrichment_domain().as_deref(), Some("acme.io"));
    }

    #[test]
    fn enrichment_domain_falls_back_to_email_domain() {
        let customer = event(EventKind::PaymentSuccess, Amount::Unknown).customer;
        assert_eq!(customer.enrichment_domain().as_deref(), Some("acme.io"));
    }

    #[test]
    fn enrichment_domain_rejects_free_mail() {
        let mut customer = event(EventKind::PaymentSuccess, Amount::Unknown).customer;
        customer.email = "jane@gmail.com".into();
        assert_eq!(customer.enrichment_domain(), None);
    }

    #[test]
    fn plan_tier_total_order() {
        assert!(PlanTier::Free < PlanTier::Basic);
        assert!(PlanTier::Basic < PlanTier::Pro);
        assert!(PlanTier::Pro < PlanTier::Enterprise);
        assert!(PlanTier::Pro.meets(PlanTier::Pro));
        assert!(PlanTier::Enterprise.meets(PlanTier::Pro));
        assert!(!PlanTier::Basic.meets(PlanTier::Pro));
    }

    #[test]
    fn plan_tier_parse_defaults_to_free() {
        assert_eq!(PlanTier::parse("Pro"), PlanTier::Pro);
        assert_eq!(PlanTier::parse("enterprise"), PlanTier::Enterprise);
        assert_eq!(PlanTier::parse("trialing"), PlanTier::Free);
    }

    #[test]
    fn display_name_falls_back_to_email() {
        let mut customer = event(EventKind::PaymentSuccess, Amount::Unknown).customer;
        assert_eq!(customer.display_name(), "Jane Doe");
        customer.first_name = String::new();
        customer.last_name = String::new();
        assert_eq!(customer.display_name(), "jane@acme.io");
    }

    #[test]
    fn canonical_event_round_trips_through_json() {
        let e = event(EventKind::SubscriptionRenewed, Amount::Cents(2999));
        let json = serde_json::to_string(&e).expect("serialize");
        let back: CanonicalEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(e, back);
    }
}
