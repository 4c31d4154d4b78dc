//! Source adapters translating provider webhooks into canonical events.
//!
//! One adapter per provider. Each validates the provider's signature scheme
//! with a constant-time comparison and parses the payload into a
//! [`notiq_core::CanonicalEvent`], substituting documented defaults for
//! missing optional fields instead of failing.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod chargify;
pub mod crypto;
pub mod shopify;
pub mod stripe;

pub use adapter::{Capability, Parsed, SourceAdapter};
pub use chargify::ChargifyAdapter;
pub use shopify::ShopifyAdapter;
pub use stripe::StripeAdapter;
