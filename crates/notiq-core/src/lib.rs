//! Canonical event model and shared types.
//!
//! Provides the provider-agnostic event representation, tenant and tier
//! primitives, the ingestion error taxonomy, and the clock abstraction.
//! All other crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod time;

pub use error::{IngestError, Result};
pub use models::{
    Amount, CanonicalEvent, CustomerData, EventKind, PlanTier, Provider, SubscriptionData,
    TenantId,
};
pub use time::{Clock, RealClock, TestClock};
