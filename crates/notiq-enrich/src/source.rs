//! Source and collaborator contracts.

use std::{future::Future, pin::Pin};

use notiq_core::{PlanTier, TenantId};

use crate::{
    model::{PartialCompany, PartialPerson},
    outcome::EnrichOutcome,
};

/// Boxed future alias used by the source traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A company-data source keyed by domain.
pub trait CompanySource: Send + Sync + 'static {
    /// Stable source name used for provenance.
    fn name(&self) -> &'static str;

    /// Priority; higher-priority sources win overlapping fields.
    fn priority(&self) -> u32;

    /// Whether the source is usable (credentials configured).
    fn is_available(&self) -> bool;

    /// Fetches partial company data for a normalized domain.
    fn fetch<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, EnrichOutcome<PartialCompany>>;
}

/// A person-data source keyed by email.
///
/// Person sources use per-tenant API keys and are invoked only after the
/// tier gate passed; implementations never see below-tier tenants.
pub trait PersonSource: Send + Sync + 'static {
    /// Stable source name used for provenance.
    fn name(&self) -> &'static str;

    /// Priority; higher-priority sources win overlapping fields.
    fn priority(&self) -> u32;

    /// Whether the source is usable as a plugin. Per-tenant key presence is
    /// checked separately by the blender.
    fn is_available(&self) -> bool;

    /// Fetches partial person data for a normalized email.
    fn fetch<'a>(
        &'a self,
        email: &'a str,
        api_key: &'a str,
    ) -> BoxFuture<'a, EnrichOutcome<PartialPerson>>;
}

/// Read-only view of tenant entitlements and credentials.
///
/// Backed by the billing system in production deployments; this pipeline
/// only ever reads from it.
pub trait TenantDirectory: Send + Sync + 'static {
    /// The tenant's current plan tier.
    fn tier_of(&self, tenant: TenantId) -> PlanTier;

    /// API key the tenant configured for an enrichment source, if any.
    fn api_key_for(&self, tenant: TenantId, source: &str) -> Option<String>;
}

/// Config-backed directory for single-tenant deployments.
pub struct StaticTenantDirectory {
    tenant: TenantId,
    tier: PlanTier,
    api_keys: Vec<(String, String)>,
}

impl StaticTenantDirectory {
    /// Creates a directory describing one tenant.
    pub fn new(tenant: TenantId, tier: PlanTier) -> Self {
        Self { tenant, tier, api_keys: Vec::new() }
    }

    /// Adds an API key for an enrichment source.
    #[must_use]
    pub fn with_api_key(mut self, source: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_keys.push((source.into(), key.into()));
        self
    }
}

impl TenantDirectory for StaticTenantDirectory {
    fn tier_of(&self, tenant: TenantId) -> PlanTier {
        if tenant == self.tenant { self.tier } else { PlanTier::Free }
    }

    fn api_key_for(&self, tenant: TenantId, source: &str) -> Option<String> {
        if tenant != self.tenant {
            return None;
        }
        self.api_keys.iter().find(|(name, _)| name == source).map(|(_, key)| key.clone())
    }
}
