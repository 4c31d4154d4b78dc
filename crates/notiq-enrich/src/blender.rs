//! Conflict-resolved merging across enrichment sources.
//!
//! For a given key the blender calls each available source in priority
//! order and merges the partial records field-by-field: the first source
//! supplying a non-empty value wins, provenance is retained per source, and
//! a source failure never aborts the blend. Person blending checks the
//! tenant's tier before any network call.

use std::{
    collections::HashMap,
    sync::Arc,
};

use notiq_core::{models::normalize_domain, Clock, PlanTier, TenantId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    cache::CacheStore,
    model::{normalize_email, EnrichedCompany, EnrichedPerson},
    outcome::EnrichOutcome,
    registry::EnrichmentRegistry,
    source::TenantDirectory,
    Result,
};

/// Minimum tier for person-level enrichment.
const PERSON_MIN_TIER: PlanTier = PlanTier::Pro;

/// Orchestrates sources, the tier gate, and the tiered cache.
pub struct Blender {
    registry: Arc<EnrichmentRegistry>,
    cache: Arc<dyn CacheStore>,
    tenants: Arc<dyn TenantDirectory>,
    clock: Arc<dyn Clock>,
    // Hot tier in front of the persistent cache.
    memory_companies: RwLock<HashMap<String, EnrichedCompany>>,
    memory_people: RwLock<HashMap<String, EnrichedPerson>>,
}

impl Blender {
    /// Creates a blender over a discovered registry.
    pub fn new(
        registry: Arc<EnrichmentRegistry>,
        cache: Arc<dyn CacheStore>,
        tenants: Arc<dyn TenantDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            cache,
            tenants,
            clock,
            memory_companies: RwLock::new(HashMap::new()),
            memory_people: RwLock::new(HashMap::new()),
        }
    }

    /// Blends company data for a domain, serving from cache when populated.
    ///
    /// Returns `Ok(None)` when no source had anything; nothing is cached in
    /// that case so a later refresh can try again.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EnrichError`] only for cache backend failures.
    pub async fn blend_company(&self, domain: &str) -> Result<Option<EnrichedCompany>> {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return Ok(None);
        }

        if let Some(hit) = self.memory_companies.read().await.get(&domain) {
            return Ok(Some(hit.clone()));
        }
        if let Some(hit) = self.cache.get_company(&domain).await? {
            self.memory_companies.write().await.insert(domain, hit.clone());
            return Ok(Some(hit));
        }

        let now = self.clock.now_utc();
        let mut company = EnrichedCompany::empty(&domain, now);

        for source in self.registry.company_sources() {
            match source.fetch(&domain).await {
                EnrichOutcome::Found(partial) => {
                    debug!(domain = %domain, source = source.name(), "company source contributed");
                    company.merge(source.name(), partial, self.clock.now_utc());
                },
                EnrichOutcome::NotFound => {
                    debug!(domain = %domain, source = source.name(), "company source had no data");
                },
                EnrichOutcome::RateLimited { retry_after } => {
                    warn!(
                        domain = %domain,
                        source = source.name(),
                        ?retry_after,
                        "company source rate limited, skipping"
                    );
                },
                EnrichOutcome::PrivacyClaimed => {
                    info!(domain = %domain, source = source.name(), "privacy claim, not caching");
                    return Ok(None);
                },
                EnrichOutcome::Failed(reason) => {
                    warn!(
                        domain = %domain,
                        source = source.name(),
                        reason = %reason,
                        "company source failed, skipping"
                    );
                },
            }
        }

        if !company.has_data() {
            return Ok(None);
        }

        company.blended_at = self.clock.now_utc();
        self.cache.put_company(&company).await?;
        self.memory_companies.write().await.insert(domain, company.clone());
        Ok(Some(company))
    }

    /// Blends person data for an email on behalf of a tenant.
    ///
    /// The tier gate and the per-tenant API key check both run before any
    /// network call; a below-tier tenant never triggers a request even when
    /// a key is configured. Not-found, privacy claims, and rate limits all
    /// degrade to `Ok(None)` rather than failing the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EnrichError`] only for cache backend failures.
    pub async fn blend_person(
        &self,
        email: &str,
        tenant: TenantId,
    ) -> Result<Option<EnrichedPerson>> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Ok(None);
        }

        let tier = self.tenants.tier_of(tenant);
        if !tier.meets(PERSON_MIN_TIER) {
            debug!(%tenant, %tier, "tenant below person-enrichment tier");
            return Ok(None);
        }

        if let Some(hit) = self.memory_people.read().await.get(&email) {
            return Ok(Some(hit.clone()));
        }
        if let Some(hit) = self.cache.get_person(&email).await? {
            self.memory_people.write().await.insert(email, hit.clone());
            return Ok(Some(hit));
        }

        let now = self.clock.now_utc();
        let mut person = EnrichedPerson::empty(&email, now);

        for source in self.registry.person_sources() {
            let Some(api_key) = self.tenants.api_key_for(tenant, source.name()) else {
                debug!(%tenant, source = source.name(), "no API key configured, skipping");
                continue;
            };

            match source.fetch(&email, &api_key).await {
                EnrichOutcome::Found(partial) => {
                    debug!(source = source.name(), "person source contributed");
                    person.merge(partial);
                },
                EnrichOutcome::NotFound => {
                    debug!(source = source.name(), "person source had no data");
                },
                EnrichOutcome::RateLimited { retry_after } => {
                    warn!(source = source.name(), ?retry_after, "person source rate limited");
                },
                EnrichOutcome::PrivacyClaimed => {
                    // Explicit do-not-retry: no cache write, stop blending.
                    info!(source = source.name(), "privacy claim, not caching");
                    return Ok(None);
                },
                EnrichOutcome::Failed(reason) => {
                    warn!(source = source.name(), reason = %reason, "person source failed");
                },
            }
        }

        if !person.has_data() {
            return Ok(None);
        }

        person.enriched_at = self.clock.now_utc();
        self.cache.put_person(&person).await?;
        self.memory_people.write().await.insert(email, person.clone());
        Ok(Some(person))
    }

    /// Forces a refresh for a domain, ignoring both cache tiers.
    ///
    /// # Errors
    ///
    /// Returns [`crate::EnrichError`] only for cache backend failures.
    pub async fn refresh_company(&self, domain: &str) -> Result<Option<EnrichedCompany>> {
        let normalized = normalize_domain(domain);
        self.memory_companies.write().await.remove(&normalized);
        // The persistent record is upserted, never deleted; a refresh that
        // finds nothing leaves the previous blend in place.
        let refreshed = self.blend_with_empty_cache(&normalized).await?;
        Ok(refreshed)
    }

    async fn blend_with_empty_cache(&self, domain: &str) -> Result<Option<EnrichedCompany>> {
        let now = self.clock.now_utc();
        let mut company = EnrichedCompany::empty(domain, now);

        for source in self.registry.company_sources() {
            if let EnrichOutcome::Found(partial) = source.fetch(domain).await {
                company.merge(source.name(), partial, self.clock.now_utc());
            }
        }

        if !company.has_data() {
            return Ok(None);
        }

        self.cache.put_company(&company).await?;
        self.memory_companies.write().await.insert(domain.to_string(), company.clone());
        Ok(Some(company))
    }
}
