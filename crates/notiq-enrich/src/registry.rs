//! Explicit, startup-time source registration.
//!
//! No runtime scanning: `discover` builds the known sources from
//! configuration exactly once per process lifetime and is a no-op on
//! subsequent calls.

use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::{
    brandfetch::BrandfetchSource,
    hunter::HunterSource,
    source::{CompanySource, PersonSource},
};

/// Configuration for the built-in sources.
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Global Brandfetch API key; absent disables the source.
    pub brandfetch_api_key: Option<String>,
    /// Brandfetch API base URL (overridable for tests).
    pub brandfetch_base_url: String,
    /// Hunter API base URL (overridable for tests).
    pub hunter_base_url: String,
    /// Per-request timeout for source calls.
    pub request_timeout: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            brandfetch_api_key: None,
            brandfetch_base_url: "https://api.brandfetch.io/v2".to_string(),
            hunter_base_url: "https://api.hunter.io/v2".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Priority-ordered registry of enrichment sources.
#[derive(Default)]
pub struct EnrichmentRegistry {
    company: Vec<Arc<dyn CompanySource>>,
    person: Vec<Arc<dyn PersonSource>>,
    discovered: bool,
}

impl EnrichmentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a company source, keeping the list priority-sorted.
    pub fn register_company(&mut self, source: Arc<dyn CompanySource>) {
        self.company.push(source);
        self.company.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    /// Registers a person source, keeping the list priority-sorted.
    pub fn register_person(&mut self, source: Arc<dyn PersonSource>) {
        self.person.push(source);
        self.person.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    /// Populates the registry from configuration.
    ///
    /// Idempotent: the second and later calls do nothing.
    pub fn discover(&mut self, config: &EnrichmentConfig) {
        if self.discovered {
            return;
        }
        self.discovered = true;

        if let Some(api_key) = &config.brandfetch_api_key {
            self.register_company(Arc::new(BrandfetchSource::new(
                api_key.clone(),
                config.brandfetch_base_url.clone(),
                config.request_timeout,
            )));
        }

        // Hunter availability depends on per-tenant keys, so the source is
        // always registered; the blender checks the key before calling.
        self.register_person(Arc::new(HunterSource::new(
            config.hunter_base_url.clone(),
            config.request_timeout,
        )));

        info!(
            company_sources = self.company.len(),
            person_sources = self.person.len(),
            "enrichment registry discovered"
        );
    }

    /// Available company sources in priority order.
    pub fn company_sources(&self) -> impl Iterator<Item = &Arc<dyn CompanySource>> {
        self.company.iter().filter(|s| s.is_available())
    }

    /// Available person sources in priority order.
    pub fn person_sources(&self) -> impl Iterator<Item = &Arc<dyn PersonSource>> {
        self.person.iter().filter(|s| s.is_available())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        model::PartialCompany,
        outcome::EnrichOutcome,
        source::BoxFuture,
    };

    use super::*;

    struct FakeSource {
        name: &'static str,
        priority: u32,
        available: bool,
    }

    impl CompanySource for FakeSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn fetch<'a>(&'a self, _domain: &'a str) -> BoxFuture<'a, EnrichOutcome<PartialCompany>> {
            Box::pin(std::future::ready(EnrichOutcome::NotFound))
        }
    }

    #[test]
    fn sources_iterate_in_priority_order() {
        let mut registry = EnrichmentRegistry::new();
        registry.register_company(Arc::new(FakeSource {
            name: "low",
            priority: 10,
            available: true,
        }));
        registry.register_company(Arc::new(FakeSource {
            name: "high",
            priority: 100,
            available: true,
        }));
        registry.register_company(Arc::new(FakeSource {
            name: "offline",
            priority: 200,
            available: false,
        }));

        let names: Vec<_> = registry.company_sources().map(|s| s.name()).collect();
        assert_eq!(names, vec!["high", "low"], "unavailable sources filtered, priority desc");
    }

    #[test]
    fn discover_is_idempotent() {
        let mut registry = EnrichmentRegistry::new();
        let config = EnrichmentConfig {
            brandfetch_api_key: Some("bf_key".into()),
            ..Default::default()
        };

        registry.discover(&config);
        let first = registry.company.len() + registry.person.len();
        registry.discover(&config);
        let second = registry.company.len() + registry.person.len();
        assert_eq!(first, second);
        assert_eq!(first, 2);
    }

    #[test]
    fn discover_without_key_skips_brandfetch() {
        let mut registry = EnrichmentRegistry::new();
        registry.discover(&EnrichmentConfig::default());
        assert_eq!(registry.company.len(), 0);
        assert_eq!(registry.person.len(), 1);
    }
}
