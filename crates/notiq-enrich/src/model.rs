//! Enrichment record shapes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Partial company data returned by one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialCompany {
    /// Company display name.
    pub name: Option<String>,
    /// Primary logo URL.
    pub logo_url: Option<String>,
    /// Brand facts (description, industry, year founded, links, colors).
    pub brand_info: BTreeMap<String, Value>,
    /// Raw source response for provenance.
    pub raw: Value,
}

/// Partial person data returned by one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialPerson {
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Job title.
    pub position: Option<String>,
    /// Seniority level.
    pub seniority: Option<String>,
    /// Social profiles by network name (linkedin, twitter, github).
    pub social_handles: BTreeMap<String, String>,
    /// Location string.
    pub location: Option<String>,
    /// Raw source response for provenance.
    pub raw: Value,
}

/// Per-source provenance entry in a blended record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// When this source was fetched.
    pub fetched_at: DateTime<Utc>,
    /// Raw response the source returned.
    pub raw: Value,
}

/// Blended company record, keyed by normalized domain.
///
/// Created on the first successful enrichment for a domain and updated
/// (never deleted) on refresh. Cached indefinitely by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedCompany {
    /// Normalized domain key.
    pub domain: String,
    /// Company display name.
    pub name: Option<String>,
    /// Primary logo URL.
    pub logo_url: Option<String>,
    /// Merged brand facts, first contributing source wins per key.
    pub brand_info: BTreeMap<String, Value>,
    /// Provenance per contributing source.
    pub sources: BTreeMap<String, SourceRecord>,
    /// When the blend was produced.
    pub blended_at: DateTime<Utc>,
}

impl EnrichedCompany {
    /// Empty record for a domain, ready to merge into.
    pub fn empty(domain: impl Into<String>, blended_at: DateTime<Utc>) -> Self {
        Self {
            domain: domain.into(),
            name: None,
            logo_url: None,
            brand_info: BTreeMap::new(),
            sources: BTreeMap::new(),
            blended_at,
        }
    }

    /// Merges a partial record in; existing non-empty fields win.
    pub fn merge(&mut self, source_name: &str, partial: PartialCompany, fetched_at: DateTime<Utc>) {
        if self.name.is_none() {
            self.name = partial.name;
        }
        if self.logo_url.is_none() {
            self.logo_url = partial.logo_url;
        }
        for (key, value) in partial.brand_info {
            self.brand_info.entry(key).or_insert(value);
        }
        self.sources
            .insert(source_name.to_string(), SourceRecord { fetched_at, raw: partial.raw });
    }

    /// Whether any source contributed data.
    pub fn has_data(&self) -> bool {
        !self.sources.is_empty()
    }
}

/// Blended person record, keyed by normalized email.
///
/// Only ever created for tenants entitled to person-level enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPerson {
    /// Normalized (lowercased, trimmed) email key.
    pub email: String,
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Job title.
    pub position: Option<String>,
    /// Seniority level.
    pub seniority: Option<String>,
    /// Social profiles by network name.
    pub social_handles: BTreeMap<String, String>,
    /// Location string.
    pub location: Option<String>,
    /// Raw data from the winning person source.
    pub hunter_data: Value,
    /// When the record was produced.
    pub enriched_at: DateTime<Utc>,
}

impl EnrichedPerson {
    /// Empty record for an email, ready to merge into.
    pub fn empty(email: impl Into<String>, enriched_at: DateTime<Utc>) -> Self {
        Self {
            email: email.into(),
            first_name: None,
            last_name: None,
            position: None,
            seniority: None,
            social_handles: BTreeMap::new(),
            location: None,
            hunter_data: Value::Null,
            enriched_at,
        }
    }

    /// Merges a partial record in; existing non-empty fields win.
    pub fn merge(&mut self, partial: PartialPerson) {
        if self.first_name.is_none() {
            self.first_name = partial.first_name;
        }
        if self.last_name.is_none() {
            self.last_name = partial.last_name;
        }
        if self.position.is_none() {
            self.position = partial.position;
        }
        if self.seniority.is_none() {
            self.seniority = partial.seniority;
        }
        if self.location.is_none() {
            self.location = partial.location;
        }
        for (network, handle) in partial.social_handles {
            self.social_handles.entry(network).or_insert(handle);
        }
        if self.hunter_data.is_null() {
            self.hunter_data = partial.raw;
        }
    }

    /// Whether any source contributed data.
    pub fn has_data(&self) -> bool {
        self.first_name.is_some()
            || self.last_name.is_some()
            || self.position.is_some()
            || self.seniority.is_some()
            || !self.social_handles.is_empty()
            || !self.hunter_data.is_null()
    }

    /// Full display name, when any name part is present.
    pub fn display_name(&self) -> Option<String> {
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let name = name.trim();
        if name.is_empty() { None } else { Some(name.to_string()) }
    }
}

/// Normalizes an email for use as a cache key.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn company_merge_first_source_wins_per_field() {
        let now = Utc::now();
        let mut company = EnrichedCompany::empty("acme.io", now);

        company.merge(
            "brandfetch",
            PartialCompany {
                name: Some("Acme Inc".into()),
                logo_url: None,
                brand_info: [("industry".to_string(), json!("Software"))].into(),
                raw: json!({"src": "brandfetch"}),
            },
            now,
        );
        company.merge(
            "fallback",
            PartialCompany {
                name: Some("ACME International".into()),
                logo_url: Some("https://cdn/logo.png".into()),
                brand_info: [
                    ("industry".to_string(), json!("Conglomerate")),
                    ("year_founded".to_string(), json!(1999)),
                ]
                .into(),
                raw: json!({"src": "fallback"}),
            },
            now,
        );

        // Higher-priority (first merged) source wins overlapping fields.
        assert_eq!(company.name.as_deref(), Some("Acme Inc"));
        assert_eq!(company.brand_info.get("industry"), Some(&json!("Software")));
        // Lower-priority distinct fields still land.
        assert_eq!(company.logo_url.as_deref(), Some("https://cdn/logo.png"));
        assert_eq!(company.brand_info.get("year_founded"), Some(&json!(1999)));
        // Provenance retained for both.
        assert_eq!(company.sources.len(), 2);
        assert!(company.sources.contains_key("brandfetch"));
        assert!(company.sources.contains_key("fallback"));
    }

    #[test]
    fn person_display_name() {
        let mut person = EnrichedPerson::empty("jane@acme.io", Utc::now());
        assert_eq!(person.display_name(), None);
        person.merge(PartialPerson { first_name: Some("Jane".into()), ..Default::default() });
        assert_eq!(person.display_name().as_deref(), Some("Jane"));
    }

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email("  Jane@Acme.IO "), "jane@acme.io");
    }
}
