//! Enrichment registry, sources, and blending.
//!
//! A priority-ordered registry of enrichment sources feeds the [`Blender`],
//! which merges partial records field-by-field (first source wins per
//! field) while retaining per-source provenance. Person-level enrichment is
//! tier-gated before any network call. Results are cached indefinitely in a
//! memory-over-Redis tier.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod blender;
pub mod brandfetch;
pub mod cache;
pub mod hunter;
pub mod model;
pub mod outcome;
pub mod registry;
pub mod source;

pub use blender::Blender;
pub use brandfetch::BrandfetchSource;
pub use cache::{CacheStore, MemoryCacheStore, RedisCacheStore};
pub use hunter::HunterSource;
pub use model::{EnrichedCompany, EnrichedPerson, PartialCompany, PartialPerson, SourceRecord};
pub use outcome::EnrichOutcome;
pub use registry::{EnrichmentConfig, EnrichmentRegistry};
pub use source::{CompanySource, PersonSource, StaticTenantDirectory, TenantDirectory};

use thiserror::Error;

/// Result type alias using [`EnrichError`].
pub type Result<T> = std::result::Result<T, EnrichError>;

/// Errors raised by the enrichment cache layer.
///
/// Source failures are not errors: they are [`EnrichOutcome`] variants the
/// blender absorbs. Only the cache backend can fail a blend call, and the
/// pipeline absorbs even that into "no enrichment available".
#[derive(Debug, Error)]
pub enum EnrichError {
    /// Cache backend operation failed.
    #[error("enrichment cache error: {0}")]
    Cache(String),

    /// A cached record could not be (de)serialized.
    #[error("enrichment serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for EnrichError {
    fn from(err: redis::RedisError) -> Self {
        Self::Cache(err.to_string())
    }
}
