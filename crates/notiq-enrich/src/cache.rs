//! Persistent cache tier for blended enrichment records.
//!
//! Records cache indefinitely: once a domain or email is populated it is
//! not re-fetched unless explicitly refreshed. Writes are upserts keyed by
//! domain/email so concurrent blends for the same key converge.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use redis::{aio::ConnectionManager, AsyncCommands};

use crate::{
    model::{EnrichedCompany, EnrichedPerson},
    source::BoxFuture,
    Result,
};

/// Backend for the persistent cache tier.
pub trait CacheStore: Send + Sync + 'static {
    /// Loads a blended company record by normalized domain.
    fn get_company<'a>(&'a self, domain: &'a str)
        -> BoxFuture<'a, Result<Option<EnrichedCompany>>>;

    /// Upserts a blended company record.
    fn put_company<'a>(&'a self, company: &'a EnrichedCompany) -> BoxFuture<'a, Result<()>>;

    /// Loads a blended person record by normalized email.
    fn get_person<'a>(&'a self, email: &'a str) -> BoxFuture<'a, Result<Option<EnrichedPerson>>>;

    /// Upserts a blended person record.
    fn put_person<'a>(&'a self, person: &'a EnrichedPerson) -> BoxFuture<'a, Result<()>>;
}

/// Redis-backed cache with no expiry.
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    /// Creates the store over an established connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn company_key(domain: &str) -> String {
        format!("nq:enrich:company:{domain}")
    }

    fn person_key(email: &str) -> String {
        format!("nq:enrich:person:{email}")
    }
}

impl CacheStore for RedisCacheStore {
    fn get_company<'a>(
        &'a self,
        domain: &'a str,
    ) -> BoxFuture<'a, Result<Option<EnrichedCompany>>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.get(Self::company_key(domain)).await?;
            raw.map(|json| serde_json::from_str(&json).map_err(Into::into)).transpose()
        })
    }

    fn put_company<'a>(&'a self, company: &'a EnrichedCompany) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let json = serde_json::to_string(company)?;
            let _: () = conn.set(Self::company_key(&company.domain), json).await?;
            Ok(())
        })
    }

    fn get_person<'a>(&'a self, email: &'a str) -> BoxFuture<'a, Result<Option<EnrichedPerson>>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.get(Self::person_key(email)).await?;
            raw.map(|json| serde_json::from_str(&json).map_err(Into::into)).transpose()
        })
    }

    fn put_person<'a>(&'a self, person: &'a EnrichedPerson) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let json = serde_json::to_string(person)?;
            let _: () = conn.set(Self::person_key(&person.email), json).await?;
            Ok(())
        })
    }
}

/// In-memory cache for tests and Redis-less setups.
#[derive(Default)]
pub struct MemoryCacheStore {
    companies: Arc<Mutex<HashMap<String, EnrichedCompany>>>,
    people: Arc<Mutex<HashMap<String, EnrichedPerson>>>,
}

impl MemoryCacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CacheStore for MemoryCacheStore {
    fn get_company<'a>(
        &'a self,
        domain: &'a str,
    ) -> BoxFuture<'a, Result<Option<EnrichedCompany>>> {
        Box::pin(async move { Ok(Self::lock(&self.companies).get(domain).cloned()) })
    }

    fn put_company<'a>(&'a self, company: &'a EnrichedCompany) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            Self::lock(&self.companies).insert(company.domain.clone(), company.clone());
            Ok(())
        })
    }

    fn get_person<'a>(&'a self, email: &'a str) -> BoxFuture<'a, Result<Option<EnrichedPerson>>> {
        Box::pin(async move { Ok(Self::lock(&self.people).get(email).cloned()) })
    }

    fn put_person<'a>(&'a self, person: &'a EnrichedPerson) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            Self::lock(&self.people).insert(person.email.clone(), person.clone());
            Ok(())
        })
    }
}
