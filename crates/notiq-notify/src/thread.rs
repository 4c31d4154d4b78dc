//! Thread continuity: one conversation per external entity.
//!
//! Maps `(tenant, entity_type, entity_id)` to the destination thread so
//! follow-up events reply in-place instead of starting new conversations.
//! Creation is a single conditional insert, atomic against two webhooks for
//! the same entity racing each other. Mappings are never deleted
//! automatically.

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Mutex,
};

use notiq_core::TenantId;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Boxed future alias used by the thread store trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result type alias using [`ThreadError`].
pub type Result<T> = std::result::Result<T, ThreadError>;

/// Errors raised by the thread store.
#[derive(Debug, Error)]
pub enum ThreadError {
    /// Backend storage operation failed.
    #[error("thread store error: {0}")]
    Storage(String),

    /// A stored mapping could not be (de)serialized.
    #[error("thread mapping serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for ThreadError {
    fn from(err: redis::RedisError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Kind of external entity a thread tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A billing subscription.
    Subscription,
    /// An e-commerce order.
    Order,
    /// A provider-side customer.
    Customer,
}

impl EntityType {
    /// Stable name used in storage keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::Order => "order",
            Self::Customer => "customer",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A destination conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    /// Destination channel identifier.
    pub channel_id: String,
    /// Destination thread identifier (Slack message timestamp).
    pub thread_ts: String,
}

/// Mapping storage contract.
pub trait ThreadStore: Send + Sync + 'static {
    /// Looks up the existing thread for an entity.
    fn resolve(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> BoxFuture<'_, Result<Option<ThreadRef>>>;

    /// Returns the existing thread or atomically creates the mapping.
    ///
    /// The boolean is `true` when this call created the mapping. Two
    /// concurrent calls for the same entity agree on a single winner.
    fn get_or_create(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
        thread: ThreadRef,
    ) -> BoxFuture<'_, Result<(ThreadRef, bool)>>;

    /// Repoints an existing mapping at a new thread.
    ///
    /// Returns `false` when no mapping exists.
    fn update(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
        thread: ThreadRef,
    ) -> BoxFuture<'_, Result<bool>>;

    /// Explicit operator-driven deletion. Never called by the pipeline.
    fn delete(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> BoxFuture<'_, Result<bool>>;
}

fn mapping_key(tenant: TenantId, entity_type: EntityType, entity_id: &str) -> String {
    format!("nq:thread:{tenant}:{entity_type}:{entity_id}")
}

/// Redis-backed thread store; `SET NX` is the conditional insert.
pub struct RedisThreadStore {
    conn: ConnectionManager,
}

impl RedisThreadStore {
    /// Creates the store over an established connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl ThreadStore for RedisThreadStore {
    fn resolve(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> BoxFuture<'_, Result<Option<ThreadRef>>> {
        let key = mapping_key(tenant, entity_type, entity_id);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn.get(&key).await?;
            raw.map(|json| serde_json::from_str(&json).map_err(Into::into)).transpose()
        })
    }

    fn get_or_create(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
        thread: ThreadRef,
    ) -> BoxFuture<'_, Result<(ThreadRef, bool)>> {
        let key = mapping_key(tenant, entity_type, entity_id);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let json = serde_json::to_string(&thread)?;

            let created: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&json)
                .arg("NX")
                .query_async(&mut conn)
                .await?;

            if created.is_some() {
                info!(key = %key, "thread mapping created");
                return Ok((thread, true));
            }

            // Lost the race or the mapping predates us; read the winner.
            let raw: Option<String> = conn.get(&key).await?;
            match raw {
                Some(json) => Ok((serde_json::from_str(&json)?, false)),
                // Deleted between SET NX and GET; extremely unlikely, treat
                // our value as authoritative.
                None => Ok((thread, false)),
            }
        })
    }

    fn update(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
        thread: ThreadRef,
    ) -> BoxFuture<'_, Result<bool>> {
        let key = mapping_key(tenant, entity_type, entity_id);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let json = serde_json::to_string(&thread)?;

            let updated: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&json)
                .arg("XX")
                .query_async(&mut conn)
                .await?;

            if updated.is_some() {
                debug!(key = %key, "thread mapping updated");
            }
            Ok(updated.is_some())
        })
    }

    fn delete(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> BoxFuture<'_, Result<bool>> {
        let key = mapping_key(tenant, entity_type, entity_id);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let deleted: i64 = conn.del(&key).await?;
            Ok(deleted > 0)
        })
    }
}

/// In-memory thread store for tests.
#[derive(Default)]
pub struct MemoryThreadStore {
    mappings: Mutex<HashMap<String, ThreadRef>>,
}

impl MemoryThreadStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ThreadRef>> {
        match self.mappings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ThreadStore for MemoryThreadStore {
    fn resolve(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> BoxFuture<'_, Result<Option<ThreadRef>>> {
        let key = mapping_key(tenant, entity_type, entity_id);
        Box::pin(async move { Ok(self.lock().get(&key).cloned()) })
    }

    fn get_or_create(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
        thread: ThreadRef,
    ) -> BoxFuture<'_, Result<(ThreadRef, bool)>> {
        let key = mapping_key(tenant, entity_type, entity_id);
        Box::pin(async move {
            let mut mappings = self.lock();
            match mappings.get(&key) {
                Some(existing) => Ok((existing.clone(), false)),
                None => {
                    mappings.insert(key, thread.clone());
                    Ok((thread, true))
                },
            }
        })
    }

    fn update(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
        thread: ThreadRef,
    ) -> BoxFuture<'_, Result<bool>> {
        let key = mapping_key(tenant, entity_type, entity_id);
        Box::pin(async move {
            let mut mappings = self.lock();
            match mappings.get_mut(&key) {
                Some(existing) => {
                    *existing = thread;
                    Ok(true)
                },
                None => Ok(false),
            }
        })
    }

    fn delete(
        &self,
        tenant: TenantId,
        entity_type: EntityType,
        entity_id: &str,
    ) -> BoxFuture<'_, Result<bool>> {
        let key = mapping_key(tenant, entity_type, entity_id);
        Box::pin(async move { Ok(self.lock().remove(&key).is_some()) })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn thread(ts: &str) -> ThreadRef {
        ThreadRef { channel_id: "C123".into(), thread_ts: ts.into() }
    }

    #[tokio::test]
    async fn sequential_notifications_reuse_thread() {
        let store = MemoryThreadStore::new();
        let tenant = TenantId::new();

        let (first, created) = store
            .get_or_create(tenant, EntityType::Subscription, "sub_42", thread("111.222"))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.thread_ts, "111.222");

        let (second, created) = store
            .get_or_create(tenant, EntityType::Subscription, "sub_42", thread("999.999"))
            .await
            .unwrap();
        assert!(!created, "existing mapping must win");
        assert_eq!(second.thread_ts, "111.222");
    }

    #[tokio::test]
    async fn different_entities_get_different_mappings() {
        let store = MemoryThreadStore::new();
        let tenant = TenantId::new();

        let (_, created_a) = store
            .get_or_create(tenant, EntityType::Subscription, "sub_1", thread("1.1"))
            .await
            .unwrap();
        let (_, created_b) = store
            .get_or_create(tenant, EntityType::Subscription, "sub_2", thread("2.2"))
            .await
            .unwrap();
        assert!(created_a && created_b);

        let a = store.resolve(tenant, EntityType::Subscription, "sub_1").await.unwrap();
        let b = store.resolve(tenant, EntityType::Subscription, "sub_2").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn concurrent_creation_yields_one_mapping() {
        let store = Arc::new(MemoryThreadStore::new());
        let tenant = TenantId::new();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_create(
                        tenant,
                        EntityType::Order,
                        "order_1001",
                        thread(&format!("{i}.000")),
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut created_count = 0;
        let mut refs = Vec::new();
        for handle in handles {
            let (thread_ref, created) = handle.await.unwrap();
            created_count += usize::from(created);
            refs.push(thread_ref.thread_ts);
        }

        assert_eq!(created_count, 1, "exactly one creation wins");
        assert!(refs.windows(2).all(|w| w[0] == w[1]), "all callers see the same thread");
    }

    #[tokio::test]
    async fn update_repoints_existing_mapping_only() {
        let store = MemoryThreadStore::new();
        let tenant = TenantId::new();

        assert!(!store
            .update(tenant, EntityType::Subscription, "sub_42", thread("2.2"))
            .await
            .unwrap());

        store
            .get_or_create(tenant, EntityType::Subscription, "sub_42", thread("1.1"))
            .await
            .unwrap();
        assert!(store
            .update(tenant, EntityType::Subscription, "sub_42", thread("2.2"))
            .await
            .unwrap());

        let resolved =
            store.resolve(tenant, EntityType::Subscription, "sub_42").await.unwrap().unwrap();
        assert_eq!(resolved.thread_ts, "2.2");
    }

    #[tokio::test]
    async fn delete_is_explicit_only() {
        let store = MemoryThreadStore::new();
        let tenant = TenantId::new();

        store
            .get_or_create(tenant, EntityType::Customer, "cus_1", thread("1.1"))
            .await
            .unwrap();
        assert!(store.delete(tenant, EntityType::Customer, "cus_1").await.unwrap());
        assert!(store.resolve(tenant, EntityType::Customer, "cus_1").await.unwrap().is_none());
        assert!(!store.delete(tenant, EntityType::Customer, "cus_1").await.unwrap());
    }
}
