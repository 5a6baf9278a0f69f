//! Memoization cache with a per-entry time-to-live
//!
//! Keys are built from a scope (function identity) and the serialized
//! arguments. Concurrent writers to the same key are last-writer-wins.

use crate::error::Result;
use crate::executor::RemoteExecutor;
use crate::model::{RemoteCall, Row};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct CacheEntry {
    stored_at: Instant,
    ttl: Duration,
    value: Arc<dyn Any + Send + Sync>,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }
}

#[derive(Default)]
pub struct MemoCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Cache key for `scope` called with `args`
    pub fn key<A: Serialize + ?Sized>(scope: &str, args: &A) -> Result<String> {
        Ok(format!("{}:{}", scope, serde_json::to_string(args)?))
    }

    /// Fresh value stored under `key`, if any and if it has type `V`
    pub fn get<V: Clone + 'static>(&self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_fresh() => return entry.value.downcast_ref::<V>().cloned(),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| !entry.is_fresh());
        }
        None
    }

    pub fn insert<V: Send + Sync + 'static>(&self, key: &str, ttl: Duration, value: V) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                stored_at: Instant::now(),
                ttl,
                value: Arc::new(value),
            },
        );
    }

    /// Return the value computed for `key` within `ttl`, or compute and store
    /// a new one. Errors from `compute` are returned and not cached.
    pub async fn memoize<V, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(hit) = self.get::<V>(key) {
            debug!("cache hit: {}", abbreviate(key));
            return Ok(hit);
        }
        let value = compute().await?;
        self.insert(key, ttl, value.clone());
        Ok(value)
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| entry.is_fresh());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn abbreviate(key: &str) -> String {
    key.chars().take(120).collect()
}

/// Remote executor whose successful calls are memoized for `ttl`
pub struct CachedExecutor {
    inner: Arc<dyn RemoteExecutor>,
    cache: Arc<MemoCache>,
    ttl: Duration,
}

impl CachedExecutor {
    pub fn new(inner: Arc<dyn RemoteExecutor>, cache: Arc<MemoCache>, ttl: Duration) -> Self {
        Self { inner, cache, ttl }
    }
}

#[async_trait]
impl RemoteExecutor for CachedExecutor {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn execute(&self, call: &RemoteCall) -> Result<Vec<Row>> {
        let key = MemoCache::key(&format!("{}::execute", self.inner.name()), call)?;
        let inner = Arc::clone(&self.inner);
        self.cache
            .memoize(&key, self.ttl, || async move { inner.execute(call).await })
            .await
    }

    fn describe(&self, call: &RemoteCall) -> String {
        self.inner.describe(call)
    }
}
