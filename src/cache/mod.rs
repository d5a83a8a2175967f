//! HTTP edge response cache with request coalescing and
//! stale-while-revalidate.
//!
//! The cache is a library surface: any proxy loop can drive it. Lookups,
//! stores, and purges are O(1) against an arena-backed LRU; misses collapse
//! through a per-key coalescer so a storm of identical requests costs one
//! origin call; stale hits are served immediately while a single background
//! refresh replaces the entry.

mod coalesce;
mod entry;
mod lru;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::ErrorKind;

use coalesce::Coalescer;
use lru::LruStore;

pub use entry::{CacheKey, CachedResponse, Freshness, OriginResponse, is_cacheable_status};

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Cache errors are `Clone` so the coalescer can hand one failure to every
/// waiter in the window.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("origin fetch failed: {message}")]
    Origin { message: String },
    #[error("cache is shutting down")]
    Cancelled,
}

impl CacheError {
    pub fn origin(message: impl Into<String>) -> Self {
        CacheError::Origin {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Origin { .. } => ErrorKind::Io,
            CacheError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of stored entries.
    pub capacity: usize,
    /// TTL when the response carries no freshness directives.
    pub default_ttl: Duration,
    /// Stale-while-revalidate window when the response does not set one.
    pub stale_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_ttl: Duration::from_secs(60),
            stale_grace: Duration::from_secs(10),
        }
    }
}

/// Outcome of a cache lookup. At most one response object is returned.
#[derive(Clone, Debug)]
pub enum Lookup {
    Hit(CachedResponse),
    Stale(CachedResponse),
    Miss,
}

/// How [`EdgeCache::fetch`] satisfied the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Stale,
    Miss,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stales: u64,
    pub size: usize,
    pub capacity: usize,
}

pub struct EdgeCache {
    config: CacheConfig,
    store: Mutex<LruStore>,
    coalesce: Coalescer,
    /// Keys with a background revalidation already scheduled.
    refreshing: Mutex<HashSet<String>>,
    refresh_handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancelToken,
    hits: AtomicU64,
    misses: AtomicU64,
    stales: AtomicU64,
}

impl EdgeCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            store: Mutex::new(LruStore::new(config.capacity)),
            config,
            coalesce: Coalescer::new(),
            refreshing: Mutex::new(HashSet::new()),
            refresh_handles: Mutex::new(Vec::new()),
            cancel: CancelToken::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stales: AtomicU64::new(0),
        }
    }

    /// Look a key up at `now`, touching LRU position on a hit.
    ///
    /// Hard-expired entries (past `stale_until`) are evicted and reported as
    /// a miss.
    pub fn lookup(&self, key: &CacheKey, now: SystemTime) -> Lookup {
        let mut store = self.store.lock().expect("cache store lock poisoned");
        let Some(resp) = store.get(key.as_str()) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        };
        match resp.freshness(now) {
            Freshness::Fresh => {
                let resp = resp.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Hit(resp)
            }
            Freshness::Stale => {
                let resp = resp.clone();
                self.stales.fetch_add(1, Ordering::Relaxed);
                Lookup::Stale(resp)
            }
            Freshness::Expired => {
                store.remove(key.as_str());
                self.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss
            }
        }
    }

    /// Store a response, evicting the LRU entry at capacity. A duplicate key
    /// replaces the entry and moves it to the MRU position.
    pub fn store(&self, key: &CacheKey, resp: CachedResponse) {
        let mut store = self.store.lock().expect("cache store lock poisoned");
        if let Some(evicted) = store.insert(key.as_str(), resp) {
            tracing::debug!(key = %evicted, "cache evicted lru entry");
        }
    }

    /// Remove all entries whose key starts with `prefix`.
    pub fn purge_prefix(&self, prefix: &str) -> usize {
        let count = self
            .store
            .lock()
            .expect("cache store lock poisoned")
            .purge_prefix(prefix);
        tracing::info!(prefix, count, "cache purge");
        count
    }

    /// Run `fetch` with at most one execution in flight per key; concurrent
    /// callers for the same key block and share the leader's result.
    pub fn coalesce<F>(&self, key: &CacheKey, fetch: F) -> CacheResult<CachedResponse>
    where
        F: FnOnce() -> CacheResult<CachedResponse>,
    {
        self.coalesce.run(key.as_str(), fetch)
    }

    /// The full edge discipline: fresh hits served directly, stale hits
    /// served immediately with one background refresh scheduled, misses
    /// fetched through the coalescer and stored when cacheable.
    pub fn fetch<F>(
        self: &Arc<Self>,
        key: &CacheKey,
        now: SystemTime,
        origin: F,
    ) -> CacheResult<(CachedResponse, CacheOutcome)>
    where
        F: Fn() -> CacheResult<OriginResponse> + Send + Sync + 'static,
    {
        match self.lookup(key, now) {
            Lookup::Hit(resp) => Ok((resp, CacheOutcome::Hit)),
            Lookup::Stale(resp) => {
                self.spawn_refresh(key.clone(), Arc::new(origin));
                Ok((resp, CacheOutcome::Stale))
            }
            Lookup::Miss => {
                let resp = self.fetch_and_store(key, now, &origin)?;
                Ok((resp, CacheOutcome::Miss))
            }
        }
    }

    fn fetch_and_store<F>(
        &self,
        key: &CacheKey,
        now: SystemTime,
        origin: &F,
    ) -> CacheResult<CachedResponse>
    where
        F: Fn() -> CacheResult<OriginResponse>,
    {
        self.coalesce.run(key.as_str(), || {
            let fetched = origin()?;
            match CachedResponse::from_origin(&fetched, now, &self.config) {
                Some(resp) => {
                    self.store(key, resp.clone());
                    Ok(resp)
                }
                None => Ok(CachedResponse::passthrough(&fetched, now)),
            }
        })
    }

    fn spawn_refresh<F>(self: &Arc<Self>, key: CacheKey, origin: Arc<F>)
    where
        F: Fn() -> CacheResult<OriginResponse> + Send + Sync + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        {
            let mut refreshing = self.refreshing.lock().expect("cache refresh lock poisoned");
            if !refreshing.insert(key.as_str().to_string()) {
                // A refresh for this key is already scheduled.
                return;
            }
        }

        let cache = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            let result = cache.fetch_and_store(&key, SystemTime::now(), &*origin);
            if let Err(err) = result {
                tracing::warn!(key = %key, "background revalidation failed: {err}");
            }
            cache
                .refreshing
                .lock()
                .expect("cache refresh lock poisoned")
                .remove(key.as_str());
        });
        self.refresh_handles
            .lock()
            .expect("cache handles lock poisoned")
            .push(handle);
    }

    /// Cancel background refreshes and wait for them to finish.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .refresh_handles
            .lock()
            .expect("cache handles lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let store = self.store.lock().expect("cache store lock poisoned");
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stales: self.stales.load(Ordering::Relaxed),
            size: store.len(),
            capacity: store.capacity(),
        }
    }
}
