//! Generic TTL cache over a [`KeyValueStore`].
//!
//! Expiry is enforced lazily: [`LocalCache::get`] treats an expired entry as
//! absent and evicts it.  [`LocalCache::sweep_expired`] is the only bulk
//! eviction and must be called explicitly (e.g. when the app returns to the
//! foreground).  No method returns an error: failures are logged and the
//! call degrades to "absent" or a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use huddle_shared::constants::APP_CACHE_PREFIX;

use crate::clock::Clock;
use crate::kv::KeyValueStore;

/// Envelope stored for every cached value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheItem<T> {
    pub value: T,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// Instant after which the entry reads as absent.
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl<T> CacheItem<T> {
    pub fn new(value: T, now: DateTime<Utc>, ttl: Option<Duration>) -> Self {
        let expiry = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        Self {
            value,
            timestamp: now,
            expiry,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| now > expiry)
    }
}

/// Fail-soft cache confined to one key namespace.
#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    namespace: &'static str,
}

impl LocalCache {
    /// Cache in the generic `app_cache_` namespace.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_namespace(store, clock, APP_CACHE_PREFIX)
    }

    pub fn with_namespace(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        namespace: &'static str,
    ) -> Self {
        Self {
            store,
            clock,
            namespace,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Read a value; expired, undecodable or unreadable entries are absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let full_key = self.full_key(key);
        let raw = match self.store.get(&full_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %full_key, error = %e, "cache read failed");
                return None;
            }
        };

        let item: CacheItem<T> = match serde_json::from_str(&raw) {
            Ok(item) => item,
            Err(e) => {
                warn!(key = %full_key, error = %e, "discarding undecodable cache entry");
                self.evict(&full_key);
                return None;
            }
        };

        if item.is_expired(self.clock.now()) {
            debug!(key = %full_key, "cache entry expired");
            self.evict(&full_key);
            return None;
        }

        Some(item.value)
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Write a value, optionally expiring `ttl` after now.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let full_key = self.full_key(key);
        let item = CacheItem::new(value, self.clock.now(), ttl);
        let raw = match serde_json::to_string(&item) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %full_key, error = %e, "cache value not serializable");
                return;
            }
        };
        if let Err(e) = self.store.set(&full_key, &raw) {
            warn!(key = %full_key, error = %e, "cache write failed");
        }
    }

    pub fn remove(&self, key: &str) {
        self.evict(&self.full_key(key));
    }

    /// Drop every entry in this namespace.
    pub fn clear(&self) {
        for key in self.namespace_keys() {
            self.evict(&key);
        }
    }

    /// Evict every expired entry in this namespace.  Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for key in self.namespace_keys() {
            let expired = match self.store.get(&key) {
                Ok(Some(raw)) => serde_json::from_str::<CacheItem<serde_json::Value>>(&raw)
                    .map(|item| item.is_expired(now))
                    .unwrap_or(true),
                Ok(None) => false,
                Err(e) => {
                    warn!(key = %key, error = %e, "cache read failed during sweep");
                    false
                }
            };
            if expired {
                self.evict(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, namespace = self.namespace, "swept expired cache entries");
        }
        removed
    }

    fn namespace_keys(&self) -> Vec<String> {
        self.store.keys(self.namespace).unwrap_or_else(|e| {
            warn!(namespace = self.namespace, error = %e, "cache key scan failed");
            Vec::new()
        })
    }

    fn evict(&self, full_key: &str) {
        if let Err(e) = self.store.remove(full_key) {
            warn!(key = %full_key, error = %e, "cache eviction failed");
        }
    }
}
