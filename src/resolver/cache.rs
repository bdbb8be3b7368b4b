//! Resolved endpoint cache
//!
//! Entries expire after a fixed TTL. When the cache is full the oldest
//! *inserted* key is evicted, whatever its last access time. Updating an
//! existing key keeps its original position in the eviction order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::ResolvedStream;

pub const STREAM_CACHE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
pub const STREAM_CACHE_CAPACITY: usize = 500;

struct CacheEntry {
    stream: ResolvedStream,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl CacheInner {
    fn forget(&mut self, url: &str) {
        self.entries.remove(url);
        self.order.retain(|key| key != url);
    }
}

pub struct StreamCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    capacity: usize,
}

impl Default for StreamCache {
    fn default() -> Self {
        Self::new(STREAM_CACHE_TTL, STREAM_CACHE_CAPACITY)
    }
}

impl StreamCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, url: &str) -> Option<ResolvedStream> {
        let mut inner = self.lock();

        let expired = match inner.entries.get(url) {
            None => return None,
            Some(entry) => entry.expires_at <= Instant::now(),
        };

        if expired {
            debug!(url, "Stream cache entry expired");
            inner.forget(url);
            return None;
        }

        inner.entries.get(url).map(|entry| entry.stream.clone())
    }

    pub fn insert(&self, url: &str, stream: ResolvedStream) {
        let mut inner = self.lock();
        let expires_at = Instant::now() + self.ttl;

        if let Some(entry) = inner.entries.get_mut(url) {
            entry.stream = stream;
            entry.expires_at = expires_at;
            return;
        }

        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    debug!(url = oldest.as_str(), "Evicting oldest stream cache entry");
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.order.push_back(url.to_string());
        inner.entries.insert(url.to_string(), CacheEntry { stream, expires_at });
    }

    pub fn contains(&self, url: &str) -> bool {
        self.get(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
