// ── Reference counts with delayed eviction ──
//
// A key that drops to zero references is not evicted right away: it is
// queued with a deadline, and `gc` hands back the keys whose deadline has
// passed without being retained again.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::cache_key::CacheKey;

#[derive(Debug)]
pub struct RefCounts {
    keep_alive: Duration,
    counts: HashMap<CacheKey, usize>,
    gc_queue: HashMap<CacheKey, Instant>,
}

impl RefCounts {
    pub fn new(keep_alive: Duration) -> Self {
        Self {
            keep_alive,
            counts: HashMap::new(),
            gc_queue: HashMap::new(),
        }
    }

    /// Start tracking a freshly created key. Unless it is retained before
    /// the keep-alive elapses, it will be collected.
    pub fn register(&mut self, key: &CacheKey) {
        if !self.counts.contains_key(key) && !self.gc_queue.contains_key(key) {
            self.gc_queue
                .insert(key.clone(), Instant::now() + self.keep_alive);
        }
    }

    pub fn retain(&mut self, key: &CacheKey) {
        *self.counts.entry(key.clone()).or_default() += 1;
        self.gc_queue.remove(key);
    }

    pub fn release(&mut self, key: &CacheKey) {
        let Some(count) = self.counts.get_mut(key) else {
            tracing::debug!(%key, "release of an unretained key");
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(key);
            self.gc_queue
                .insert(key.clone(), Instant::now() + self.keep_alive);
        }
    }

    pub fn count(&self, key: &CacheKey) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Remove and return every queued key whose deadline is at or before `now`.
    pub fn gc(&mut self, now: Instant) -> Vec<CacheKey> {
        let expired: Vec<CacheKey> = self
            .gc_queue
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.gc_queue.remove(key);
        }
        expired
    }

    pub fn pending_eviction(&self) -> usize {
        self.gc_queue.len()
    }
}
