//! Recommendation page cache
//!
//! An optional read-through layer in front of the recommendation store.
//! Values are serialized pages; keys are grouped per subject under
//! [`subject_prefix`] so a write can drop everything a subject might read.
//! The database stays the source of truth.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::db::models::{RecommendationStatus, SubjectId, SubjectType};

/// Key prefix shared by every cached page of a subject
pub fn subject_prefix(subject_type: SubjectType, subject_id: SubjectId) -> String {
    format!("recs:{}:{}:", subject_type, subject_id)
}

/// Key of one cached page
pub fn page_key(
    subject_type: SubjectType,
    subject_id: SubjectId,
    status: Option<RecommendationStatus>,
    page: u32,
    size: u32,
) -> String {
    format!(
        "{}{}:{}:{}",
        subject_prefix(subject_type, subject_id),
        status.map(|s| s.as_str()).unwrap_or("all"),
        page,
        size
    )
}

/// Cache port
pub trait RecommendationCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String);

    /// Remove every key starting with `prefix`, returning how many went
    fn invalidate_prefix(&self, prefix: &str) -> usize;
}

/// Cache that stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

impl RecommendationCache for NoopCache {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn set(&self, _key: &str, _value: String) {}

    fn invalidate_prefix(&self, _prefix: &str) -> usize {
        0
    }
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Process-local cache with a fixed TTL
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Drop expired entries
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

impl RecommendationCache for InMemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone());

        match hit {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.entries.remove_if(key, |_, entry| entry.expires_at <= Instant::now());
                None
            }
        }
    }

    fn set(&self, key: &str, value: String) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn invalidate_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(prefix, removed, "Invalidated cached pages");
        }
        removed
    }
}
