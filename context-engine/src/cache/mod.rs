//! Tiered key/value cache
//!
//! A fixed-capacity LRU memory tier in front of an optional disk tier. Every
//! put lands in both; a memory miss falls through to disk and promotes the
//! record back. Entries carry an absolute expiry taken from the injected
//! clock, and an expired entry is a miss whether or not it has been swept.
//!
//! The cache only ever holds copies. Dropping it (or its file) loses nothing
//! the engine cannot recompute.

mod disk;

pub use disk::{DiskRecord, DiskTier, Tier};

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::error::{ContextError, Result};
use crate::temporal::Clock;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Share of lookups answered from either tier
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Memory + disk cache with LRU eviction and TTL expiry
pub struct TieredCache {
    // `None` when configured with zero capacity
    memory: Option<Mutex<LruCache<String, MemoryEntry>>>,
    capacity: usize,
    disk: Option<DiskTier>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    /// Memory-only cache
    pub fn in_memory(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory: NonZeroUsize::new(capacity).map(|c| Mutex::new(LruCache::new(c))),
            capacity,
            disk: None,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build from config, opening the disk tier if a path is set
    pub fn open(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut cache = Self::in_memory(config.capacity, Arc::clone(&clock));
        if let Some(path) = &config.disk_path {
            cache.disk = Some(DiskTier::open(
                path,
                config.disk_capacity,
                config.max_retries,
                config.retry_backoff(),
                clock.now(),
            )?);
        }
        Ok(cache)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_disk_tier(&self) -> bool {
        self.disk.is_some()
    }

    /// Entries resident in the memory tier
    pub fn len(&self) -> usize {
        self.memory.as_ref().map_or(0, |m| m.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `key`, treating expired entries as absent
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let found = self.get_memory(key, now).or_else(|| self.get_disk(key, now));
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn get_memory(&self, key: &str, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let mut memory = self.memory.as_ref()?.lock();
        let expired = match memory.get(key) {
            Some(entry) if now < entry.expires_at => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            memory.pop(key);
        }
        None
    }

    fn get_disk(&self, key: &str, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let record = self.disk.as_ref()?.get(key, now)?;
        log::debug!("Promoting cache entry {} from disk", key);
        self.insert_memory(
            key.to_string(),
            MemoryEntry {
                value: record.value.clone(),
                expires_at: record.expires_at,
            },
        );
        Some(record.value)
    }

    /// Insert into the memory tier, demoting whatever LRU pushes out
    fn insert_memory(&self, key: String, entry: MemoryEntry) {
        let Some(memory) = &self.memory else {
            return;
        };
        let evicted = memory.lock().push(key.clone(), entry);
        if let Some(disk) = &self.disk {
            disk.set_tier(&key, Tier::Memory);
        }
        if let Some((evicted_key, _)) = evicted {
            if evicted_key != key {
                log::debug!("Evicted cache entry {} from memory", evicted_key);
                if let Some(disk) = &self.disk {
                    disk.set_tier(&evicted_key, Tier::Disk);
                }
            }
        }
    }

    /// Store `value` under `key` for `ttl`
    ///
    /// Returns once the memory tier is updated; the disk copy is written in
    /// the background.
    pub fn put(&self, key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Result<()> {
        if self.memory.is_none() {
            return Err(ContextError::CapacityExceeded);
        }
        if ttl.is_zero() {
            return Err(ContextError::invalid_input("cache ttl must be positive"));
        }
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| ContextError::invalid_input("cache ttl out of range"))?;

        let key = key.into();
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if let Some(disk) = &self.disk {
            disk.put(DiskRecord {
                key: key.clone(),
                value: value.clone(),
                expires_at,
                tier: Tier::Memory,
                stored_at: now,
            });
        }
        self.insert_memory(key, MemoryEntry { value, expires_at });
        Ok(())
    }

    /// Drop `key` from both tiers
    pub fn invalidate(&self, key: &str) -> bool {
        let in_memory = self
            .memory
            .as_ref()
            .is_some_and(|m| m.lock().pop(key).is_some());
        let on_disk = self.disk.as_ref().is_some_and(|d| d.remove(key));
        in_memory || on_disk
    }

    /// Drop every key starting with `prefix` from both tiers
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        if let Some(memory) = &self.memory {
            let mut memory = memory.lock();
            let keys: Vec<String> = memory
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                memory.pop(&key);
                removed += 1;
            }
        }
        if let Some(disk) = &self.disk {
            removed = removed.max(disk.remove_prefix(prefix));
        }
        removed
    }

    /// Reclaim expired entries; lookups never depend on this having run
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut swept = 0;
        if let Some(memory) = &self.memory {
            let mut memory = memory.lock();
            let expired: Vec<String> = memory
                .iter()
                .filter(|(_, entry)| now >= entry.expires_at)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                memory.pop(&key);
                swept += 1;
            }
        }
        if let Some(disk) = &self.disk {
            swept = swept.max(disk.sweep_expired(now));
        }
        if swept > 0 {
            log::debug!("Swept {} expired cache entries", swept);
        }
        swept
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_entries: self.len(),
            disk_entries: self.disk.as_ref().map_or(0, DiskTier::len),
            capacity: self.capacity,
        }
    }

    /// Persist pending disk-tier changes now
    pub fn flush(&self) -> Result<()> {
        match &self.disk {
            Some(disk) => disk.flush(),
            None => Ok(()),
        }
    }

    /// Stop the disk writer after a final flush
    pub fn shutdown(&self) -> Result<()> {
        match &self.disk {
            Some(disk) => disk.shutdown(),
            None => Ok(()),
        }
    }
}
