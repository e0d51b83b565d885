//! Disk tier of the cache
//!
//! Holds a record table in memory and mirrors it to a single snapshot file.
//! Puts only touch the table and nudge a writer thread; the thread coalesces
//! pending nudges and rewrites the file atomically. `flush` writes
//! synchronously with retries so shutdown has at-least-once semantics.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::error::{ContextError, Result};
use crate::snapshot::{self, CACHE_FORMAT};

/// Where a cache entry currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Resident in the memory tier (and mirrored on disk)
    Memory,
    /// Only on disk
    Disk,
}

/// One persisted cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub tier: Tier,
    pub stored_at: DateTime<Utc>,
}

impl DiskRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

enum WriterMsg {
    Persist,
    Shutdown,
}

struct Shared {
    path: PathBuf,
    records: Mutex<HashMap<String, DiskRecord>>,
    dirty: AtomicBool,
    // serializes file writes between the writer thread and flush
    write_lock: Mutex<()>,
    max_retries: u32,
    backoff: Duration,
}

impl Shared {
    fn persist_once(&self) -> Result<()> {
        let mut records: Vec<DiskRecord> = self.records.lock().values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot::write_versioned(&self.path, CACHE_FORMAT, &records)
    }

    /// Write the table if it changed, retrying with exponential backoff
    fn persist_if_dirty(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            match self.persist_once() {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    log::warn!(
                        "Cache persistence to {} failed (attempt {}): {}",
                        self.path.display(),
                        attempt,
                        e
                    );
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    self.dirty.store(true, Ordering::Release);
                    return Err(ContextError::serialization(format!(
                        "persisting cache to {} failed after {} retries: {}",
                        self.path.display(),
                        self.max_retries,
                        e
                    )));
                }
            }
        }
    }
}

fn run_writer(shared: Arc<Shared>, mut rx: UnboundedReceiver<WriterMsg>) {
    while let Some(msg) = rx.blocking_recv() {
        if let WriterMsg::Shutdown = msg {
            break;
        }
        // coalesce a burst of puts into one write
        let mut stop = false;
        loop {
            match rx.try_recv() {
                Ok(WriterMsg::Persist) => continue,
                Ok(WriterMsg::Shutdown) => {
                    stop = true;
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if let Err(e) = shared.persist_if_dirty() {
            log::warn!("Background cache write failed: {}", e);
        }
        if stop {
            break;
        }
    }
    log::debug!("Cache writer for {} stopped", shared.path.display());
}

/// Persistent record table with an asynchronous writer
pub struct DiskTier {
    shared: Arc<Shared>,
    capacity: usize,
    tx: UnboundedSender<WriterMsg>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl DiskTier {
    /// Open the tier at `path`, loading unexpired records from a previous run
    ///
    /// A missing file starts empty. An unreadable file is logged and
    /// replaced, since the cache can always be rebuilt.
    pub fn open(
        path: impl Into<PathBuf>,
        capacity: usize,
        max_retries: u32,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let path = path.into();
        let loaded = match snapshot::read_versioned::<Vec<DiskRecord>>(&path, CACHE_FORMAT) {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                log::warn!(
                    "Discarding unreadable cache file {}: {}",
                    path.display(),
                    e
                );
                Vec::new()
            }
        };

        let total = loaded.len();
        let records: HashMap<String, DiskRecord> = loaded
            .into_iter()
            .filter(|r| !r.is_expired(now))
            .map(|mut r| {
                r.tier = Tier::Disk;
                (r.key.clone(), r)
            })
            .collect();
        if total > 0 {
            log::info!(
                "Loaded {} cache records from {} ({} expired)",
                records.len(),
                path.display(),
                total - records.len()
            );
        }

        let shared = Arc::new(Shared {
            path,
            records: Mutex::new(records),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            max_retries,
            backoff,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Arc::clone(&shared);
        let writer = std::thread::Builder::new()
            .name("context-cache-writer".into())
            .spawn(move || run_writer(worker, rx))?;

        Ok(Self {
            shared,
            capacity,
            tx,
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn len(&self) -> usize {
        self.shared.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mark_dirty(&self) {
        self.shared.dirty.store(true, Ordering::Release);
        if self.tx.send(WriterMsg::Persist).is_err() {
            log::debug!("Cache writer gone; change will persist on flush");
        }
    }

    /// Unexpired record for `key`; expired records are dropped on sight
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<DiskRecord> {
        let mut records = self.shared.records.lock();
        match records.get(key) {
            Some(record) if record.is_expired(now) => {
                records.remove(key);
                drop(records);
                self.mark_dirty();
                None
            }
            Some(record) => Some(record.clone()),
            None => None,
        }
    }

    /// Insert or replace a record, evicting the oldest if full
    pub fn put(&self, record: DiskRecord) {
        {
            let mut records = self.shared.records.lock();
            if !records.contains_key(&record.key) && records.len() >= self.capacity {
                let oldest = records
                    .values()
                    .min_by(|a, b| a.stored_at.cmp(&b.stored_at).then_with(|| a.key.cmp(&b.key)))
                    .map(|r| r.key.clone());
                if let Some(oldest) = oldest {
                    records.remove(&oldest);
                }
            }
            if self.capacity > 0 {
                records.insert(record.key.clone(), record);
            }
        }
        self.mark_dirty();
    }

    /// Update the tier marker of a record
    pub fn set_tier(&self, key: &str, tier: Tier) {
        let changed = match self.shared.records.lock().get_mut(key) {
            Some(record) if record.tier != tier => {
                record.tier = tier;
                true
            }
            _ => false,
        };
        if changed {
            self.mark_dirty();
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        let removed = self.shared.records.lock().remove(key).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    /// Remove every record whose key starts with `prefix`
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let removed = {
            let mut records = self.shared.records.lock();
            let before = records.len();
            records.retain(|key, _| !key.starts_with(prefix));
            before - records.len()
        };
        if removed > 0 {
            self.mark_dirty();
        }
        removed
    }

    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let removed = {
            let mut records = self.shared.records.lock();
            let before = records.len();
            records.retain(|_, record| !record.is_expired(now));
            before - records.len()
        };
        if removed > 0 {
            self.mark_dirty();
        }
        removed
    }

    /// Write pending changes now, surfacing failure once retries run out
    pub fn flush(&self) -> Result<()> {
        self.shared.persist_if_dirty()
    }

    /// Stop the writer thread and flush whatever it had not written
    pub fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.writer.lock().take() {
            let _ = self.tx.send(WriterMsg::Shutdown);
            if handle.join().is_err() {
                log::warn!("Cache writer thread panicked");
            }
        }
        self.flush()
    }
}

impl Drop for DiskTier {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Cache flush on drop failed: {}", e);
        }
    }
}
