//! In-memory store using DashMap
//!
//! Same contract as [`crate::SqliteStore`] without any durability. Expired
//! entries are dropped lazily when a read runs into them.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use kvlite_core::{
    namespace_prefix, now_millis, CacheEntry, CacheError, CacheStore, EntryStream, Result,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Simple in-memory store with TTL support
pub struct MemoryStore {
    data: Arc<DashMap<String, Slot>>,
    /// Insertion counter so iteration follows first-write order
    sequence: AtomicU64,
    closed: AtomicBool,
}

struct Slot {
    seq: u64,
    entry: CacheEntry,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    /// Live entry for `key`, dropping it if it has expired
    fn live_entry(&self, key: &str, now: i64) -> Option<CacheEntry> {
        match self.data.get(key) {
            None => return None,
            Some(slot) if !slot.entry.is_expired_at(now) => return Some(slot.entry.clone()),
            Some(_) => {}
        }

        self.data
            .remove_if(key, |_, slot| slot.entry.is_expired_at(now));
        None
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        let before = self.data.len();
        self.data.retain(|_, slot| !slot.entry.is_expired_at(now));
        before.saturating_sub(self.data.len())
    }

    /// Number of entries held, including expired ones not yet dropped
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_open()?;
        Ok(self
            .live_entry(key, now_millis())
            .and_then(|entry| entry.data))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        self.ensure_open()?;
        let now = now_millis();
        Ok(keys
            .iter()
            .map(|key| self.live_entry(key, now).and_then(|entry| entry.data))
            .collect())
    }

    async fn set(
        &self,
        key: &str,
        value: Option<&str>,
        ttl_seconds: Option<f64>,
    ) -> Result<Option<String>> {
        self.ensure_open()?;
        let entry = CacheEntry::new(key, value.map(str::to_string), ttl_seconds, now_millis());
        let data = entry.data.clone();

        // Replacing keeps the original insertion slot; the shard lock is held
        // across lookup and insert so a key takes exactly one sequence number.
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut slot) => slot.get_mut().entry = entry,
            Entry::Vacant(vacant) => {
                let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Slot { seq, entry });
            }
        }

        Ok(data)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.data.remove(key).is_some())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<bool> {
        self.ensure_open()?;
        let removed = keys
            .iter()
            .filter(|key| self.data.remove(key.as_str()).is_some())
            .count();
        Ok(removed == keys.len())
    }

    async fn clear(&self, namespace: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let prefix = namespace_prefix(namespace);
        self.data.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.live_entry(key, now_millis()).is_some())
    }

    fn iter<'a>(&'a self, namespace: Option<&'a str>) -> EntryStream<'a> {
        if let Err(e) = self.ensure_open() {
            return stream::once(async move { Err(e) }).boxed();
        }

        let prefix = namespace_prefix(namespace);
        let cutoff = now_millis();
        let mut live: Vec<(u64, String, Option<String>)> = self
            .data
            .iter()
            .filter(|slot| slot.key().starts_with(&prefix) && !slot.entry.is_expired_at(cutoff))
            .map(|slot| (slot.seq, slot.key().clone(), slot.entry.data.clone()))
            .collect();
        live.sort_by_key(|(seq, _, _)| *seq);

        stream::iter(live.into_iter().map(|(_, key, data)| Ok((key, data)))).boxed()
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.data.clear();
        Ok(())
    }
}
