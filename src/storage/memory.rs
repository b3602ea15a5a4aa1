// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process stores for embedding and tests.
//!
//! [`InMemoryCounterCache`] reproduces the Redis script semantics exactly;
//! one mutex over all hashes and sync sets makes every call atomic, which is
//! what the Lua scripts guarantee on a real server.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{
    CounterArchive, CounterCache, Fields, RawFields, SlotEntry, StorageError, SyncIndex, Update,
    UpdateOutcome,
};
use crate::counter::keys::{SYNC_TIMESTAMP, SYNC_VERSION, WRITE_VERSION};

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    order: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn upsert(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&(old, member.to_string()));
        }
        self.order.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.order.remove(&(old, member.to_string()));
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct State {
    hashes: HashMap<String, HashMap<String, i64>>,
    expiry: HashMap<String, Instant>,
    sets: HashMap<String, SortedSet>,
}

impl State {
    /// Drop the hash if its TTL passed (sync-set members are left behind, like Redis).
    fn expire(&mut self, key: &str) {
        if let Some(deadline) = self.expiry.get(key) {
            if *deadline <= Instant::now() {
                self.expiry.remove(key);
                self.hashes.remove(key);
            }
        }
    }

    fn zadd(&mut self, set: &str, member: &str, score: i64) {
        self.sets.entry(set.to_string()).or_default().upsert(member, score);
    }

    fn zrem(&mut self, set: &str, member: &str) -> bool {
        let removed = self.sets.get_mut(set).is_some_and(|s| s.remove(member));
        if self.sets.get(set).is_some_and(|s| s.scores.is_empty()) {
            self.sets.remove(set);
        }
        removed
    }

    fn del(&mut self, key: &str) {
        self.hashes.remove(key);
        self.expiry.remove(key);
    }

    fn raw(&mut self, key: &str) -> RawFields {
        self.expire(key);
        self.hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.to_string())).collect())
            .unwrap_or_default()
    }
}

/// Single-instance in-memory cache with the same atomic semantics as Redis.
#[derive(Default)]
pub struct InMemoryCounterCache {
    state: Mutex<State>,
}

impl InMemoryCounterCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counter hashes held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().hashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, counter_key: &str) -> bool {
        let mut state = self.state.lock();
        state.expire(counter_key);
        state.hashes.contains_key(counter_key)
    }

    /// Raw value of one hash field, metadata included.
    #[must_use]
    pub fn field(&self, counter_key: &str, field: &str) -> Option<i64> {
        self.state.lock().hashes.get(counter_key).and_then(|h| h.get(field).copied())
    }

    /// Members of a sync set in scan order.
    #[must_use]
    pub fn slot_members(&self, sync_set_key: &str) -> Vec<SlotEntry> {
        self.state
            .lock()
            .sets
            .get(sync_set_key)
            .map(|s| {
                s.order
                    .iter()
                    .map(|(score, key)| SlotEntry { key: key.clone(), last_access_ms: *score })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrite one raw hash field, bypassing the scripts.
    pub fn set_field(&self, counter_key: &str, field: &str, value: i64) {
        self.state
            .lock()
            .hashes
            .entry(counter_key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    /// Remove one raw hash field, bypassing the scripts.
    pub fn remove_field(&self, counter_key: &str, field: &str) {
        if let Some(hash) = self.state.lock().hashes.get_mut(counter_key) {
            hash.remove(field);
        }
    }

    /// Set or overwrite a sync-set score, bypassing the scripts.
    pub fn set_slot_score(&self, sync_set_key: &str, counter_key: &str, score: i64) {
        self.state.lock().zadd(sync_set_key, counter_key, score);
    }
}

#[async_trait]
impl CounterCache for InMemoryCounterCache {
    async fn update(&self, update: &Update<'_>) -> Result<UpdateOutcome, StorageError> {
        let mut state = self.state.lock();
        state.expire(update.counter_key);
        let existed = state.hashes.contains_key(update.counter_key);

        if !existed && !update.init {
            return Ok(UpdateOutcome { existed: false, applied: false });
        }
        if existed && update.init && update.deltas.is_empty() {
            state.zadd(update.sync_set_key, update.counter_key, update.now_ms);
            return Ok(UpdateOutcome { existed: true, applied: true });
        }

        // Every new value is computed before anything is written
        let current = state.hashes.get(update.counter_key);
        let mut totals = Vec::with_capacity(update.deltas.len());
        for (field, delta) in update.deltas {
            let base = match current {
                Some(hash) => hash.get(field),
                None => update.seed.get(field),
            };
            let total = base.copied().unwrap_or(0).checked_add(*delta).ok_or_else(|| {
                StorageError::InvalidArgument(format!(
                    "increment of {} by {} overflows on {}",
                    field, delta, update.counter_key
                ))
            })?;
            totals.push((field.clone(), total));
        }

        let hash = state.hashes.entry(update.counter_key.to_string()).or_default();
        let prev = hash.get(WRITE_VERSION).copied().unwrap_or(0);
        let write_version = update.now_ms.max(prev.saturating_add(1));

        if !existed {
            for (field, value) in update.seed {
                hash.insert(field.clone(), *value);
            }
        }
        hash.extend(totals);
        hash.insert(WRITE_VERSION.to_string(), write_version);
        if !existed {
            let sync_version = if update.deltas.is_empty() { write_version } else { write_version - 1 };
            hash.insert(SYNC_VERSION.to_string(), sync_version);
            hash.insert(SYNC_TIMESTAMP.to_string(), update.now_ms);
        }

        if let Some(deadline) = update
            .ttl_ms
            .and_then(|ttl| Instant::now().checked_add(Duration::from_millis(ttl)))
        {
            state.expiry.insert(update.counter_key.to_string(), deadline);
        }
        state.zadd(update.sync_set_key, update.counter_key, update.now_ms);
        Ok(UpdateOutcome { existed: true, applied: true })
    }

    async fn touch_and_read_all(
        &self,
        counter_key: &str,
        sync_set_key: &str,
        now_ms: i64,
    ) -> Result<RawFields, StorageError> {
        let mut state = self.state.lock();
        let raw = state.raw(counter_key);
        if !raw.is_empty() {
            state.zadd(sync_set_key, counter_key, now_ms);
        }
        Ok(raw)
    }

    async fn delete(&self, counter_key: &str, sync_set_key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.del(counter_key);
        state.zrem(sync_set_key, counter_key);
        Ok(())
    }

    async fn mark_synced(
        &self,
        counter_key: &str,
        sync_version: i64,
        now_ms: i64,
    ) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        state.expire(counter_key);
        let Some(hash) = state.hashes.get_mut(counter_key) else {
            return Ok(false);
        };
        let current = hash.get(SYNC_VERSION).copied().unwrap_or(0);
        if sync_version < current {
            return Ok(false);
        }
        hash.insert(SYNC_VERSION.to_string(), sync_version);
        hash.insert(SYNC_TIMESTAMP.to_string(), now_ms);
        Ok(true)
    }

    async fn try_evict(
        &self,
        counter_key: &str,
        sync_set_key: &str,
        expected_write_version: i64,
    ) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        state.expire(counter_key);
        let Some(hash) = state.hashes.get(counter_key) else {
            state.zrem(sync_set_key, counter_key);
            return Ok(false);
        };
        let write_version = hash.get(WRITE_VERSION).copied();
        let sync_version = hash.get(SYNC_VERSION).copied().unwrap_or(0);
        match write_version {
            Some(w) if w == expected_write_version && sync_version >= w => {
                state.del(counter_key);
                state.zrem(sync_set_key, counter_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl SyncIndex for InMemoryCounterCache {
    async fn read_all(&self, counter_key: &str) -> Result<RawFields, StorageError> {
        Ok(self.state.lock().raw(counter_key))
    }

    async fn slot_len(&self, sync_set_key: &str) -> Result<u64, StorageError> {
        Ok(self
            .state
            .lock()
            .sets
            .get(sync_set_key)
            .map_or(0, |s| s.scores.len() as u64))
    }

    async fn slot_page(
        &self,
        sync_set_key: &str,
        after: Option<&SlotEntry>,
        limit: usize,
    ) -> Result<Vec<SlotEntry>, StorageError> {
        let state = self.state.lock();
        let Some(set) = state.sets.get(sync_set_key) else {
            return Ok(vec![]);
        };
        let lower = match after {
            Some(entry) => Bound::Excluded((entry.last_access_ms, entry.key.clone())),
            None => Bound::Unbounded,
        };
        Ok(set
            .order
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(score, key)| SlotEntry { key: key.clone(), last_access_ms: *score })
            .collect())
    }

    async fn slot_remove(&self, sync_set_key: &str, counter_key: &str) -> Result<bool, StorageError> {
        Ok(self.state.lock().zrem(sync_set_key, counter_key))
    }
}

/// Durable backend kept in a `DashMap`. Missing ids load as `defaults`.
pub struct InMemoryArchive {
    data: DashMap<String, Fields>,
    defaults: Fields,
    loads: AtomicU64,
    stores: AtomicU64,
}

impl InMemoryArchive {
    #[must_use]
    pub fn new(defaults: Fields) -> Self {
        Self {
            data: DashMap::new(),
            defaults,
            loads: AtomicU64::new(0),
            stores: AtomicU64::new(0),
        }
    }

    /// Seed a record directly.
    pub fn insert(&self, id: &str, fields: Fields) {
        self.data.insert(id.to_string(), fields);
    }

    /// The stored record, without falling back to defaults.
    #[must_use]
    pub fn stored(&self, id: &str) -> Option<Fields> {
        self.data.get(id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn store_count(&self) -> u64 {
        self.stores.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryArchive {
    fn default() -> Self {
        Self::new(Fields::new())
    }
}

#[async_trait]
impl CounterArchive for InMemoryArchive {
    async fn load(&self, id: &str) -> Result<Fields, StorageError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .data
            .get(id)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| self.defaults.clone()))
    }

    async fn store(&self, id: &str, fields: &Fields) -> Result<(), StorageError> {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.data.insert(id.to_string(), fields.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(id).is_some())
    }
}
