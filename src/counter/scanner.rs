// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background sync and eviction for one cache instance.
//!
//! A pass walks every slot's sync set in `(last access, key)` order, in
//! pages of [`BATCH_SIZE`]. Each page resumes strictly after the last entry
//! seen, so members removed mid-pass (by this pass or anyone else) never
//! shift unvisited members out of reach. A member re-touched mid-pass moves
//! to the tail and is skipped when it comes around again. Each slot pass
//! reads a bounded number of pages, so a slot under constant traffic
//! cannot hold the scanner.
//!
//! Per entry:
//!
//! | Condition                                              | Action                |
//! |--------------------------------------------------------|-----------------------|
//! | hash missing, metadata incomplete, or key not ours     | drop from sync set    |
//! | dirty and (`_st` old enough or `_w - _s` large enough) | store, mark synced    |
//! | idle past `evict_interval` or slot over capacity       | store if dirty, evict |
//!
//! Eviction goes through `try_evict` with the write version that was
//! stored, so a counter written after it was read is never evicted.
//!
//! A cache or archive error aborts the current slot only; the next pass
//! retries it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use super::keys::KeySpace;
use super::meta::CounterSnapshot;
use super::now_ms;
use crate::config::CounterCacheConfig;
use crate::metrics;
use crate::storage::traits::{
    CounterArchive, CounterCache, ShardCache, SlotEntry, StorageError, SyncIndex,
};

/// Sync-set members fetched per round-trip.
pub const BATCH_SIZE: usize = 30;

/// Extra pages a slot pass may read beyond its starting size.
pub const PAGE_SLACK: u64 = 2;

/// Upper bound on pages read by one slot pass.
fn page_budget(slot_len: u64) -> u64 {
    slot_len.div_ceil(BATCH_SIZE as u64).saturating_add(PAGE_SLACK)
}

/// Sync and eviction thresholds, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub min_sync_version_changes: i64,
    pub min_sync_interval_ms: i64,
    pub evict_interval_ms: i64,
    pub slot_max_items: u64,
}

impl SyncPolicy {
    pub fn from_config(config: &CounterCacheConfig) -> Self {
        Self {
            min_sync_version_changes: config.min_sync_version_changes,
            min_sync_interval_ms: secs_to_ms(config.min_sync_interval_secs),
            evict_interval_ms: secs_to_ms(config.evict_interval_secs),
            slot_max_items: config.slot_max_items,
        }
    }

    /// Dirty, and either the last sync is old enough or enough writes piled up.
    pub fn needs_sync(&self, snapshot: &CounterSnapshot, now_ms: i64) -> bool {
        snapshot.is_dirty()
            && (now_ms - snapshot.sync_timestamp >= self.min_sync_interval_ms
                || snapshot.write_version - snapshot.sync_version >= self.min_sync_version_changes)
    }

    pub fn is_idle(&self, last_access_ms: i64, now_ms: i64) -> bool {
        now_ms - last_access_ms >= self.evict_interval_ms
    }

    /// Members to evict beyond idle ones for a slot of `slot_len`.
    pub fn over_capacity(&self, slot_len: u64) -> u64 {
        slot_len.saturating_sub(self.slot_max_items)
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Counts for one pass (or one slot).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub visited: u64,
    pub synced: u64,
    pub evicted: u64,
    pub orphans: u64,
    pub slots_scanned: u32,
    pub slots_failed: u32,
}

impl ScanStats {
    fn merge(&mut self, other: &ScanStats) {
        self.visited += other.visited;
        self.synced += other.synced;
        self.evicted += other.evicted;
        self.orphans += other.orphans;
        self.slots_scanned += other.slots_scanned;
        self.slots_failed += other.slots_failed;
    }
}

/// Result of a full pass: totals plus the slots that were aborted.
#[derive(Debug)]
pub struct ScanOutcome {
    pub scanner: String,
    pub stats: ScanStats,
    pub failures: Vec<(u32, StorageError)>,
    /// The pass ended early on a stop request
    pub stopped: bool,
}

impl ScanOutcome {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Scans the sync sets of one cache instance.
pub struct SyncScanner {
    name: String,
    keys: KeySpace,
    policy: SyncPolicy,
    cache: Arc<dyn ShardCache>,
    archive: Arc<dyn CounterArchive>,
    stop: Arc<AtomicBool>,
}

impl SyncScanner {
    /// Fails fast on an invalid config. `name` labels logs (e.g. "redis-0").
    pub fn new(
        name: &str,
        config: &CounterCacheConfig,
        cache: Arc<dyn ShardCache>,
        archive: Arc<dyn CounterArchive>,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        Ok(Self {
            name: name.to_string(),
            keys: KeySpace::new(&config.prefix, config.slots_count)?,
            policy: SyncPolicy::from_config(config),
            cache,
            archive,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Ask a running pass to finish its current entry and return.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn reset_stop(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// One pass over every slot. Slot failures are collected, not fatal.
    #[instrument(skip(self), fields(scanner = %self.name))]
    pub async fn scan(&self) -> ScanOutcome {
        let started = Instant::now();
        let mut stats = ScanStats::default();
        let mut failures = Vec::new();
        let mut stopped = false;

        for slot in 0..self.keys.slots_count() {
            if self.is_stopped() {
                stopped = true;
                break;
            }
            match self.scan_slot(slot).await {
                Ok(slot_stats) => stats.merge(&slot_stats),
                Err(e) => {
                    warn!(scanner = %self.name, slot, error = %e, "Slot scan aborted");
                    metrics::record_error("scanner", e.kind());
                    stats.slots_failed += 1;
                    failures.push((slot, e));
                }
            }
        }
        stopped |= self.is_stopped();

        metrics::record_scan_duration(started.elapsed());
        info!(
            scanner = %self.name,
            visited = stats.visited,
            synced = stats.synced,
            evicted = stats.evicted,
            orphans = stats.orphans,
            slots_failed = stats.slots_failed,
            stopped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Scan pass complete"
        );

        ScanOutcome {
            scanner: self.name.clone(),
            stats,
            failures,
            stopped,
        }
    }

    /// Scan one slot end to end. Stops between entries on a stop request.
    ///
    /// The pass is bounded: it reads at most the pages the slot held when
    /// the pass began (plus [`PAGE_SLACK`]), and it ends early on a full
    /// page of already-visited members touched after the pass began.
    /// Members pushed past that bound are picked up by the next pass.
    pub async fn scan_slot(&self, slot: u32) -> Result<ScanStats, StorageError> {
        let sync_set_key = self.keys.slot_key(slot);
        let pass_started_ms = now_ms();
        let slot_len = self.cache.slot_len(&sync_set_key).await?;
        metrics::set_slot_items(slot, slot_len);

        let mut stats = ScanStats::default();
        let mut over_capacity = self.policy.over_capacity(slot_len);
        if over_capacity > 0 {
            debug!(scanner = %self.name, slot, slot_len, over_capacity, "Slot over capacity");
        }

        let page_budget = page_budget(slot_len);
        let mut pages = 0u64;
        let mut visited: HashSet<String> = HashSet::new();
        let mut cursor: Option<SlotEntry> = None;
        let mut completed = true;

        'pages: loop {
            if self.is_stopped() {
                completed = false;
                break;
            }
            if pages >= page_budget {
                debug!(scanner = %self.name, slot, pages, "Page budget spent, deferring rest of slot");
                break;
            }
            if pages > 0 {
                tokio::task::yield_now().await;
            }
            let page = self
                .cache
                .slot_page(&sync_set_key, cursor.as_ref(), BATCH_SIZE)
                .await?;
            pages += 1;
            let Some(last) = page.last().cloned() else {
                break;
            };

            let mut fresh = 0usize;
            for entry in &page {
                if self.is_stopped() {
                    completed = false;
                    break 'pages;
                }
                if !visited.insert(entry.key.clone()) {
                    continue;
                }
                fresh += 1;
                self.process_entry(&sync_set_key, entry, &mut over_capacity, &mut stats)
                    .await?;
            }

            if page.len() < BATCH_SIZE {
                break;
            }
            // Only re-touched members ahead of the cursor
            if fresh == 0 && page[0].last_access_ms >= pass_started_ms {
                debug!(scanner = %self.name, slot, "Reached members touched during the pass");
                break;
            }
            cursor = Some(last);
        }

        if completed {
            stats.slots_scanned = 1;
        }
        Ok(stats)
    }

    async fn process_entry(
        &self,
        sync_set_key: &str,
        entry: &SlotEntry,
        over_capacity: &mut u64,
        stats: &mut ScanStats,
    ) -> Result<(), StorageError> {
        stats.visited += 1;

        let counter_id = match self.keys.counter_id(&entry.key) {
            Some(id) if self.keys.sync_set_key(&entry.key) == sync_set_key => id,
            _ => {
                warn!(scanner = %self.name, key = %entry.key, "Foreign key in sync set");
                return self.remove_orphan(sync_set_key, &entry.key, stats).await;
            }
        };

        let raw = self.cache.read_all(&entry.key).await?;
        let snapshot = match CounterSnapshot::parse(raw) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(scanner = %self.name, key = %entry.key, "Counter gone, dropping from sync set");
                return self.remove_orphan(sync_set_key, &entry.key, stats).await;
            }
            Err(e) => {
                warn!(scanner = %self.name, key = %entry.key, error = %e, "Corrupt counter, dropping from sync set");
                return self.remove_orphan(sync_set_key, &entry.key, stats).await;
            }
        };

        let now = now_ms();
        let idle = self.policy.is_idle(entry.last_access_ms, now);
        let need_evict = idle || *over_capacity > 0;
        let need_sync =
            (need_evict && snapshot.is_dirty()) || self.policy.needs_sync(&snapshot, now);

        if need_sync {
            self.archive.store(counter_id, &snapshot.fields).await?;
            let marked = self
                .cache
                .mark_synced(&entry.key, snapshot.write_version, now)
                .await?;
            stats.synced += 1;
            metrics::record_synced();
            if !marked {
                // Deleted (or synced further) while we were storing
                debug!(scanner = %self.name, key = %entry.key, "Sync not marked");
                return Ok(());
            }
        }

        if need_evict
            && self
                .cache
                .try_evict(&entry.key, sync_set_key, snapshot.write_version)
                .await?
        {
            stats.evicted += 1;
            *over_capacity = over_capacity.saturating_sub(1);
            metrics::record_evicted(if idle { "idle" } else { "capacity" });
        }
        Ok(())
    }

    async fn remove_orphan(
        &self,
        sync_set_key: &str,
        counter_key: &str,
        stats: &mut ScanStats,
    ) -> Result<(), StorageError> {
        if self.cache.slot_remove(sync_set_key, counter_key).await? {
            stats.orphans += 1;
            metrics::record_orphan();
        }
        Ok(())
    }
}
