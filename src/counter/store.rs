// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Foreground counter API.
//!
//! Every call is one or two atomic cache round-trips; nothing here takes a
//! local lock. Concurrent callers on the same counter are serialized by the
//! cache's atomic procedures alone.
//!
//! # Cold increments
//!
//! ```text
//! incr ──► update(init=false) ──► applied? ──► done
//!                                    │ no (counter not cached)
//!                                    ▼
//!                        archive.load(id)  (seed)
//!                                    │
//!                                    ▼
//!                        update(init=true, seed) ──► applied? ──► done
//!                                                      │ no
//!                                                      ▼
//!                                               InitRace (caller retries)
//! ```
//!
//! Two first writers may both load the seed; the cache creates the counter
//! once and the loser's deltas are applied on top.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::keys::{is_reserved, KeySpace};
use super::meta::visible_fields;
use super::now_ms;
use crate::config::CounterCacheConfig;
use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::{CounterArchive, CounterCache, Fields, StorageError, Update};

/// Longest key TTL passed to the cache; Redis rejects expiries past `i64` millis.
const MAX_TTL_MS: u64 = (i64::MAX / 2) as u64;

/// Low-latency increments and reads over a write-behind cache.
pub struct CounterStore {
    keys: KeySpace,
    ttl_ms: Option<u64>,
    cache: Arc<dyn CounterCache>,
    archive: Arc<dyn CounterArchive>,
}

impl CounterStore {
    /// Fails fast on an invalid config.
    pub fn new(
        config: &CounterCacheConfig,
        cache: Arc<dyn CounterCache>,
        archive: Arc<dyn CounterArchive>,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        Ok(Self {
            keys: KeySpace::new(&config.prefix, config.slots_count)?,
            ttl_ms: config
                .key_ttl_secs
                .map(|secs| secs.saturating_mul(1000).min(MAX_TTL_MS)),
            cache,
            archive,
        })
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Add `deltas` to the counter's fields, seeding it from the archive on a cold miss.
    ///
    /// Returns [`StorageError::InitRace`] if the seeded create did not
    /// apply; the increment was not recorded and may be retried.
    #[instrument(skip(self, deltas), fields(fields = deltas.len()))]
    pub async fn incr(&self, counter_id: &str, deltas: &Fields) -> Result<(), StorageError> {
        let _timer = LatencyTimer::new("incr");
        let result = self.incr_inner(counter_id, deltas).await;
        observe("incr", &result);
        result
    }

    async fn incr_inner(&self, counter_id: &str, deltas: &Fields) -> Result<(), StorageError> {
        if deltas.is_empty() {
            return Err(StorageError::InvalidArgument("no fields to increment".into()));
        }
        if let Some(field) = deltas.keys().find(|f| f.is_empty() || is_reserved(f)) {
            return Err(StorageError::InvalidArgument(format!(
                "'{}' is not a valid counter field",
                field
            )));
        }

        let counter_key = self.keys.counter_key(counter_id)?;
        let sync_set_key = self.keys.sync_set_key(&counter_key);
        let empty = Fields::new();

        let outcome = self
            .cache
            .update(&Update {
                counter_key: &counter_key,
                sync_set_key: &sync_set_key,
                now_ms: now_ms(),
                init: false,
                seed: &empty,
                deltas,
                ttl_ms: self.ttl_ms,
            })
            .await?;
        if outcome.applied {
            return Ok(());
        }

        debug!(counter_id = %counter_id, "Cold increment, loading seed");
        let seed = self.load_seed(counter_id).await?;
        let outcome = self
            .cache
            .update(&Update {
                counter_key: &counter_key,
                sync_set_key: &sync_set_key,
                now_ms: now_ms(),
                init: true,
                seed: &seed,
                deltas,
                ttl_ms: self.ttl_ms,
            })
            .await?;
        if !outcome.applied {
            return Err(StorageError::InitRace(counter_id.to_string()));
        }
        Ok(())
    }

    /// Current field values, reloading from the archive on a cold miss.
    ///
    /// Returns [`StorageError::NotFound`] when the archive has no fields
    /// for the counter either.
    #[instrument(skip(self))]
    pub async fn get(&self, counter_id: &str) -> Result<Fields, StorageError> {
        let _timer = LatencyTimer::new("get");
        let result = self.get_inner(counter_id).await;
        observe("get", &result);
        result
    }

    async fn get_inner(&self, counter_id: &str) -> Result<Fields, StorageError> {
        let counter_key = self.keys.counter_key(counter_id)?;
        let sync_set_key = self.keys.sync_set_key(&counter_key);

        let raw = self
            .cache
            .touch_and_read_all(&counter_key, &sync_set_key, now_ms())
            .await?;
        if !raw.is_empty() {
            return visible_fields(raw).map_err(|e| e.into_storage(&counter_key));
        }

        let fields = self.load_seed(counter_id).await?;
        if fields.is_empty() {
            return Err(StorageError::NotFound(counter_id.to_string()));
        }

        // Best-effort warm; the loaded fields are the answer either way
        let empty = Fields::new();
        let warm = self
            .cache
            .update(&Update {
                counter_key: &counter_key,
                sync_set_key: &sync_set_key,
                now_ms: now_ms(),
                init: true,
                seed: &fields,
                deltas: &empty,
                ttl_ms: self.ttl_ms,
            })
            .await;
        if let Err(e) = warm {
            warn!(counter_id = %counter_id, error = %e, "Failed to warm cache after cold read");
            metrics::record_error("store", "warm");
        }

        Ok(fields)
    }

    /// Delete from the archive, then from the cache.
    ///
    /// The archive goes first: if it fails the cached copy is kept, so a
    /// background sync cannot bring back a counter the caller believes is gone.
    #[instrument(skip(self))]
    pub async fn del(&self, counter_id: &str) -> Result<(), StorageError> {
        let _timer = LatencyTimer::new("del");
        let result = self.del_inner(counter_id).await;
        observe("del", &result);
        result
    }

    async fn del_inner(&self, counter_id: &str) -> Result<(), StorageError> {
        let counter_key = self.keys.counter_key(counter_id)?;
        let sync_set_key = self.keys.sync_set_key(&counter_key);

        let deleted = self.archive.delete(counter_id).await?;
        debug!(counter_id = %counter_id, deleted, "Archive record removed");

        self.cache.delete(&counter_key, &sync_set_key).await
    }

    /// Archive fields with reserved names dropped.
    async fn load_seed(&self, counter_id: &str) -> Result<Fields, StorageError> {
        metrics::record_seed_load();
        let mut seed = self.archive.load(counter_id).await?;
        seed.retain(|field, _| !field.is_empty() && !is_reserved(field));
        Ok(seed)
    }
}

fn observe<T>(operation: &str, result: &Result<T, StorageError>) {
    match result {
        Ok(_) => metrics::record_operation(operation, "success"),
        Err(e) => {
            metrics::record_operation(operation, "error");
            metrics::record_error("store", e.kind());
        }
    }
}
