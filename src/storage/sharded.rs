// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client-side sharding over several cache instances.
//!
//! Every atomic op is routed by its counter key, so a counter and the
//! sync-set entry it writes always live on the same instance. Each instance
//! therefore carries its own copy of every slot's sync set, and background
//! scanning runs one [`SyncScanner`](crate::SyncScanner) per instance
//! (see [`shards`](ShardedCounterCache::shards)).

use std::sync::Arc;

use async_trait::async_trait;

use super::traits::{CounterCache, RawFields, ShardCache, StorageError, Update, UpdateOutcome};
use crate::counter::keys::stable_hash;

pub struct ShardedCounterCache {
    shards: Vec<Arc<dyn ShardCache>>,
}

impl ShardedCounterCache {
    pub fn new(shards: Vec<Arc<dyn ShardCache>>) -> Result<Self, StorageError> {
        if shards.is_empty() {
            return Err(StorageError::InvalidArgument("at least one shard is required".into()));
        }
        Ok(Self { shards })
    }

    pub fn shards(&self) -> &[Arc<dyn ShardCache>] {
        &self.shards
    }

    /// Index of the instance owning `routing_key`.
    pub fn shard_index(&self, routing_key: &str) -> usize {
        (stable_hash(routing_key) % self.shards.len() as u64) as usize
    }

    #[inline]
    fn route(&self, routing_key: &str) -> &dyn ShardCache {
        self.shards[self.shard_index(routing_key)].as_ref()
    }
}

#[async_trait]
impl CounterCache for ShardedCounterCache {
    async fn update(&self, update: &Update<'_>) -> Result<UpdateOutcome, StorageError> {
        self.route(update.counter_key).update(update).await
    }

    async fn touch_and_read_all(
        &self,
        counter_key: &str,
        sync_set_key: &str,
        now_ms: i64,
    ) -> Result<RawFields, StorageError> {
        self.route(counter_key)
            .touch_and_read_all(counter_key, sync_set_key, now_ms)
            .await
    }

    async fn delete(&self, counter_key: &str, sync_set_key: &str) -> Result<(), StorageError> {
        self.route(counter_key).delete(counter_key, sync_set_key).await
    }

    async fn mark_synced(
        &self,
        counter_key: &str,
        sync_version: i64,
        now_ms: i64,
    ) -> Result<bool, StorageError> {
        self.route(counter_key)
            .mark_synced(counter_key, sync_version, now_ms)
            .await
    }

    async fn try_evict(
        &self,
        counter_key: &str,
        sync_set_key: &str,
        expected_write_version: i64,
    ) -> Result<bool, StorageError> {
        self.route(counter_key)
            .try_evict(counter_key, sync_set_key, expected_write_version)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryCounterCache;
    use crate::storage::traits::{Fields, SyncIndex};

    #[tokio::test]
    async fn test_routes_counter_and_sync_set_together() {
        let shards: Vec<Arc<InMemoryCounterCache>> =
            (0..3).map(|_| Arc::new(InMemoryCounterCache::new())).collect();
        let sharded = ShardedCounterCache::new(
            shards.iter().map(|s| s.clone() as Arc<dyn ShardCache>).collect(),
        )
        .unwrap();

        let deltas: Fields = [("a".to_string(), 1)].into();
        let empty = Fields::new();
        for i in 0..30 {
            let key = format!("c:h:{}", i);
            sharded
                .update(&Update {
                    counter_key: &key,
                    sync_set_key: "c:z.sync:0",
                    now_ms: 100,
                    init: true,
                    seed: &empty,
                    deltas: &deltas,
                    ttl_ms: None,
                })
                .await
                .unwrap();

            let owner = &shards[sharded.shard_index(&key)];
            assert!(owner.contains(&key));
        }

        let total: usize = shards.iter().map(|s| s.len()).sum();
        assert_eq!(total, 30);

        let mut members = 0;
        for shard in &shards {
            members += shard.slot_len("c:z.sync:0").await.unwrap();
        }
        assert_eq!(members, 30);
        assert!(shards.iter().all(|s| !s.is_empty()));
    }

    #[test]
    fn test_requires_a_shard() {
        assert!(ShardedCounterCache::new(vec![]).is_err());
    }
}
