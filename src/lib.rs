// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Counter Cache
//!
//! A write-behind counter cache: named integer counters live in Redis for
//! low-latency increments and reads, and are synced to a durable SQL backend
//! in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 CounterStore (foreground)                   │
//! │  • incr / get / del                                         │
//! │  • Lazy seed from the durable backend on cold miss          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  (atomic Lua scripts)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Redis (hot counters)                        │
//! │  • {prefix}h:{id}          hash: fields + _w/_s/_st         │
//! │  • {prefix}z.sync:{slot}   sorted set: key → last access    │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │  (scan every interval)
//! ┌─────────────────────────────────────────────────────────────┐
//! │         SyncScheduler → SyncScanner (one per shard)         │
//! │  • Persist dirty counters (_s < _w), throttled              │
//! │  • Evict idle counters and enforce per-slot capacity        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Durable backend (SQLite/MySQL)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use counter_cache::{
//!     CounterCacheConfig, CounterStore, CounterSchema, RedisCounterCache,
//!     SqlCounterArchive, SyncScanner, SyncScheduler,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CounterCacheConfig::default();
//!     let cache = Arc::new(RedisCounterCache::new("redis://localhost:6379").await?);
//!     let schema = CounterSchema::new("post_stats", "post_id")
//!         .column("views", "view_count", 0)
//!         .column("likes", "like_count", 0);
//!     let archive = Arc::new(SqlCounterArchive::new("sqlite:counters.db?mode=rwc", schema).await?);
//!
//!     let store = CounterStore::new(&config, cache.clone(), archive.clone())?;
//!     store.incr("42", &HashMap::from([("views".to_string(), 1)])).await?;
//!     println!("{:?}", store.get("42").await?);
//!
//!     let scanner = SyncScanner::new("redis-0", &config, cache, archive)?;
//!     let mut scheduler = SyncScheduler::from_config(&config, vec![scanner])?;
//!     scheduler.start()?;
//!     // ... serve traffic ...
//!     scheduler.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`counter`]: [`CounterStore`], [`SyncScanner`], [`SyncScheduler`] and key layout
//! - [`storage`]: the atomic cache contract and its Redis, sharded and in-memory
//!   implementations, plus the durable backends (SQL, in-memory)
//! - [`config`]: per-counter-family configuration
//! - [`metrics`]: `metrics` crate instrumentation
//! - [`resilience`]: connection retry

pub mod config;
pub mod counter;
pub mod metrics;
pub mod resilience;
pub mod storage;

pub use config::{ConfigError, CounterCacheConfig};
pub use counter::keys::KeySpace;
pub use counter::meta::CounterSnapshot;
pub use counter::scanner::{ScanOutcome, ScanStats, SyncPolicy, SyncScanner};
pub use counter::scheduler::SyncScheduler;
pub use counter::store::CounterStore;
pub use resilience::retry::RetryConfig;
pub use storage::memory::{InMemoryArchive, InMemoryCounterCache};
pub use storage::redis::RedisCounterCache;
pub use storage::sharded::ShardedCounterCache;
pub use storage::sql::{CounterSchema, SqlCounterArchive};
pub use storage::traits::{
    CounterArchive, CounterCache, Fields, RawFields, ShardCache, SlotEntry, StorageError,
    SyncIndex, Update, UpdateOutcome,
};
