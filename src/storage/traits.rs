// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage contracts shared by the cache and durable backends.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ConfigError;

/// Caller-visible counter fields: name → value.
pub type Fields = HashMap<String, i64>;

/// Raw hash contents as stored, reserved metadata included.
pub type RawFields = Vec<(String, String)>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Counter not found: {0}")]
    NotFound(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Counter init did not apply for '{0}', retry")]
    InitRace(String),
    #[error("Durable backend error: {0}")]
    Backend(String),
    #[error("Cache store error: {0}")]
    Cache(String),
    #[error("Corrupt counter '{key}': {reason}")]
    Corruption { key: String, reason: String },
}

impl StorageError {
    /// Metric label for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidKey(_) => "invalid_key",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Config(_) => "config",
            Self::InitRace(_) => "init_race",
            Self::Backend(_) => "backend",
            Self::Cache(_) => "cache",
            Self::Corruption { .. } => "corruption",
        }
    }
}

/// Arguments of the atomic `update` procedure.
#[derive(Debug, Clone, Copy)]
pub struct Update<'a> {
    pub counter_key: &'a str,
    pub sync_set_key: &'a str,
    pub now_ms: i64,
    /// Create the counter from `seed` when it does not exist yet
    pub init: bool,
    /// Only used when `init` creates the counter
    pub seed: &'a Fields,
    pub deltas: &'a Fields,
    pub ttl_ms: Option<u64>,
}

/// Result of the atomic `update` procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub existed: bool,
    pub applied: bool,
}

/// A sync-set member and its score (last access, epoch millis).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    pub key: String,
    pub last_access_ms: i64,
}

/// The atomic procedures every cache mutation goes through.
///
/// Each call executes as one indivisible unit on the store, routed by its
/// counter key. Implementations never retry and never partially apply.
#[async_trait]
pub trait CounterCache: Send + Sync {
    /// Apply deltas (or create from seed when `init`), stamp `_w`, and
    /// upsert the key into its sync set.
    async fn update(&self, update: &Update<'_>) -> Result<UpdateOutcome, StorageError>;

    /// All raw fields; refreshes the sync-set score when the counter exists.
    async fn touch_and_read_all(
        &self,
        counter_key: &str,
        sync_set_key: &str,
        now_ms: i64,
    ) -> Result<RawFields, StorageError>;

    /// Remove the counter and its sync-set membership.
    async fn delete(&self, counter_key: &str, sync_set_key: &str) -> Result<(), StorageError>;

    /// Record a durable write of `sync_version`. No-op (false) if the
    /// counter is gone or already synced past that version.
    async fn mark_synced(
        &self,
        counter_key: &str,
        sync_version: i64,
        now_ms: i64,
    ) -> Result<bool, StorageError>;

    /// Evict only if `_w` still equals `expected_write_version` and the
    /// counter is clean.
    async fn try_evict(
        &self,
        counter_key: &str,
        sync_set_key: &str,
        expected_write_version: i64,
    ) -> Result<bool, StorageError>;
}

/// Per-instance primitives the background scanner walks sync sets with.
#[async_trait]
pub trait SyncIndex: Send + Sync {
    /// Raw fields without touching the access score.
    async fn read_all(&self, counter_key: &str) -> Result<RawFields, StorageError>;

    /// Sync-set cardinality.
    async fn slot_len(&self, sync_set_key: &str) -> Result<u64, StorageError>;

    /// Up to `limit` members ordered by (score, member), strictly after `after`.
    async fn slot_page(
        &self,
        sync_set_key: &str,
        after: Option<&SlotEntry>,
        limit: usize,
    ) -> Result<Vec<SlotEntry>, StorageError>;

    /// Drop a member from a sync set.
    async fn slot_remove(&self, sync_set_key: &str, counter_key: &str) -> Result<bool, StorageError>;
}

/// One store instance: atomic ops plus scan primitives.
pub trait ShardCache: CounterCache + SyncIndex {}

impl<T: CounterCache + SyncIndex + ?Sized> ShardCache for T {}

/// Durable backend for counters.
#[async_trait]
pub trait CounterArchive: Send + Sync {
    /// Stored fields, or the default seed when no record exists.
    async fn load(&self, id: &str) -> Result<Fields, StorageError>;

    async fn store(&self, id: &str, fields: &Fields) -> Result<(), StorageError>;

    /// Returns whether a record was deleted.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;
}
