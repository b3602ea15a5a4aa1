// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for one counter family.
//!
//! # Example
//!
//! ```
//! use counter_cache::CounterCacheConfig;
//!
//! // Minimal config (uses defaults)
//! let config = CounterCacheConfig::default();
//! assert_eq!(config.slots_count, 64);
//! assert!(config.validate().is_ok());
//!
//! // Tuned config
//! let config = CounterCacheConfig {
//!     prefix: "views:".into(),
//!     slot_max_items: 5_000,
//!     evict_interval_secs: 600,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use serde::Deserialize;
use thiserror::Error;

use crate::counter::keys::SHARD_SEPARATOR;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("'{0}' must be positive")]
    NotPositive(&'static str),
    #[error("prefix '{0}' must not contain the shard separator '#'")]
    InvalidPrefix(String),
}

/// Configuration for a counter family.
///
/// All fields have defaults. Every numeric setting must be positive;
/// [`validate`](Self::validate) is called by the store and scanner
/// constructors so a bad config fails at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct CounterCacheConfig {
    /// Namespace prepended to every Redis key (e.g. "views:")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Number of sync-set slots counters are hashed into
    #[serde(default = "default_slots_count")]
    pub slots_count: u32,

    /// Per-slot capacity; entries above it are evicted on the next scan
    #[serde(default = "default_slot_max_items")]
    pub slot_max_items: u64,

    /// Sync once `_w - _s` reaches this many milliseconds of write drift
    #[serde(default = "default_min_sync_version_changes")]
    pub min_sync_version_changes: i64,

    /// Sync at most this often per counter (unless drift trips first)
    #[serde(default = "default_min_sync_interval_secs")]
    pub min_sync_interval_secs: u64,

    /// Evict counters not accessed for this long
    #[serde(default = "default_evict_interval_secs")]
    pub evict_interval_secs: u64,

    /// Pause between scheduler passes
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Optional TTL refreshed on every write (None = no expiry).
    /// Expired counters lose unsynced increments.
    #[serde(default)]
    pub key_ttl_secs: Option<u64>,
}

fn default_prefix() -> String { "counter:".to_string() }
fn default_slots_count() -> u32 { 64 }
fn default_slot_max_items() -> u64 { 10_000 }
fn default_min_sync_version_changes() -> i64 { 1_000 }
fn default_min_sync_interval_secs() -> u64 { 30 }
fn default_evict_interval_secs() -> u64 { 3_600 }
fn default_scan_interval_ms() -> u64 { 5_000 }

impl Default for CounterCacheConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            slots_count: default_slots_count(),
            slot_max_items: default_slot_max_items(),
            min_sync_version_changes: default_min_sync_version_changes(),
            min_sync_interval_secs: default_min_sync_interval_secs(),
            evict_interval_secs: default_evict_interval_secs(),
            scan_interval_ms: default_scan_interval_ms(),
            key_ttl_secs: None,
        }
    }
}

impl CounterCacheConfig {
    /// Reject non-positive settings and a prefix that would collide with shard tags.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.contains(SHARD_SEPARATOR) {
            return Err(ConfigError::InvalidPrefix(self.prefix.clone()));
        }
        if self.slots_count == 0 {
            return Err(ConfigError::NotPositive("slots_count"));
        }
        if self.slot_max_items == 0 {
            return Err(ConfigError::NotPositive("slot_max_items"));
        }
        if self.min_sync_version_changes <= 0 {
            return Err(ConfigError::NotPositive("min_sync_version_changes"));
        }
        if self.min_sync_interval_secs == 0 {
            return Err(ConfigError::NotPositive("min_sync_interval_secs"));
        }
        if self.evict_interval_secs == 0 {
            return Err(ConfigError::NotPositive("evict_interval_secs"));
        }
        if self.scan_interval_ms == 0 {
            return Err(ConfigError::NotPositive("scan_interval_ms"));
        }
        if self.key_ttl_secs == Some(0) {
            return Err(ConfigError::NotPositive("key_ttl_secs"));
        }
        Ok(())
    }
}
