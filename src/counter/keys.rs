// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis key layout for a counter family.
//!
//! ```text
//! {prefix}h:{counter_id}        hash   field → value, plus _w/_s/_st
//! {prefix}z.sync:{slot}         zset   counter key → last access (ms)
//! ```
//!
//! A counter key always maps to the same slot:
//! `slot = u64(sha256(counter_key)[..8]) mod slots_count`.

use sha2::{Digest, Sha256};

use crate::storage::traits::StorageError;

/// Reserved for the store client's shard tags; never allowed in ids or prefixes.
pub const SHARD_SEPARATOR: char = '#';

/// Fields starting with this are metadata, never returned to callers.
pub const RESERVED_PREFIX: char = '_';

/// Write version: bumped on every applied increment.
pub const WRITE_VERSION: &str = "_w";
/// Sync version: the `_w` last persisted to the durable backend.
pub const SYNC_VERSION: &str = "_s";
/// Wall-clock millis of the last successful sync.
pub const SYNC_TIMESTAMP: &str = "_st";

const COUNTER_SEGMENT: &str = "h:";
const SYNC_SET_SEGMENT: &str = "z.sync:";

#[inline]
pub fn is_reserved(field: &str) -> bool {
    field.starts_with(RESERVED_PREFIX)
}

/// Stable 64-bit hash used for slot and shard selection.
pub fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Key derivation for one counter family.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
    slots_count: u32,
}

impl KeySpace {
    pub fn new(prefix: &str, slots_count: u32) -> Result<Self, StorageError> {
        if prefix.contains(SHARD_SEPARATOR) {
            return Err(StorageError::InvalidKey(format!(
                "prefix '{}' contains '{}'",
                prefix, SHARD_SEPARATOR
            )));
        }
        if slots_count == 0 {
            return Err(StorageError::InvalidArgument("slots_count must be positive".into()));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            slots_count,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn slots_count(&self) -> u32 {
        self.slots_count
    }

    /// `{prefix}h:{counter_id}`; rejects empty ids and ids carrying the shard separator.
    pub fn counter_key(&self, counter_id: &str) -> Result<String, StorageError> {
        if counter_id.is_empty() {
            return Err(StorageError::InvalidKey("counter id is empty".into()));
        }
        if counter_id.contains(SHARD_SEPARATOR) {
            return Err(StorageError::InvalidKey(format!(
                "counter id '{}' contains '{}'",
                counter_id, SHARD_SEPARATOR
            )));
        }
        Ok(format!("{}{}{}", self.prefix, COUNTER_SEGMENT, counter_id))
    }

    /// Inverse of [`counter_key`](Self::counter_key). `None` for foreign keys.
    pub fn counter_id<'a>(&self, counter_key: &'a str) -> Option<&'a str> {
        counter_key
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix(COUNTER_SEGMENT))
            .filter(|id| !id.is_empty())
    }

    pub fn slot_of(&self, counter_key: &str) -> u32 {
        (stable_hash(counter_key) % u64::from(self.slots_count)) as u32
    }

    pub fn slot_key(&self, slot: u32) -> String {
        format!("{}{}{}", self.prefix, SYNC_SET_SEGMENT, slot)
    }

    pub fn sync_set_key(&self, counter_key: &str) -> String {
        self.slot_key(self.slot_of(counter_key))
    }
}
