// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Counter protocol on top of the storage contracts.
//!
//! - [`keys`]: key layout and slot hashing
//! - [`meta`]: parsing raw hashes into snapshots
//! - [`store`]: foreground `incr` / `get` / `del`
//! - [`scanner`]: per-instance sync and eviction pass
//! - [`scheduler`]: background loop driving the scanners

pub mod keys;
pub mod meta;
pub mod scanner;
pub mod scheduler;
pub mod store;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock epoch millis, the unit of `_w`, `_st` and sync-set scores.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
