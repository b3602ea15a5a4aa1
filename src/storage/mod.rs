// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache and durable backends.
//!
//! - [`traits`]: the atomic cache contract and the durable backend contract
//! - [`redis`]: Lua-scripted cache on one Redis instance
//! - [`sharded`]: client-side routing over several cache instances
//! - [`sql`]: SQLite/MySQL durable backend
//! - [`memory`]: in-process cache and backend

pub mod memory;
pub mod redis;
pub mod sharded;
pub mod sql;
pub mod traits;
