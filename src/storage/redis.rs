// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed counter cache.
//!
//! Every mutation is a server-side Lua script so it executes as a single
//! indivisible unit, whatever else is hitting the same counter:
//!
//! | Script            | KEYS                   | ARGV                                         |
//! |-------------------|------------------------|----------------------------------------------|
//! | `update`          | counter, sync set      | now, init, ttl_ms, n_seed, seed.., deltas..  |
//! | `touch_read_all`  | counter, sync set      | now                                          |
//! | `delete`          | counter, sync set      |                                              |
//! | `mark_synced`     | counter                | sync_version, now                            |
//! | `try_evict`       | counter, sync set      | expected_write_version                       |
//! | `slot_page`       | sync set               | after_score, after_member, limit             |
//!
//! Numbers travel as decimal strings; field name/value pairs are interleaved.
//! Scripts are sent with EVALSHA and fall back to EVAL on `NOSCRIPT`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use super::traits::{
    CounterCache, RawFields, SlotEntry, StorageError, SyncIndex, Update, UpdateOutcome,
};
use crate::resilience::retry::{retry, RetryConfig};

/// Error code the update script raises when a field cannot take its delta.
const OVERFLOW_CODE: &str = "COUNTER_OVERFLOW";
/// Error code the update script raises on a stored non-integer field.
const NOT_INTEGER_CODE: &str = "COUNTER_NOT_INTEGER";

// Lua numbers are doubles, so 64-bit sums are checked on (high, low 9 digits) halves.
// Every delta is validated before the first write: a script error does not roll back.
const UPDATE_LUA: &str = r#"
local key, zkey = KEYS[1], KEYS[2]
local now = tonumber(ARGV[1])
local init = ARGV[2] == '1'
local ttl = tonumber(ARGV[3])
local first_delta = 5 + 2 * tonumber(ARGV[4])
local has_deltas = #ARGV >= first_delta
local existed = redis.call('EXISTS', key) == 1

if not existed and not init then
  return {0, 0}
end
if existed and init and not has_deltas then
  redis.call('ZADD', zkey, now, key)
  return {1, 1}
end

local function split(value)
  if type(value) ~= 'string' or not string.match(value, '^%-?%d+$') then
    return nil
  end
  local negative = string.sub(value, 1, 1) == '-'
  local digits = negative and string.sub(value, 2) or value
  local lo = tonumber(string.sub(digits, -9))
  local hi = 0
  if #digits > 9 then
    hi = tonumber(string.sub(digits, 1, #digits - 9))
  end
  if negative then
    return -hi, -lo
  end
  return hi, lo
end

local function fits_i64(hi, lo)
  local carry = math.floor(lo / 1000000000)
  hi, lo = hi + carry, lo - carry * 1000000000
  if hi > 9223372036 or (hi == 9223372036 and lo > 854775807) then
    return false
  end
  if hi < -9223372037 or (hi == -9223372037 and lo < 145224192) then
    return false
  end
  return true
end

local seed = {}
if not existed then
  for i = 5, first_delta - 1, 2 do
    seed[ARGV[i]] = ARGV[i + 1]
  end
end
for i = first_delta, #ARGV, 2 do
  local field = ARGV[i]
  local current
  if existed then
    current = redis.call('HGET', key, field) or '0'
  else
    current = seed[field] or '0'
  end
  local chi, clo = split(current)
  if not chi or not fits_i64(chi, clo) then
    return redis.error_reply('COUNTER_NOT_INTEGER ' .. field)
  end
  local dhi, dlo = split(ARGV[i + 1])
  if not fits_i64(chi + dhi, clo + dlo) then
    return redis.error_reply('COUNTER_OVERFLOW ' .. field)
  end
end

local w = now
local prev = tonumber(redis.call('HGET', key, '_w') or '0')
if prev and prev + 1 > w then
  w = prev + 1
end

if not existed then
  for i = 5, first_delta - 1, 2 do
    redis.call('HSET', key, ARGV[i], ARGV[i + 1])
  end
end
for i = first_delta, #ARGV, 2 do
  redis.call('HINCRBY', key, ARGV[i], ARGV[i + 1])
end
redis.call('HSET', key, '_w', string.format('%d', w))
if not existed then
  local s = w
  if has_deltas then
    s = w - 1
  end
  redis.call('HSET', key, '_s', string.format('%d', s), '_st', ARGV[1])
end
if ttl > 0 then
  redis.call('PEXPIRE', key, ttl)
end
redis.call('ZADD', zkey, now, key)
return {1, 1}
"#;

const TOUCH_READ_ALL_LUA: &str = r#"
local data = redis.call('HGETALL', KEYS[1])
if #data > 0 then
  redis.call('ZADD', KEYS[2], ARGV[1], KEYS[1])
end
return data
"#;

const DELETE_LUA: &str = r#"
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], KEYS[1])
return 1
"#;

const MARK_SYNCED_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
local current = tonumber(redis.call('HGET', KEYS[1], '_s') or '0') or 0
if tonumber(ARGV[1]) < current then
  return 0
end
redis.call('HSET', KEYS[1], '_s', ARGV[1], '_st', ARGV[2])
return 1
"#;

const TRY_EVICT_LUA: &str = r#"
local meta = redis.call('HMGET', KEYS[1], '_w', '_s')
if not meta[1] then
  if redis.call('EXISTS', KEYS[1]) == 0 then
    redis.call('ZREM', KEYS[2], KEYS[1])
  end
  return 0
end
local w = tonumber(meta[1])
local s = tonumber(meta[2] or '0') or 0
if w ~= tonumber(ARGV[1]) or s < w then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], KEYS[1])
return 1
"#;

// Score cursor: members strictly after (after_score, after_member) in zset order.
const SLOT_PAGE_LUA: &str = r#"
local after = tonumber(ARGV[1])
local member = ARGV[2]
local limit = tonumber(ARGV[3])
local out = {}
local offset = 0
while #out < limit * 2 do
  local page = redis.call('ZRANGEBYSCORE', KEYS[1], after, '+inf', 'WITHSCORES', 'LIMIT', offset, limit)
  if #page == 0 then
    break
  end
  for i = 1, #page, 2 do
    if #out < limit * 2 and (tonumber(page[i + 1]) > after or page[i] > member) then
      out[#out + 1] = page[i]
      out[#out + 1] = page[i + 1]
    end
  end
  offset = offset + limit
end
return out
"#;

struct Scripts {
    update: Script,
    touch_read_all: Script,
    delete: Script,
    mark_synced: Script,
    try_evict: Script,
    slot_page: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            update: Script::new(UPDATE_LUA),
            touch_read_all: Script::new(TOUCH_READ_ALL_LUA),
            delete: Script::new(DELETE_LUA),
            mark_synced: Script::new(MARK_SYNCED_LUA),
            try_evict: Script::new(TRY_EVICT_LUA),
            slot_page: Script::new(SLOT_PAGE_LUA),
        }
    }
}

#[inline]
fn cache_err(e: redis::RedisError) -> StorageError {
    StorageError::Cache(e.to_string())
}

/// Maps the update script's validation errors; anything else is a cache error.
fn update_err(counter_key: &str, e: redis::RedisError) -> StorageError {
    let message = e.to_string();
    if message.contains(OVERFLOW_CODE) {
        StorageError::InvalidArgument(format!("increment overflows on {}: {}", counter_key, message))
    } else if message.contains(NOT_INTEGER_CODE) {
        StorageError::Corruption {
            key: counter_key.to_string(),
            reason: message,
        }
    } else {
        cache_err(e)
    }
}

/// One Redis instance holding counters and their sync sets.
pub struct RedisCounterCache {
    connection: ConnectionManager,
    scripts: Scripts,
}

impl RedisCounterCache {
    /// Connect with startup-mode retry (fails fast on a bad URL or dead server).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(cache_err)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(cache_err)?;

        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection (e.g. shared with other components).
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            scripts: Scripts::load(),
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    /// Round-trip check for health monitoring, with a few quick retries.
    pub async fn ping(&self) -> Result<(), StorageError> {
        retry("redis_ping", &RetryConfig::query(), || async {
            let mut conn = self.connection.clone();
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map_err(cache_err)?;
        Ok(())
    }
}

#[async_trait]
impl CounterCache for RedisCounterCache {
    async fn update(&self, update: &Update<'_>) -> Result<UpdateOutcome, StorageError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.update.prepare_invoke();
        invocation
            .key(update.counter_key)
            .key(update.sync_set_key)
            .arg(update.now_ms.to_string())
            .arg(if update.init { "1" } else { "0" })
            .arg(update.ttl_ms.unwrap_or(0).to_string());

        // Seed only matters when the script may create the counter
        if update.init {
            invocation.arg(update.seed.len().to_string());
            for (field, value) in update.seed {
                invocation.arg(field.as_str()).arg(value.to_string());
            }
        } else {
            invocation.arg("0");
        }
        for (field, delta) in update.deltas {
            invocation.arg(field.as_str()).arg(delta.to_string());
        }

        let (existed, applied): (i64, i64) = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| update_err(update.counter_key, e))?;
        Ok(UpdateOutcome {
            existed: existed == 1,
            applied: applied == 1,
        })
    }

    async fn touch_and_read_all(
        &self,
        counter_key: &str,
        sync_set_key: &str,
        now_ms: i64,
    ) -> Result<RawFields, StorageError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.touch_read_all.prepare_invoke();
        invocation.key(counter_key).key(sync_set_key).arg(now_ms.to_string());
        invocation.invoke_async(&mut conn).await.map_err(cache_err)
    }

    async fn delete(&self, counter_key: &str, sync_set_key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.delete.prepare_invoke();
        invocation.key(counter_key).key(sync_set_key);
        let _: i64 = invocation.invoke_async(&mut conn).await.map_err(cache_err)?;
        Ok(())
    }

    async fn mark_synced(
        &self,
        counter_key: &str,
        sync_version: i64,
        now_ms: i64,
    ) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.mark_synced.prepare_invoke();
        invocation
            .key(counter_key)
            .arg(sync_version.to_string())
            .arg(now_ms.to_string());
        let marked: i64 = invocation.invoke_async(&mut conn).await.map_err(cache_err)?;
        Ok(marked == 1)
    }

    async fn try_evict(
        &self,
        counter_key: &str,
        sync_set_key: &str,
        expected_write_version: i64,
    ) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.try_evict.prepare_invoke();
        invocation
            .key(counter_key)
            .key(sync_set_key)
            .arg(expected_write_version.to_string());
        let evicted: i64 = invocation.invoke_async(&mut conn).await.map_err(cache_err)?;
        Ok(evicted == 1)
    }
}

#[async_trait]
impl SyncIndex for RedisCounterCache {
    async fn read_all(&self, counter_key: &str) -> Result<RawFields, StorageError> {
        let mut conn = self.connection.clone();
        conn.hgetall(counter_key).await.map_err(cache_err)
    }

    async fn slot_len(&self, sync_set_key: &str) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        conn.zcard(sync_set_key).await.map_err(cache_err)
    }

    async fn slot_page(
        &self,
        sync_set_key: &str,
        after: Option<&SlotEntry>,
        limit: usize,
    ) -> Result<Vec<SlotEntry>, StorageError> {
        let (after_score, after_member) = match after {
            Some(entry) => (entry.last_access_ms.to_string(), entry.key.as_str()),
            // Scores are epoch millis, so -1 precedes every member
            None => ("-1".to_string(), ""),
        };

        let mut conn = self.connection.clone();
        let mut invocation = self.scripts.slot_page.prepare_invoke();
        invocation
            .key(sync_set_key)
            .arg(after_score)
            .arg(after_member)
            .arg(limit.to_string());
        let page: Vec<(String, String)> =
            invocation.invoke_async(&mut conn).await.map_err(cache_err)?;

        page.into_iter()
            .map(|(key, score)| {
                let last_access_ms = score.parse::<f64>().map_err(|_| StorageError::Corruption {
                    key: sync_set_key.to_string(),
                    reason: format!("non-numeric score '{}' for '{}'", score, key),
                })? as i64;
                Ok(SlotEntry { key, last_access_ms })
            })
            .collect()
    }

    async fn slot_remove(&self, sync_set_key: &str, counter_key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let removed: u32 = conn.zrem(sync_set_key, counter_key).await.map_err(cache_err)?;
        Ok(removed > 0)
    }
}
