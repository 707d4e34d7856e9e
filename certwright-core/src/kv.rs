//! KV client contract (spec.md §6.4): a thin adapter over a Redis-compatible
//! store supporting flat key ops, hash ops, TTL, and atomic pipelines.

use crate::error::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A single queued pipeline operation.
#[derive(Debug, Clone)]
pub enum KvOp {
    Set { key: String, value: Vec<u8> },
    Del { key: String },
    Expire { key: String, ttl_ms: i64 },
    HSetMulti { key: String, fields: Vec<(String, Vec<u8>)> },
    HDel { key: String, fields: Vec<String> },
    HIncrBy { key: String, field: String, delta: i64 },
}

/// The per-command result of a pipeline, mirroring redis's `[err, result]`
/// tuples collapsed into a typed enum (errors short-circuit the whole
/// pipeline instead, since the contract requires atomicity).
#[derive(Debug, Clone)]
pub enum KvValue {
    Ok,
    Int(i64),
}

/// Required operations of the shared backing store, per spec.md §6.4.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    async fn del(&self, key: &str) -> Result<u64>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn expire(&self, key: &str, ttl_ms: i64) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>>;
    async fn hset_multi(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()>;
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64>;
    async fn hexists(&self, key: &str, field: &str) -> Result<bool>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Execute a sequence of write operations as a single atomic pipeline.
    /// Either every operation lands, or (on transport error) none of them do.
    async fn pipeline_exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvValue>>;

    /// `SET key value NX PX ttl_ms` — the primitive the distributed lock is
    /// built from. Returns `true` if the key was set (lock acquired).
    async fn set_nx_px(&self, key: &str, value: &[u8], ttl_ms: i64) -> Result<bool>;

    /// Delete `key` only if its current value equals `expected` (a
    /// compare-and-delete, used for safe lock release so a holder never
    /// releases a lease it doesn't own). Returns `true` if deleted.
    async fn compare_del(&self, key: &str, expected: &[u8]) -> Result<bool>;
}

/// Redis-backed implementation using an async connection manager so callers
/// don't have to manage reconnects themselves.
pub struct RedisKvClient {
    conn: redis::aio::ConnectionManager,
}

impl RedisKvClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

const COMPARE_DEL_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[async_trait]
impl KvClient for RedisKvClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.del(key).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl_ms: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.pexpire(key, ttl_ms).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?)
    }

    async fn hset_multi(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        Ok(conn.hdel(key, fields).await?)
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.hexists(key, field).await?)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn pipeline_exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvValue>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            match op {
                KvOp::Set { key, value } => {
                    pipe.set(key, value).ignore();
                }
                KvOp::Del { key } => {
                    pipe.del(key).ignore();
                }
                KvOp::Expire { key, ttl_ms } => {
                    pipe.pexpire(key, *ttl_ms).ignore();
                }
                KvOp::HSetMulti { key, fields } => {
                    pipe.hset_multiple(key, fields).ignore();
                }
                KvOp::HDel { key, fields } => {
                    pipe.hdel(key, fields).ignore();
                }
                KvOp::HIncrBy { key, field, delta } => {
                    pipe.hincr(key, field, *delta);
                }
            }
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(ops.iter().map(|_| KvValue::Ok).collect())
    }

    async fn set_nx_px(&self, key: &str, value: &[u8], ttl_ms: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn compare_del(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(COMPARE_DEL_SCRIPT);
        let deleted: i64 = script.key(key).arg(expected).invoke_async(&mut conn).await?;
        Ok(deleted == 1)
    }
}

/// In-memory `KvClient` used by the coordinator's own test suite so tests
/// don't need a live Redis. TTLs are honored lazily on read, matching the
/// real store's eventual expiry closely enough for deterministic tests.
#[derive(Default)]
pub struct InMemoryKvClient {
    strings: Arc<Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>>,
    hashes: Arc<Mutex<HashMap<String, HashMap<String, Vec<u8>>>>>,
}

impl InMemoryKvClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn live_string(&self, key: &str) -> Option<Vec<u8>> {
        let mut strings = self.strings.lock().await;
        match strings.get(key) {
            Some((_, Some(expiry))) if *expiry <= Instant::now() => {
                strings.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl KvClient for InMemoryKvClient {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.live_string(key).await)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut strings = self.strings.lock().await;
        strings.insert(key.to_string(), (value.to_vec(), None));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut strings = self.strings.lock().await;
        Ok(strings.remove(key).is_some() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_string(key).await.is_some())
    }

    async fn expire(&self, key: &str, ttl_ms: i64) -> Result<bool> {
        let mut strings = self.strings.lock().await;
        if let Some(entry) = strings.get_mut(key) {
            entry.1 = Some(Instant::now() + Duration::from_millis(ttl_ms.max(0) as u64));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let hashes = self.hashes.lock().await;
        Ok(hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let hashes = self.hashes.lock().await;
        let hash = hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hset_multi(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        let mut hashes = self.hashes.lock().await;
        let hash = hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        let mut hashes = self.hashes.lock().await;
        let Some(hash) = hashes.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for field in fields {
            if hash.remove(field).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool> {
        let hashes = self.hashes.lock().await;
        Ok(hashes.get(key).map(|h| h.contains_key(field)).unwrap_or(false))
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut hashes = self.hashes.lock().await;
        let hash = hashes.entry(key.to_string()).or_default();
        let current = hash
            .get(field)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    async fn pipeline_exec(&self, ops: Vec<KvOp>) -> Result<Vec<KvValue>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let value = match op {
                KvOp::Set { key, value } => {
                    self.set(&key, &value).await?;
                    KvValue::Ok
                }
                KvOp::Del { key } => {
                    self.del(&key).await?;
                    KvValue::Ok
                }
                KvOp::Expire { key, ttl_ms } => {
                    self.expire(&key, ttl_ms).await?;
                    KvValue::Ok
                }
                KvOp::HSetMulti { key, fields } => {
                    self.hset_multi(&key, &fields).await?;
                    KvValue::Ok
                }
                KvOp::HDel { key, fields } => {
                    self.hdel(&key, &fields).await?;
                    KvValue::Ok
                }
                KvOp::HIncrBy { key, field, delta } => {
                    KvValue::Int(self.hincrby(&key, &field, delta).await?)
                }
            };
            results.push(value);
        }
        Ok(results)
    }

    async fn set_nx_px(&self, key: &str, value: &[u8], ttl_ms: i64) -> Result<bool> {
        let mut strings = self.strings.lock().await;
        let is_live = match strings.get(key) {
            Some((_, Some(expiry))) => *expiry > Instant::now(),
            Some((_, None)) => true,
            None => false,
        };
        if is_live {
            return Ok(false);
        }
        strings.insert(
            key.to_string(),
            (value.to_vec(), Some(Instant::now() + Duration::from_millis(ttl_ms.max(0) as u64))),
        );
        Ok(true)
    }

    async fn compare_del(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut strings = self.strings.lock().await;
        match strings.get(key) {
            Some((value, _)) if value == expected => {
                strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
