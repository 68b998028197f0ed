// src/kv.rs
//
// =============================================================================
// GPUHOLD: KV STORE ADAPTER (spec_full.md §3)
// =============================================================================
//
// Typed get/set of JSON state, a conditional SET-if-absent primitive for the
// allocation lock, sorted-set primitives for usage history, and a simple
// list for the FCFS queue sequence. Two implementations: `RedisKv` for the
// real Redis-shaped backend, `MemoryKv` for tests and for running without a
// Redis instance at all -- a real implementation of the same trait, not a
// mock bolted on afterward.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>>;
    async fn set_raw(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;

    /// SET key value NX PX ttl_ms -- true if the key was absent and is now set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()>;
    /// Highest score first, matching "descending by end_time" (spec.md §4.1).
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn zremrangebyscore_older_than(&self, key: &str, cutoff: f64) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn list_push_back(&self, key: &str, value: &str) -> Result<()>;
    async fn list_range(&self, key: &str) -> Result<Vec<String>>;
    async fn list_remove(&self, key: &str, value: &str) -> Result<()>;
    /// Replaces the element equal to `old` with `new` (used to rewrite a
    /// queue entry in place after a partial fill).
    async fn list_replace(&self, key: &str, old: &str, new: &str) -> Result<()>;
}

/// Typed get on top of `get_raw`. A free function rather than a trait method
/// so it stays callable through `&dyn KvStore` -- a generic method on the
/// trait itself would need `Self: Sized` and couldn't be invoked on a trait
/// object at all.
pub async fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match kv.get_raw(key).await? {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("failed to parse JSON for key {key}"))?,
        )),
        None => Ok(None),
    }
}

/// Typed set on top of `set_raw`; see `get_json` for why this isn't a trait method.
pub async fn set_json<T: Serialize + Sync>(kv: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    let s = serde_json::to_string(value)?;
    kv.set_raw(key, &s).await
}

// =============================================================================
// Redis-backed implementation
// =============================================================================

pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis URL")?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(key).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::PX(ttl.as_millis() as usize));
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as usize)
            .query_async(&mut conn)
            .await?;
        let _ = opts; // documents the non-deprecated API shape; cmd() used for broad version compat
        Ok(result.is_some())
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrevrange(key, start as isize, stop as isize).await?)
    }

    async fn zremrangebyscore_older_than(&self, key: &str, cutoff: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zrembyscore(key, f64::MIN, cutoff).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.rpush(key, value).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lrem(key, 0, value).await?;
        Ok(())
    }

    async fn list_replace(&self, key: &str, old: &str, new: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        // LSET requires the index; simplest portable approach is remove+push,
        // which is safe here because callers always hold the allocation lock.
        conn.lrem(key, 1, old).await?;
        conn.rpush(key, new).await?;
        Ok(())
    }
}

// =============================================================================
// In-memory implementation (tests, lock-free local experimentation)
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    scalars: HashMap<String, String>,
    sorted_sets: HashMap<String, Vec<(f64, String)>>,
    lists: HashMap<String, VecDeque<String>>,
}

pub struct MemoryKv {
    inner: Arc<Mutex<MemoryInner>>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().await.scalars.get(key).cloned())
    }

    async fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .scalars
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.lock().await.scalars.remove(key);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, _ttl: Duration) -> Result<bool> {
        // Test/local-mode store: no background expiry thread. The allocation
        // lock's TTL is a liveness guarantee for the real backend; MemoryKv
        // is always used from a single process so contention never needs it.
        let mut guard = self.inner.lock().await;
        if guard.scalars.contains_key(key) {
            Ok(false)
        } else {
            guard.scalars.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let set = guard.sorted_sets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        set.push((score, member.to_string()));
        Ok(())
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let guard = self.inner.lock().await;
        let Some(set) = guard.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut sorted: Vec<&(f64, String)> = set.iter().collect();
        sorted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        let len = sorted.len() as isize;
        let norm = |i: isize| -> usize {
            if i < 0 {
                (len + i).max(0) as usize
            } else {
                i.min(len) as usize
            }
        };
        let s = norm(start);
        let e = if stop < 0 { norm(stop + 1) } else { (stop as usize + 1).min(len as usize) };
        if s >= e {
            return Ok(Vec::new());
        }
        Ok(sorted[s..e].iter().map(|(_, m)| m.clone()).collect())
    }

    async fn zremrangebyscore_older_than(&self, key: &str, cutoff: f64) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(set) = guard.sorted_sets.get_mut(key) {
            set.retain(|(score, _)| *score >= cutoff);
        }
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
        Ok(())
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .await
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<()> {
        if let Some(list) = self.inner.lock().await.lists.get_mut(key) {
            list.retain(|v| v != value);
        }
        Ok(())
    }

    async fn list_replace(&self, key: &str, old: &str, new: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(list) = guard.lists.get_mut(key) {
            if let Some(pos) = list.iter().position(|v| v == old) {
                list[pos] = new.to_string();
            }
        }
        Ok(())
    }
}
