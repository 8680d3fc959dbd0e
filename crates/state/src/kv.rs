//! The key-value seam: atomic get/set with TTL plus the handful of list and
//! set primitives the queue and active-set need.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use crate::StateError;

#[async_trait]
pub trait Kv: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<String>, StateError>;
  async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError>;
  async fn del(&self, key: &str) -> Result<bool, StateError>;
  /// Keys matching a `prefix*` pattern.
  async fn keys(&self, pattern: &str) -> Result<Vec<String>, StateError>;

  async fn lpush(&self, key: &str, value: &str) -> Result<(), StateError>;
  async fn rpop(&self, key: &str) -> Result<Option<String>, StateError>;
  async fn lrem(&self, key: &str, value: &str) -> Result<usize, StateError>;

  async fn sadd(&self, key: &str, member: &str) -> Result<(), StateError>;
  async fn srem(&self, key: &str, member: &str) -> Result<(), StateError>;
  async fn smembers(&self, key: &str) -> Result<Vec<String>, StateError>;
}

/// Production backend over a shared Redis connection manager.
#[derive(Clone)]
pub struct RedisKv {
  manager: redis::aio::ConnectionManager,
}

impl RedisKv {
  pub async fn connect(url: &str) -> Result<Self, StateError> {
    let client = redis::Client::open(url)?;
    let manager = client.get_connection_manager().await?;
    debug!(url, "connected to redis");
    Ok(Self { manager })
  }
}

#[async_trait]
impl Kv for RedisKv {
  async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
    let mut conn = self.manager.clone();
    Ok(conn.get(key).await?)
  }

  async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError> {
    let mut conn = self.manager.clone();
    conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
    Ok(())
  }

  async fn del(&self, key: &str) -> Result<bool, StateError> {
    let mut conn = self.manager.clone();
    let removed: i64 = conn.del(key).await?;
    Ok(removed > 0)
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, StateError> {
    let mut conn = self.manager.clone();
    Ok(conn.keys(pattern).await?)
  }

  async fn lpush(&self, key: &str, value: &str) -> Result<(), StateError> {
    let mut conn = self.manager.clone();
    conn.lpush::<_, _, ()>(key, value).await?;
    Ok(())
  }

  async fn rpop(&self, key: &str) -> Result<Option<String>, StateError> {
    let mut conn = self.manager.clone();
    Ok(conn.rpop(key, None).await?)
  }

  async fn lrem(&self, key: &str, value: &str) -> Result<usize, StateError> {
    let mut conn = self.manager.clone();
    let removed: i64 = conn.lrem(key, 0, value).await?;
    Ok(removed as usize)
  }

  async fn sadd(&self, key: &str, member: &str) -> Result<(), StateError> {
    let mut conn = self.manager.clone();
    conn.sadd::<_, _, ()>(key, member).await?;
    Ok(())
  }

  async fn srem(&self, key: &str, member: &str) -> Result<(), StateError> {
    let mut conn = self.manager.clone();
    conn.srem::<_, _, ()>(key, member).await?;
    Ok(())
  }

  async fn smembers(&self, key: &str) -> Result<Vec<String>, StateError> {
    let mut conn = self.manager.clone();
    Ok(conn.smembers(key).await?)
  }
}

enum Entry {
  Value { value: String, expires_at: Option<Instant> },
  List(VecDeque<String>),
  Set(HashSet<String>),
}

/// In-process backend with the same TTL semantics. Used by tests and
/// single-node deployments that do not want a Redis dependency.
#[derive(Default)]
pub struct MemoryKv {
  entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
  pub fn new() -> Self {
    Self::default()
  }

  fn expired(entry: &Entry) -> bool {
    match entry {
      Entry::Value {
        expires_at: Some(at), ..
      } => *at <= Instant::now(),
      _ => false,
    }
  }
}

#[async_trait]
impl Kv for MemoryKv {
  async fn get(&self, key: &str) -> Result<Option<String>, StateError> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = entries.get(key) {
      if Self::expired(entry) {
        entries.remove(key);
        return Ok(None);
      }
      if let Entry::Value { value, .. } = entry {
        return Ok(Some(value.clone()));
      }
    }
    Ok(None)
  }

  async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StateError> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.insert(
      key.to_string(),
      Entry::Value {
        value: value.to_string(),
        expires_at: Some(Instant::now() + ttl),
      },
    );
    Ok(())
  }

  async fn del(&self, key: &str) -> Result<bool, StateError> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    Ok(entries.remove(key).is_some())
  }

  async fn keys(&self, pattern: &str) -> Result<Vec<String>, StateError> {
    let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    entries.retain(|_, entry| !Self::expired(entry));
    Ok(entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
  }

  async fn lpush(&self, key: &str, value: &str) -> Result<(), StateError> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry::List(VecDeque::new()));
    if let Entry::List(list) = entry {
      list.push_front(value.to_string());
    }
    Ok(())
  }

  async fn rpop(&self, key: &str) -> Result<Option<String>, StateError> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(Entry::List(list)) = entries.get_mut(key) {
      return Ok(list.pop_back());
    }
    Ok(None)
  }

  async fn lrem(&self, key: &str, value: &str) -> Result<usize, StateError> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(Entry::List(list)) = entries.get_mut(key) {
      let before = list.len();
      list.retain(|v| v != value);
      return Ok(before - list.len());
    }
    Ok(0)
  }

  async fn sadd(&self, key: &str, member: &str) -> Result<(), StateError> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry::Set(HashSet::new()));
    if let Entry::Set(set) = entry {
      set.insert(member.to_string());
    }
    Ok(())
  }

  async fn srem(&self, key: &str, member: &str) -> Result<(), StateError> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(Entry::Set(set)) = entries.get_mut(key) {
      set.remove(member);
    }
    Ok(())
  }

  async fn smembers(&self, key: &str) -> Result<Vec<String>, StateError> {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(Entry::Set(set)) = entries.get(key) {
      return Ok(set.iter().cloned().collect());
    }
    Ok(Vec::new())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn memory_kv_get_set_del() {
    let kv = MemoryKv::new();
    assert_eq!(kv.get("a").await.unwrap(), None);
    kv.set_ex("a", "1", Duration::from_secs(60)).await.unwrap();
    assert_eq!(kv.get("a").await.unwrap(), Some("1".to_string()));
    assert!(kv.del("a").await.unwrap());
    assert_eq!(kv.get("a").await.unwrap(), None);
    assert!(!kv.del("a").await.unwrap());
  }

  #[tokio::test]
  async fn memory_kv_expires_values() {
    let kv = MemoryKv::new();
    kv.set_ex("a", "1", Duration::from_millis(5)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(kv.get("a").await.unwrap(), None);
    assert!(kv.keys("a*").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn memory_kv_prefix_keys() {
    let kv = MemoryKv::new();
    kv.set_ex("checkpoint:a", "1", Duration::from_secs(60)).await.unwrap();
    kv.set_ex("checkpoint:b", "2", Duration::from_secs(60)).await.unwrap();
    kv.set_ex("progress:a", "3", Duration::from_secs(60)).await.unwrap();

    let mut keys = kv.keys("checkpoint:*").await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["checkpoint:a".to_string(), "checkpoint:b".to_string()]);
  }

  #[tokio::test]
  async fn memory_kv_list_is_fifo_via_lpush_rpop() {
    let kv = MemoryKv::new();
    kv.lpush("q", "first").await.unwrap();
    kv.lpush("q", "second").await.unwrap();
    assert_eq!(kv.rpop("q").await.unwrap(), Some("first".to_string()));
    assert_eq!(kv.rpop("q").await.unwrap(), Some("second".to_string()));
    assert_eq!(kv.rpop("q").await.unwrap(), None);
  }

  #[tokio::test]
  async fn memory_kv_lrem_removes_all_occurrences() {
    let kv = MemoryKv::new();
    kv.lpush("q", "x").await.unwrap();
    kv.lpush("q", "y").await.unwrap();
    kv.lpush("q", "x").await.unwrap();
    assert_eq!(kv.lrem("q", "x").await.unwrap(), 2);
    assert_eq!(kv.rpop("q").await.unwrap(), Some("y".to_string()));
  }

  #[tokio::test]
  async fn memory_kv_set_operations() {
    let kv = MemoryKv::new();
    kv.sadd("active", "job1").await.unwrap();
    kv.sadd("active", "job2").await.unwrap();
    kv.sadd("active", "job1").await.unwrap();

    let mut members = kv.smembers("active").await.unwrap();
    members.sort();
    assert_eq!(members, vec!["job1".to_string(), "job2".to_string()]);

    kv.srem("active", "job1").await.unwrap();
    assert_eq!(kv.smembers("active").await.unwrap(), vec!["job2".to_string()]);
  }
}
