//! Durable job records, the FIFO queue, and the active set.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use silt_core::JobRecord;

use crate::keys;
use crate::kv::Kv;
use crate::StateError;

/// Persistence for job records plus the queue/active-set primitives the task
/// manager schedules with.
pub struct JobStore {
  kv: Arc<dyn Kv>,
}

impl JobStore {
  pub fn new(kv: Arc<dyn Kv>) -> Self {
    Self { kv }
  }

  fn task_key(job_id: &str) -> String {
    format!("{}{job_id}", keys::TASK_PREFIX)
  }

  pub async fn store(&self, record: &JobRecord) -> Result<(), StateError> {
    let raw = serde_json::to_string(record)?;
    self.kv.set_ex(&Self::task_key(&record.job_id), &raw, keys::TASK_TTL).await
  }

  pub async fn load(&self, job_id: &str) -> Result<Option<JobRecord>, StateError> {
    match self.kv.get(&Self::task_key(job_id)).await? {
      Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      None => Ok(None),
    }
  }

  /// Load or fail with `NotFound`.
  pub async fn require(&self, job_id: &str) -> Result<JobRecord, StateError> {
    self.load(job_id).await?.ok_or_else(|| StateError::NotFound(job_id.to_string()))
  }

  pub async fn delete(&self, job_id: &str) -> Result<bool, StateError> {
    self.kv.del(&Self::task_key(job_id)).await
  }

  // FIFO queue: lpush to enqueue, rpop to dequeue.

  pub async fn queue_push(&self, job_id: &str) -> Result<(), StateError> {
    self.kv.lpush(keys::TASK_QUEUE, job_id).await
  }

  pub async fn queue_pop(&self) -> Result<Option<String>, StateError> {
    self.kv.rpop(keys::TASK_QUEUE).await
  }

  pub async fn queue_remove(&self, job_id: &str) -> Result<usize, StateError> {
    self.kv.lrem(keys::TASK_QUEUE, job_id).await
  }

  // Active set: running job ids, shared for cross-process visibility.

  pub async fn active_add(&self, job_id: &str) -> Result<(), StateError> {
    self.kv.sadd(keys::ACTIVE_TASKS, job_id).await
  }

  pub async fn active_remove(&self, job_id: &str) -> Result<(), StateError> {
    self.kv.srem(keys::ACTIVE_TASKS, job_id).await
  }

  pub async fn active_list(&self) -> Result<Vec<String>, StateError> {
    self.kv.smembers(keys::ACTIVE_TASKS).await
  }

  /// Remove terminal job records older than `max_age_hours`. Returns how many
  /// were swept.
  pub async fn cleanup_old(&self, max_age_hours: u64) -> Result<usize, StateError> {
    let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours as i64);
    let mut cleaned = 0usize;

    for key in self.kv.keys(&format!("{}*", keys::TASK_PREFIX)).await? {
      let Some(raw) = self.kv.get(&key).await? else { continue };
      match serde_json::from_str::<JobRecord>(&raw) {
        Ok(record) => {
          if record.status.is_terminal() && record.updated_at < cutoff && self.kv.del(&key).await? {
            cleaned += 1;
          }
        }
        Err(e) => warn!(key = %key, error = %e, "skipping undecodable job record during cleanup"),
      }
    }

    if cleaned > 0 {
      info!(cleaned, "cleaned up old job records");
    }
    Ok(cleaned)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kv::MemoryKv;
  use silt_core::{FileInfo, JobConfig, JobStatus, SchemaConfig};
  use std::path::PathBuf;

  fn record(job_id: &str) -> JobRecord {
    let schema: SchemaConfig = serde_json::from_str(r#"{ "mapping": { "content_path": "c" } }"#).unwrap();
    JobRecord::new(
      job_id.to_string(),
      "tenant-1".to_string(),
      FileInfo {
        path: PathBuf::from("/tmp/data.json"),
        size: 1,
        filename: "data.json".into(),
      },
      JobConfig {
        schema,
        embedding: Default::default(),
        vector_store: serde_json::from_str(r#"{ "uri": "http://localhost:19530", "collection": "docs" }"#).unwrap(),
      },
    )
  }

  fn store() -> JobStore {
    JobStore::new(Arc::new(MemoryKv::new()))
  }

  #[tokio::test]
  async fn store_and_load_roundtrip() {
    let jobs = store();
    jobs.store(&record("job1")).await.unwrap();

    let loaded = jobs.require("job1").await.unwrap();
    assert_eq!(loaded.job_id, "job1");
    assert_eq!(loaded.status, JobStatus::Queued);

    assert!(jobs.load("missing").await.unwrap().is_none());
    assert!(matches!(jobs.require("missing").await, Err(StateError::NotFound(_))));
  }

  #[tokio::test]
  async fn queue_is_fifo() {
    let jobs = store();
    jobs.queue_push("a").await.unwrap();
    jobs.queue_push("b").await.unwrap();
    jobs.queue_push("c").await.unwrap();
    jobs.queue_remove("b").await.unwrap();

    assert_eq!(jobs.queue_pop().await.unwrap(), Some("a".to_string()));
    assert_eq!(jobs.queue_pop().await.unwrap(), Some("c".to_string()));
    assert_eq!(jobs.queue_pop().await.unwrap(), None);
  }

  #[tokio::test]
  async fn active_set_tracks_running_jobs() {
    let jobs = store();
    jobs.active_add("a").await.unwrap();
    jobs.active_add("b").await.unwrap();
    jobs.active_remove("a").await.unwrap();
    assert_eq!(jobs.active_list().await.unwrap(), vec!["b".to_string()]);
  }

  #[tokio::test]
  async fn cleanup_sweeps_only_old_terminal_records() {
    let jobs = store();

    let mut fresh_terminal = record("fresh");
    fresh_terminal.status = JobStatus::Completed;
    jobs.store(&fresh_terminal).await.unwrap();

    let mut old_terminal = record("old");
    old_terminal.status = JobStatus::Failed;
    old_terminal.updated_at = Utc::now() - chrono::Duration::hours(48);
    jobs.store(&old_terminal).await.unwrap();

    let mut old_running = record("running");
    old_running.status = JobStatus::Running;
    old_running.updated_at = Utc::now() - chrono::Duration::hours(48);
    jobs.store(&old_running).await.unwrap();

    let cleaned = jobs.cleanup_old(24).await.unwrap();
    assert_eq!(cleaned, 1);
    assert!(jobs.load("fresh").await.unwrap().is_some());
    assert!(jobs.load("old").await.unwrap().is_none());
    assert!(jobs.load("running").await.unwrap().is_some());
  }
}
