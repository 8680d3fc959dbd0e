//! Shared durable state for the ingest service.
//!
//! Everything long-lived sits in one key-value store with per-key TTLs:
//!
//! | key | value | TTL |
//! |---|---|---|
//! | `processing_task:{job}` | job record | 48h |
//! | `task_queue` | list of queued job ids | - |
//! | `active_tasks` | set of running job ids | - |
//! | `checkpoint:{job}` | checkpoint | 7d |
//! | `failed_batch:{id}` | failed batch payload | 24h |
//! | `progress:{job}` | progress snapshot | 7d |
//!
//! The [`Kv`] trait narrows the store to the atomic primitives the service
//! needs; [`RedisKv`] is the production backend and [`MemoryKv`] backs tests
//! and single-process deployments. Each record has a single writer (the
//! owning job); readers are many; no transactions are required.

mod checkpoint;
mod jobs;
mod kv;
mod progress;

pub use checkpoint::{Checkpoint, CheckpointStore, FailedBatch, FailedBatchPayload, RecoveryContext, RecoveryReport};
pub use jobs::JobStore;
pub use kv::{Kv, MemoryKv, RedisKv};
pub use progress::{DetailedProgress, PhaseProgress, ProgressCounters, ProgressSnapshot, ProgressTracker};

/// Key prefixes and TTLs for the store layout.
pub mod keys {
  use std::time::Duration;

  pub const TASK_PREFIX: &str = "processing_task:";
  pub const TASK_QUEUE: &str = "task_queue";
  pub const ACTIVE_TASKS: &str = "active_tasks";
  pub const CHECKPOINT_PREFIX: &str = "checkpoint:";
  pub const FAILED_BATCH_PREFIX: &str = "failed_batch:";
  pub const PROGRESS_PREFIX: &str = "progress:";

  pub const TASK_TTL: Duration = Duration::from_secs(48 * 3600);
  pub const CHECKPOINT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
  pub const FAILED_BATCH_TTL: Duration = Duration::from_secs(24 * 3600);
  pub const PROGRESS_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
  #[error("kv operation failed: {0}")]
  Kv(#[from] redis::RedisError),
  #[error("serialization failed: {0}")]
  Serde(#[from] serde_json::Error),
  #[error("record not found: {0}")]
  NotFound(String),
}
