//! Durable checkpoints, the failed-batch queue, and recovery contexts.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use silt_core::ErrorInfo;

use crate::keys;
use crate::kv::Kv;
use crate::StateError;

/// A persisted summary of how far a job has progressed, sufficient to resume.
/// One current checkpoint per job, overwritten in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
  pub job_id: String,
  pub file_path: String,
  pub file_offset: u64,
  pub items_processed: u64,
  pub chunks_processed: u64,
  pub embeddings_generated: u64,
  #[serde(default)]
  pub processing_state: BTreeMap<String, String>,
  pub created_at: DateTime<Utc>,
}

impl Checkpoint {
  pub fn age_hours(&self) -> f64 {
    (Utc::now() - self.created_at).num_milliseconds() as f64 / 3_600_000.0
  }
}

/// Texts and metadata of a batch whose embedding or upsert failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedBatchPayload {
  pub texts: Vec<String>,
  pub metadatas: Vec<Value>,
}

/// A failed batch persisted for possible retry. Exists only while its items
/// have not been durably upserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedBatch {
  pub failed_id: String,
  pub job_id: String,
  pub payload: FailedBatchPayload,
  pub error: ErrorInfo,
  pub retry_count: u32,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub last_retry_at: Option<DateTime<Utc>>,
}

/// What a resuming job starts from.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
  pub checkpoint: Checkpoint,
  pub should_retry_failed: bool,
  pub retry_count: u32,
  pub max_retries: u32,
}

impl RecoveryContext {
  pub fn can_retry(&self) -> bool {
    self.retry_count < self.max_retries
  }
}

/// Recovery statistics surfaced through the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
  pub recoverable: bool,
  #[serde(default)]
  pub checkpoint_age_hours: Option<f64>,
  pub items_processed: u64,
  pub chunks_processed: u64,
  pub embeddings_generated: u64,
  pub failed_batches_count: usize,
  pub failed_items_count: usize,
}

/// Checkpoint persistence over the shared KV store. A job has at most one
/// writer, so no cross-job locking is needed.
pub struct CheckpointStore {
  kv: Arc<dyn Kv>,
  checkpoint_interval: u64,
}

impl CheckpointStore {
  pub fn new(kv: Arc<dyn Kv>, checkpoint_interval: u64) -> Self {
    Self {
      kv,
      checkpoint_interval: checkpoint_interval.max(1),
    }
  }

  fn checkpoint_key(job_id: &str) -> String {
    format!("{}{job_id}", keys::CHECKPOINT_PREFIX)
  }

  fn failed_batch_key(failed_id: &str) -> String {
    format!("{}{failed_id}", keys::FAILED_BATCH_PREFIX)
  }

  /// Write a checkpoint when forced or when `items_processed` lands on the
  /// configured interval. Returns whether a write happened.
  #[allow(clippy::too_many_arguments)]
  pub async fn save(
    &self,
    job_id: &str,
    file_path: &str,
    file_offset: u64,
    items_processed: u64,
    chunks_processed: u64,
    embeddings_generated: u64,
    processing_state: BTreeMap<String, String>,
    force: bool,
  ) -> Result<bool, StateError> {
    if !force && items_processed % self.checkpoint_interval != 0 {
      return Ok(false);
    }

    let checkpoint = Checkpoint {
      job_id: job_id.to_string(),
      file_path: file_path.to_string(),
      file_offset,
      items_processed,
      chunks_processed,
      embeddings_generated,
      processing_state,
      created_at: Utc::now(),
    };

    let raw = serde_json::to_string(&checkpoint)?;
    self
      .kv
      .set_ex(&Self::checkpoint_key(job_id), &raw, keys::CHECKPOINT_TTL)
      .await?;
    debug!(job_id, items_processed, "saved checkpoint");
    Ok(true)
  }

  pub async fn load(&self, job_id: &str) -> Result<Option<Checkpoint>, StateError> {
    match self.kv.get(&Self::checkpoint_key(job_id)).await? {
      Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      None => Ok(None),
    }
  }

  /// Delete after successful completion.
  pub async fn delete(&self, job_id: &str) -> Result<bool, StateError> {
    self.kv.del(&Self::checkpoint_key(job_id)).await
  }

  /// Persist a batch whose embedding or upsert failed. Returns the failed id.
  pub async fn save_failed_batch(
    &self,
    job_id: &str,
    payload: FailedBatchPayload,
    error: ErrorInfo,
  ) -> Result<String, StateError> {
    let failed_id = format!("{job_id}_{}", Utc::now().timestamp());
    let batch = FailedBatch {
      failed_id: failed_id.clone(),
      job_id: job_id.to_string(),
      payload,
      error,
      retry_count: 0,
      created_at: Utc::now(),
      last_retry_at: None,
    };

    let raw = serde_json::to_string(&batch)?;
    self
      .kv
      .set_ex(&Self::failed_batch_key(&failed_id), &raw, keys::FAILED_BATCH_TTL)
      .await?;
    warn!(%job_id, %failed_id, items = batch.payload.texts.len(), "saved failed batch");
    Ok(failed_id)
  }

  pub async fn list_failed_batches(&self, job_id: &str) -> Result<Vec<FailedBatch>, StateError> {
    let pattern = format!("{}{job_id}_*", keys::FAILED_BATCH_PREFIX);
    let mut batches = Vec::new();
    for key in self.kv.keys(&pattern).await? {
      if let Some(raw) = self.kv.get(&key).await? {
        match serde_json::from_str::<FailedBatch>(&raw) {
          Ok(batch) => batches.push(batch),
          Err(e) => warn!(key = %key, error = %e, "skipping undecodable failed batch"),
        }
      }
    }
    batches.sort_by_key(|b| b.created_at);
    Ok(batches)
  }

  /// Take a failed batch for another attempt: increments `retry_count` and
  /// refreshes the TTL, or returns None once the cap is reached.
  pub async fn retry_failed_batch(
    &self,
    failed_id: &str,
    max_retries: u32,
  ) -> Result<Option<FailedBatchPayload>, StateError> {
    let key = Self::failed_batch_key(failed_id);
    let Some(raw) = self.kv.get(&key).await? else {
      return Ok(None);
    };

    let mut batch: FailedBatch = serde_json::from_str(&raw)?;
    if batch.retry_count >= max_retries {
      warn!(failed_id, retry_count = batch.retry_count, "failed batch exceeded max retries");
      return Ok(None);
    }

    batch.retry_count += 1;
    batch.last_retry_at = Some(Utc::now());
    let raw = serde_json::to_string(&batch)?;
    self.kv.set_ex(&key, &raw, keys::FAILED_BATCH_TTL).await?;

    info!(failed_id, attempt = batch.retry_count, "retrying failed batch");
    Ok(Some(batch.payload))
  }

  /// Delete a failed batch whose items are now durably upserted.
  pub async fn mark_batch_recovered(&self, failed_id: &str) -> Result<bool, StateError> {
    let removed = self.kv.del(&Self::failed_batch_key(failed_id)).await?;
    if removed {
      info!(failed_id, "marked failed batch as recovered");
    }
    Ok(removed)
  }

  /// Build a recovery context from the stored checkpoint and failed batches,
  /// or None when the job has nothing to resume from.
  pub async fn recovery_context(&self, job_id: &str, max_retries: u32) -> Result<Option<RecoveryContext>, StateError> {
    let Some(checkpoint) = self.load(job_id).await? else {
      debug!(job_id, "no checkpoint found, starting fresh");
      return Ok(None);
    };

    let failed = self.list_failed_batches(job_id).await?;
    let retry_count = checkpoint
      .processing_state
      .get("retry_count")
      .and_then(|v| v.parse().ok())
      .unwrap_or(0);

    info!(
      job_id,
      items_processed = checkpoint.items_processed,
      failed_batches = failed.len(),
      "created recovery context"
    );

    Ok(Some(RecoveryContext {
      checkpoint,
      should_retry_failed: !failed.is_empty(),
      retry_count,
      max_retries,
    }))
  }

  /// Recovery statistics for the control API.
  pub async fn recovery_report(&self, job_id: &str) -> Result<RecoveryReport, StateError> {
    let checkpoint = self.load(job_id).await?;
    let failed = self.list_failed_batches(job_id).await?;
    let failed_items: usize = failed.iter().map(|b| b.payload.texts.len()).sum();

    match checkpoint {
      None => Ok(RecoveryReport {
        recoverable: false,
        checkpoint_age_hours: None,
        items_processed: 0,
        chunks_processed: 0,
        embeddings_generated: 0,
        failed_batches_count: failed.len(),
        failed_items_count: failed_items,
      }),
      Some(checkpoint) => Ok(RecoveryReport {
        recoverable: true,
        checkpoint_age_hours: Some(checkpoint.age_hours()),
        items_processed: checkpoint.items_processed,
        chunks_processed: checkpoint.chunks_processed,
        embeddings_generated: checkpoint.embeddings_generated,
        failed_batches_count: failed.len(),
        failed_items_count: failed_items,
      }),
    }
  }

  /// Delete checkpoints and failed batches older than the cutoff. The TTLs
  /// already bound their lifetime; this sweep tightens it when the operator
  /// lowers the retention window.
  pub async fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<usize, StateError> {
    let mut cleaned = 0usize;

    for key in self.kv.keys(&format!("{}*", keys::CHECKPOINT_PREFIX)).await? {
      if let Some(raw) = self.kv.get(&key).await?
        && let Ok(checkpoint) = serde_json::from_str::<Checkpoint>(&raw)
        && checkpoint.created_at < cutoff
        && self.kv.del(&key).await?
      {
        cleaned += 1;
      }
    }

    for key in self.kv.keys(&format!("{}*", keys::FAILED_BATCH_PREFIX)).await? {
      if let Some(raw) = self.kv.get(&key).await?
        && let Ok(batch) = serde_json::from_str::<FailedBatch>(&raw)
        && batch.created_at < cutoff
        && self.kv.del(&key).await?
      {
        cleaned += 1;
      }
    }

    if cleaned > 0 {
      info!(cleaned, "cleaned up old checkpoints and failed batches");
    }
    Ok(cleaned)
  }
}
