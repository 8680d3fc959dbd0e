//! Job records: the durable description of an ingest task, its configuration,
//! status, and progress snapshot. Records are owned by the task manager and
//! persisted in the shared KV store under `processing_task:{job_id}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::{EmbeddingConfig, VectorStoreConfig};
use crate::error::ErrorInfo;
use crate::phase::ProcessingPhase;
use crate::schema::SchemaConfig;

/// Lifecycle states of an ingest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Queued,
  Running,
  Paused,
  Completed,
  Failed,
  Cancelled,
}

impl JobStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Queued => "queued",
      JobStatus::Running => "running",
      JobStatus::Paused => "paused",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
      JobStatus::Cancelled => "cancelled",
    }
  }
}

impl std::fmt::Display for JobStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Handle to the spooled upload being ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
  pub path: PathBuf,
  pub size: u64,
  pub filename: String,
}

/// Everything needed to run the job, captured at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
  pub schema: SchemaConfig,
  pub embedding: EmbeddingConfig,
  pub vector_store: VectorStoreConfig,
}

/// Progress counters mirrored onto the job record for cheap status reads.
/// The progress tracker holds the richer phase-history view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
  pub items_processed: u64,
  #[serde(default)]
  pub items_total: Option<u64>,
  pub chunks_processed: u64,
  pub embeddings_generated: u64,
  pub bytes_processed: u64,
  pub error_count: u64,
  #[serde(default)]
  pub current_phase: Option<ProcessingPhase>,
}

impl JobProgress {
  pub fn percentage(&self) -> Option<f64> {
    let total = self.items_total?;
    if total == 0 {
      return None;
    }
    Some(((self.items_processed as f64 / total as f64) * 100.0).min(100.0))
  }
}

/// Final counters returned when a job completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestOutcome {
  pub upserted: u64,
  pub dim: usize,
  pub stats: IngestRunStats,
}

/// Run statistics carried inside the outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRunStats {
  pub items_processed: u64,
  pub chunks_created: u64,
  pub embeddings_generated: u64,
  pub batches_processed: u64,
  pub errors_encountered: u64,
  pub processing_secs: f64,
}

/// The durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
  pub job_id: String,
  pub tenant_id: String,
  pub status: JobStatus,
  pub file: FileInfo,
  pub config: JobConfig,
  pub progress: JobProgress,
  #[serde(default)]
  pub error: Option<ErrorInfo>,
  #[serde(default)]
  pub results: Option<IngestOutcome>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl JobRecord {
  pub fn new(job_id: String, tenant_id: String, file: FileInfo, config: JobConfig) -> Self {
    let now = Utc::now();
    Self {
      job_id,
      tenant_id,
      status: JobStatus::Queued,
      file,
      config,
      progress: JobProgress::default(),
      error: None,
      results: None,
      created_at: now,
      updated_at: now,
    }
  }

  pub fn touch(&mut self) {
    self.updated_at = Utc::now();
  }

  pub fn elapsed_secs(&self) -> f64 {
    (Utc::now() - self.created_at).num_milliseconds() as f64 / 1000.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::EmbeddingConfig;
  use crate::schema::{ChunkingConfig, FieldMapping};

  fn record() -> JobRecord {
    JobRecord::new(
      "ingest_test".into(),
      "tenant-1".into(),
      FileInfo {
        path: PathBuf::from("/tmp/data.json"),
        size: 42,
        filename: "data.json".into(),
      },
      JobConfig {
        schema: SchemaConfig {
          format: None,
          validation_schema: None,
          mapping: FieldMapping {
            content_path: "c".into(),
            metadata_paths: Default::default(),
          },
          chunking: ChunkingConfig::None,
        },
        embedding: EmbeddingConfig::default(),
        vector_store: serde_json::from_str(r#"{ "uri": "http://localhost:19530", "collection": "docs" }"#).unwrap(),
      },
    )
  }

  #[test]
  fn new_record_is_queued() {
    let record = record();
    assert_eq!(record.status, JobStatus::Queued);
    assert!(record.error.is_none());
    assert!(!record.status.is_terminal());
  }

  #[test]
  fn percentage_needs_total() {
    let mut progress = JobProgress::default();
    assert_eq!(progress.percentage(), None);
    progress.items_total = Some(200);
    progress.items_processed = 50;
    assert_eq!(progress.percentage(), Some(25.0));
    progress.items_processed = 400;
    assert_eq!(progress.percentage(), Some(100.0));
  }

  #[test]
  fn record_roundtrips_through_json() {
    let record = record();
    let json = serde_json::to_string(&record).unwrap();
    let back: JobRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back.job_id, "ingest_test");
    assert_eq!(back.status, JobStatus::Queued);
  }
}
