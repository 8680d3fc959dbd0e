use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of job failures by kind rather than by implementation type.
///
/// `ItemSkipped` is the only class absorbed locally by the parser; every other
/// kind flows up to the orchestrator, which decides between
/// retry-with-checkpoint, failed-batch persistence, or job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// Bad submission: missing content path, unsupported format, JSON Schema
  /// violations, bad path syntax.
  InputValidation,
  /// Unreadable file, truncated or malformed top-level framing.
  Structural,
  /// Per-item problem: unresolved path, empty content, bad NDJSON line.
  /// Counted and skipped, never fails the job.
  ItemSkipped,
  /// Rate limit, timeout, 5xx, connection reset from the embedding provider.
  EmbeddingTransient,
  /// Auth failure, permanently exceeded quota, malformed request.
  EmbeddingFatal,
  /// An emitted batch exceeded the provider hard limits. Always a bug.
  BatchInvariant,
  /// Collection temporarily unavailable, partial insert.
  StorageTransient,
  /// Schema or dimension mismatch in the vector store.
  StorageFatal,
  /// The job's cancellation token was tripped.
  Cancelled,
}

impl ErrorKind {
  /// Whether a job-level retry with checkpoint may succeed.
  pub fn is_recoverable(&self) -> bool {
    matches!(self, ErrorKind::EmbeddingTransient | ErrorKind::StorageTransient)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::InputValidation => "input_validation",
      ErrorKind::Structural => "structural",
      ErrorKind::ItemSkipped => "item_skipped",
      ErrorKind::EmbeddingTransient => "embedding_transient",
      ErrorKind::EmbeddingFatal => "embedding_fatal",
      ErrorKind::BatchInvariant => "batch_invariant_violation",
      ErrorKind::StorageTransient => "storage_transient",
      ErrorKind::StorageFatal => "storage_fatal",
      ErrorKind::Cancelled => "cancelled",
    }
  }
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// User-visible failure report attached to a failed job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
  pub kind: ErrorKind,
  pub message: String,
  pub recoverable: bool,
  pub occurred_at: DateTime<Utc>,
}

impl ErrorInfo {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      recoverable: kind.is_recoverable(),
      occurred_at: Utc::now(),
    }
  }
}
