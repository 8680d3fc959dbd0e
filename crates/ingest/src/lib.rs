//! The ingestion engine: batch packing, the per-job orchestrator, and the
//! background task manager that owns job lifecycles.
//!
//! ```text
//! submit ──► [queued] ──► worker slot ──► orchestrator
//!                              │             parser ─► batcher ─► embedder ─► sink
//!                              │                 checkpoints ▲  progress ▲
//!                              └── pause/resume/cancel via a per-job token
//! ```

mod batch;
mod context;
mod manager;
mod orchestrator;

pub use batch::{Batch, BatchItem, BatchManager, BatchStats};
pub use context::{Backends, IngestContext, LiveBackends};
pub use manager::{ControlAction, JobSubmission, JobSummary, ProgressSummary, StatusReport, TaskManager, TimingSummary};

use embedding::{EmbeddingError, is_retryable_error};
use parser::ParserError;
use silt_core::{ErrorInfo, ErrorKind, JobStatus};
use state::StateError;
use vectordb::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
  #[error(transparent)]
  Parser(#[from] ParserError),
  #[error(transparent)]
  Embedding(#[from] EmbeddingError),
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  State(#[from] StateError),
  #[error("batch invariant violated: {0}")]
  BatchInvariant(String),
  #[error("invalid submission: {0}")]
  Validation(String),
  #[error("job cancelled")]
  Cancelled,
  #[error("cannot {action} a {status} job")]
  IllegalTransition { action: &'static str, status: JobStatus },
  #[error("job not found: {0}")]
  NotFound(String),
}

impl IngestError {
  /// Map into the job-level error taxonomy: transients are candidates for
  /// retry-with-checkpoint, everything else fails the job.
  pub fn kind(&self) -> ErrorKind {
    match self {
      IngestError::Parser(e) => e.kind(),
      IngestError::Embedding(EmbeddingError::Cancelled) => ErrorKind::Cancelled,
      IngestError::Embedding(e) if is_retryable_error(e) => ErrorKind::EmbeddingTransient,
      IngestError::Embedding(_) => ErrorKind::EmbeddingFatal,
      IngestError::Store(e) => e.kind(),
      // KV hiccups are worth a retry; the store carries the durable truth
      IngestError::State(_) => ErrorKind::StorageTransient,
      IngestError::BatchInvariant(_) => ErrorKind::BatchInvariant,
      IngestError::Validation(_) | IngestError::IllegalTransition { .. } | IngestError::NotFound(_) => {
        ErrorKind::InputValidation
      }
      IngestError::Cancelled => ErrorKind::Cancelled,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self.kind(), ErrorKind::Cancelled)
  }

  pub fn recoverable(&self) -> bool {
    self.kind().is_recoverable()
  }

  pub fn to_info(&self) -> ErrorInfo {
    ErrorInfo::new(self.kind(), self.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kinds_map_through_component_errors() {
    let transient = IngestError::Embedding(EmbeddingError::Timeout);
    assert_eq!(transient.kind(), ErrorKind::EmbeddingTransient);
    assert!(transient.recoverable());

    let fatal = IngestError::Embedding(EmbeddingError::NoApiKey);
    assert_eq!(fatal.kind(), ErrorKind::EmbeddingFatal);
    assert!(!fatal.recoverable());

    let cancelled = IngestError::Embedding(EmbeddingError::Cancelled);
    assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
    assert!(cancelled.is_cancelled());

    let invariant = IngestError::BatchInvariant("too big".into());
    assert_eq!(invariant.kind(), ErrorKind::BatchInvariant);
    assert!(!invariant.recoverable());
  }
}
