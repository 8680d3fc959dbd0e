//! Vector store client: collection lifecycle and row upserts against a
//! Milvus-compatible HTTP API.
//!
//! The orchestrator talks to the [`VectorSink`] trait so tests can substitute
//! an in-memory sink; [`MilvusClient`] is the production implementation.

mod milvus;

pub use milvus::MilvusClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use silt_core::ErrorKind;

/// One row headed for the collection: text, vector, optional metadata as a
/// JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRow {
  pub text: String,
  pub embedding: Vec<f32>,
  #[serde(default)]
  pub metadata: Option<String>,
}

/// Result of an idempotent ensure-collection call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
  Created,
  Exists,
}

/// Result of an upsert. `inserted_count < requested_count` is surfaced as a
/// warning by the caller, not a failure.
#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
  pub inserted_count: usize,
  pub requested_count: usize,
}

impl UpsertOutcome {
  pub fn is_partial(&self) -> bool {
    self.inserted_count < self.requested_count
  }
}

/// A scored search hit, consumed by the chat-time collaborator.
#[derive(Debug, Clone)]
pub struct SearchHit {
  pub text: String,
  pub score: f32,
}

/// The narrow surface the ingest pipeline needs from a vector store.
#[async_trait]
pub trait VectorSink: Send + Sync {
  /// Create the collection (with index) if missing and load it. Idempotent.
  async fn ensure_collection(&self, dim: usize) -> Result<EnsureOutcome, StoreError>;

  /// Insert rows and flush them to durable state.
  async fn upsert(&self, rows: Vec<VectorRow>) -> Result<UpsertOutcome, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("vector store returned code {code}: {message}")]
  Server { code: i64, message: String },
  #[error("unexpected vector store response: {0}")]
  Unexpected(String),
  #[error("dimension mismatch: collection has {collection}, rows have {rows}")]
  DimensionMismatch { collection: usize, rows: usize },
}

impl StoreError {
  /// Map into the job-level taxonomy. Schema and dimension problems are
  /// fatal; transport hiccups and server-side unavailability are transient.
  pub fn kind(&self) -> ErrorKind {
    match self {
      StoreError::DimensionMismatch { .. } => ErrorKind::StorageFatal,
      StoreError::Server { message, .. } => {
        let lowered = message.to_lowercase();
        if lowered.contains("schema") || lowered.contains("mismatch") || lowered.contains("dim") {
          ErrorKind::StorageFatal
        } else {
          ErrorKind::StorageTransient
        }
      }
      StoreError::Request(_) | StoreError::Unexpected(_) => ErrorKind::StorageTransient,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_upserts_are_detectable() {
    let full = UpsertOutcome {
      inserted_count: 5,
      requested_count: 5,
    };
    assert!(!full.is_partial());

    let partial = UpsertOutcome {
      inserted_count: 3,
      requested_count: 5,
    };
    assert!(partial.is_partial());
  }

  #[test]
  fn error_kinds_split_fatal_from_transient() {
    let fatal = StoreError::DimensionMismatch { collection: 4, rows: 8 };
    assert_eq!(fatal.kind(), ErrorKind::StorageFatal);

    let schema = StoreError::Server {
      code: 1100,
      message: "schema mismatch on field embedding".into(),
    };
    assert_eq!(schema.kind(), ErrorKind::StorageFatal);

    let unavailable = StoreError::Server {
      code: 503,
      message: "collection not loaded yet".into(),
    };
    assert_eq!(unavailable.kind(), ErrorKind::StorageTransient);
  }
}
