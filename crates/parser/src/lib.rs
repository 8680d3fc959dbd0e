//! Streaming JSON processing for memory-efficient ingestion of large corpora.
//!
//! The pipeline here turns a file stream plus a [`SchemaConfig`] into a lazy
//! sequence of [`ProcessedItem`]s without ever materializing the whole file:
//!
//! ```text
//! bytes -> source (gzip detect, byte counting)
//!       -> stream (one top-level element / line at a time)
//!       -> extract (dot-path content + metadata)
//!       -> chunk (none | recursive | token_aware)
//!       -> ProcessedItem
//! ```
//!
//! Per-item problems (bad mapping result, undecodable line) are logged,
//! counted, and skipped; structural problems (unreadable file, broken array
//! framing) abort the stream.

mod chunk;
mod path;
mod processor;
mod source;
mod stream;

pub use chunk::Chunker;
pub use path::ParsedPath;
pub use processor::{FileStats, ParserStats, ProcessedItem, StreamingProcessor, file_stats};
pub use source::{Source, detect_format, open_source};

use silt_core::{ErrorInfo, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum ParserError {
  #[error("failed to open {path}: {source}")]
  Open {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("io error while streaming: {0}")]
  Io(#[from] std::io::Error),
  #[error("invalid {0} in mapping: {1}")]
  PathSyntax(&'static str, String),
  #[error("invalid validation schema: {0}")]
  SchemaCompile(String),
  #[error("schema validation failed with {} error(s): {}", errors.len(), errors.join("; "))]
  SchemaValidation { errors: Vec<String> },
  #[error("malformed {format} input: {message}")]
  Framing { format: &'static str, message: String },
}

impl ParserError {
  /// Map into the job-level error taxonomy.
  pub fn kind(&self) -> ErrorKind {
    match self {
      ParserError::PathSyntax(..) | ParserError::SchemaCompile(_) | ParserError::SchemaValidation { .. } => {
        ErrorKind::InputValidation
      }
      ParserError::Open { .. } | ParserError::Io(_) | ParserError::Framing { .. } => ErrorKind::Structural,
    }
  }
}

impl From<ParserError> for ErrorInfo {
  fn from(err: ParserError) -> Self {
    ErrorInfo::new(err.kind(), err.to_string())
  }
}
