//! Tenant-submitted schema configuration: source format, optional JSON Schema
//! validation, field mapping, and chunking strategy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ErrorInfo, ErrorKind};

/// Wire format of the submitted corpus file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
  JsonArray,
  Ndjson,
}

impl SourceFormat {
  pub fn as_str(&self) -> &'static str {
    match self {
      SourceFormat::JsonArray => "json_array",
      SourceFormat::Ndjson => "ndjson",
    }
  }
}

/// Dot/bracket paths mapping the source objects to content and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
  /// Path to the text that gets embedded. Required, must resolve to a
  /// nonempty string or the object is skipped.
  pub content_path: String,
  /// Named paths copied into each chunk's metadata. Missing paths yield null.
  #[serde(default)]
  pub metadata_paths: BTreeMap<String, String>,
}

fn default_max_chars() -> usize {
  1200
}
fn default_overlap() -> usize {
  150
}
fn default_max_tokens() -> usize {
  1000
}
fn default_overlap_tokens() -> usize {
  100
}

/// How a document's content is split before batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ChunkingConfig {
  /// One chunk equal to the whole content.
  None,
  /// Greedy character windows with overlap backoff.
  Recursive {
    #[serde(default = "default_max_chars")]
    max_chars: usize,
    #[serde(default = "default_overlap")]
    overlap: usize,
  },
  /// Same window shape, but the units are tokens counted against the target
  /// embedding model. Degrades to character windows when no counter is
  /// available.
  TokenAware {
    #[serde(default = "default_max_tokens")]
    max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    overlap_tokens: usize,
    #[serde(default)]
    model_name: Option<String>,
  },
}

impl Default for ChunkingConfig {
  fn default() -> Self {
    ChunkingConfig::None
  }
}

/// Complete schema configuration as submitted with a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
  /// Explicit source format. When absent the parser auto-detects.
  #[serde(default)]
  pub format: Option<SourceFormat>,
  /// Optional JSON Schema (draft-07) every source object must satisfy.
  #[serde(default)]
  pub validation_schema: Option<serde_json::Value>,
  pub mapping: FieldMapping,
  #[serde(default)]
  pub chunking: ChunkingConfig,
}

impl SchemaConfig {
  /// Validate the configuration itself before any processing starts.
  ///
  /// Catches the submission-time problems that must fail the job immediately:
  /// missing content path, degenerate chunking windows.
  pub fn validate(&self) -> Result<(), ErrorInfo> {
    if self.mapping.content_path.trim().is_empty() {
      return Err(ErrorInfo::new(
        ErrorKind::InputValidation,
        "mapping.content_path is required",
      ));
    }

    match &self.chunking {
      ChunkingConfig::None => {}
      ChunkingConfig::Recursive { max_chars, overlap } => {
        if *max_chars == 0 {
          return Err(ErrorInfo::new(ErrorKind::InputValidation, "chunking.max_chars must be > 0"));
        }
        if overlap >= max_chars {
          return Err(ErrorInfo::new(
            ErrorKind::InputValidation,
            format!("chunking.overlap ({overlap}) must be smaller than max_chars ({max_chars})"),
          ));
        }
      }
      ChunkingConfig::TokenAware {
        max_tokens,
        overlap_tokens,
        ..
      } => {
        if *max_tokens == 0 {
          return Err(ErrorInfo::new(
            ErrorKind::InputValidation,
            "chunking.max_tokens must be > 0",
          ));
        }
        if overlap_tokens >= max_tokens {
          return Err(ErrorInfo::new(
            ErrorKind::InputValidation,
            format!("chunking.overlap_tokens ({overlap_tokens}) must be smaller than max_tokens ({max_tokens})"),
          ));
        }
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn base_schema(chunking: ChunkingConfig) -> SchemaConfig {
    SchemaConfig {
      format: Some(SourceFormat::JsonArray),
      validation_schema: None,
      mapping: FieldMapping {
        content_path: "c".into(),
        metadata_paths: BTreeMap::new(),
      },
      chunking,
    }
  }

  #[test]
  fn deserializes_submitted_shape() {
    let raw = r#"{
      "format": "ndjson",
      "mapping": { "content_path": "items[0].content", "metadata_paths": {"url": "source.url"} },
      "chunking": { "strategy": "token_aware", "max_tokens": 512, "overlap_tokens": 64, "model_name": "voyage-large-2" }
    }"#;
    let schema: SchemaConfig = serde_json::from_str(raw).unwrap();
    assert_eq!(schema.format, Some(SourceFormat::Ndjson));
    assert_eq!(schema.mapping.content_path, "items[0].content");
    match schema.chunking {
      ChunkingConfig::TokenAware {
        max_tokens,
        overlap_tokens,
        model_name,
      } => {
        assert_eq!(max_tokens, 512);
        assert_eq!(overlap_tokens, 64);
        assert_eq!(model_name.as_deref(), Some("voyage-large-2"));
      }
      other => panic!("unexpected chunking: {other:?}"),
    }
  }

  #[test]
  fn chunking_defaults_apply() {
    let raw = r#"{ "mapping": { "content_path": "c" }, "chunking": { "strategy": "recursive" } }"#;
    let schema: SchemaConfig = serde_json::from_str(raw).unwrap();
    match schema.chunking {
      ChunkingConfig::Recursive { max_chars, overlap } => {
        assert_eq!(max_chars, 1200);
        assert_eq!(overlap, 150);
      }
      other => panic!("unexpected chunking: {other:?}"),
    }
  }

  #[test]
  fn missing_content_path_rejected() {
    let mut schema = base_schema(ChunkingConfig::None);
    schema.mapping.content_path = "  ".into();
    let err = schema.validate().unwrap_err();
    assert_eq!(err.kind, ErrorKind::InputValidation);
  }

  #[test]
  fn overlap_must_be_below_window() {
    let schema = base_schema(ChunkingConfig::Recursive {
      max_chars: 100,
      overlap: 100,
    });
    assert!(schema.validate().is_err());

    let schema = base_schema(ChunkingConfig::TokenAware {
      max_tokens: 100,
      overlap_tokens: 10,
      model_name: None,
    });
    assert!(schema.validate().is_ok());
  }
}
