//! The streaming processor: schema-driven extraction and chunking over an
//! incremental item feed.

use std::collections::VecDeque;
use std::io::{BufRead, Read};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use silt_core::{ProcessingPhase, SchemaConfig, SourceFormat};

use crate::ParserError;
use crate::chunk::Chunker;
use crate::path::ParsedPath;
use crate::source::{detect_format, open_source};
use crate::stream::{Feed, ItemFeed, JsonArrayItems, NdjsonItems};

/// One chunk of extracted content, ready for batching. Produced lazily and
/// never stored by the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedItem {
  pub text: String,
  pub metadata: Map<String, Value>,
  pub source_index: u64,
  pub chunk_index: u32,
  pub total_chunks: u32,
}

/// Live counters for the stream.
#[derive(Debug, Clone)]
pub struct ParserStats {
  /// Source objects parsed (including content-skipped ones).
  pub items_processed: u64,
  /// Raw bytes consumed from the file (compressed bytes for gzip input).
  pub bytes_processed: u64,
  /// Per-item problems absorbed so far.
  pub errors_encountered: u64,
  pub current_phase: ProcessingPhase,
}

/// Memory-bounded transformation of a corpus file into [`ProcessedItem`]s.
///
/// Single consumer, not restartable; a resumed job opens a fresh processor
/// and calls [`StreamingProcessor::skip_items`] with the checkpointed count.
impl std::fmt::Debug for StreamingProcessor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamingProcessor").finish_non_exhaustive()
  }
}

pub struct StreamingProcessor {
  feed: ItemFeed,
  bytes_read: Arc<AtomicU64>,
  content_path: ParsedPath,
  metadata_paths: Vec<(String, ParsedPath)>,
  validator: Option<jsonschema::Validator>,
  chunker: Chunker,
  stats: ParserStats,
  /// Chunks of the element currently being drained.
  pending: VecDeque<ProcessedItem>,
  skip_remaining: u64,
}

impl StreamingProcessor {
  /// Open a file and prepare the extraction pipeline.
  ///
  /// Fails fast on submission-time problems: bad paths, an uncompilable
  /// validation schema, an unreadable file. `fallback_model` feeds
  /// token-aware chunking when the schema names no model of its own.
  pub fn open(path: &Path, schema: &SchemaConfig, fallback_model: &str) -> Result<Self, ParserError> {
    let content_path = ParsedPath::parse(&schema.mapping.content_path)
      .map_err(|_| ParserError::PathSyntax("content_path", schema.mapping.content_path.clone()))?;

    let mut metadata_paths = Vec::with_capacity(schema.mapping.metadata_paths.len());
    for (name, raw) in &schema.mapping.metadata_paths {
      let parsed =
        ParsedPath::parse(raw).map_err(|_| ParserError::PathSyntax("metadata_path", format!("{name}: {raw}")))?;
      metadata_paths.push((name.clone(), parsed));
    }

    let validator = match &schema.validation_schema {
      Some(raw) => Some(jsonschema::draft7::new(raw).map_err(|e| ParserError::SchemaCompile(e.to_string()))?),
      None => None,
    };

    let format = match schema.format {
      Some(format) => format,
      None => {
        let detected = detect_format(path)?;
        info!(path = %path.display(), format = detected.as_str(), "auto-detected source format");
        detected
      }
    };

    let source = open_source(path)?;
    let bytes_read = source.bytes_read.clone();
    let feed = match format {
      SourceFormat::JsonArray => ItemFeed::Array(JsonArrayItems::new(source.reader)),
      SourceFormat::Ndjson => ItemFeed::Lines(NdjsonItems::new(source.reader)),
    };

    debug!(path = %path.display(), format = format.as_str(), "streaming processor ready");

    Ok(Self {
      feed,
      bytes_read,
      content_path,
      metadata_paths,
      validator,
      chunker: Chunker::from_config(&schema.chunking, fallback_model),
      stats: ParserStats {
        items_processed: 0,
        bytes_processed: 0,
        errors_encountered: 0,
        current_phase: ProcessingPhase::Initializing,
      },
      pending: VecDeque::new(),
      skip_remaining: 0,
    })
  }

  /// Pass over the first `n` source objects without extracting them.
  ///
  /// Used on resume: the checkpoint records how many source objects are
  /// already durable, and skipped objects are not re-validated.
  pub fn skip_items(&mut self, n: u64) {
    self.skip_remaining = n;
  }

  pub fn stats(&self) -> ParserStats {
    let mut stats = self.stats.clone();
    stats.bytes_processed = self.bytes_read.load(Ordering::Relaxed);
    stats
  }

  /// Pull the next chunk. `Ok(None)` marks a clean end of stream.
  pub fn next_item(&mut self) -> Result<Option<ProcessedItem>, ParserError> {
    if self.stats.current_phase == ProcessingPhase::Initializing {
      self.stats.current_phase = ProcessingPhase::Parsing;
    }

    loop {
      if let Some(item) = self.pending.pop_front() {
        return Ok(Some(item));
      }

      let feed = match self.feed.next_raw() {
        Ok(feed) => feed,
        Err(e) => {
          self.stats.current_phase = ProcessingPhase::Error;
          self.stats.errors_encountered += 1;
          return Err(e);
        }
      };

      match feed {
        Feed::Eof => {
          self.stats.current_phase = ProcessingPhase::Completed;
          return Ok(None);
        }
        Feed::Skipped => {
          self.stats.errors_encountered += 1;
        }
        Feed::Item(index, value) => {
          self.stats.items_processed += 1;

          if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            continue;
          }

          if let Some(validator) = &self.validator {
            let errors: Vec<String> = validator
              .iter_errors(&value)
              .take(20)
              .map(|e| format!("{}: {e}", e.instance_path))
              .collect();
            if !errors.is_empty() {
              self.stats.current_phase = ProcessingPhase::Error;
              return Err(ParserError::SchemaValidation { errors });
            }
          }

          self.expand_item(index, &value);
        }
      }
    }
  }

  /// Extract content and metadata from one source object and queue its
  /// chunks. Objects without usable content are skipped quietly.
  fn expand_item(&mut self, index: u64, value: &Value) {
    let content = match self.content_path.resolve(value).and_then(Value::as_str) {
      Some(text) if !text.trim().is_empty() => text,
      _ => {
        warn!(
          source_index = index,
          path = self.content_path.raw(),
          "content path did not resolve to nonempty text, skipping item"
        );
        return;
      }
    };

    let mut metadata = Map::new();
    for (name, path) in &self.metadata_paths {
      let resolved = path.resolve(value).cloned().unwrap_or(Value::Null);
      metadata.insert(name.clone(), resolved);
    }
    metadata.insert("_source_index".to_string(), json!(index));

    let chunks = self.chunker.chunk(content);
    let total_chunks = chunks.len() as u32;

    for (chunk_index, text) in chunks.into_iter().enumerate() {
      let mut chunk_metadata = metadata.clone();
      chunk_metadata.insert("_chunk_index".to_string(), json!(chunk_index));
      chunk_metadata.insert("_total_chunks".to_string(), json!(total_chunks));

      self.pending.push_back(ProcessedItem {
        text,
        metadata: chunk_metadata,
        source_index: index,
        chunk_index: chunk_index as u32,
        total_chunks,
      });
    }
  }
}

/// Cheap statistics about a corpus file, gathered without full processing.
#[derive(Debug, Clone)]
pub struct FileStats {
  pub file_size_bytes: u64,
  pub detected_format: SourceFormat,
  pub estimated_items: u64,
}

/// Estimate item counts for the status API's expected totals. The array
/// estimate samples the first 10 KiB and divides commas by ten; the NDJSON
/// estimate counts up to a thousand lines. Informational only.
pub fn file_stats(path: &Path) -> Result<FileStats, ParserError> {
  let metadata = std::fs::metadata(path).map_err(|e| ParserError::Open {
    path: path.display().to_string(),
    source: e,
  })?;
  let detected_format = detect_format(path)?;

  let source = open_source(path)?;
  let mut reader = source.reader;

  let estimated_items = match detected_format {
    SourceFormat::JsonArray => {
      let mut sample = vec![0u8; 10 * 1024];
      let mut filled = 0usize;
      while filled < sample.len() {
        let n = reader.read(&mut sample[filled..])?;
        if n == 0 {
          break;
        }
        filled += n;
      }
      let commas = sample[..filled].iter().filter(|b| **b == b',').count() as u64;
      (commas / 10).max(1)
    }
    SourceFormat::Ndjson => {
      let mut count = 0u64;
      let mut line = String::new();
      while count < 1000 {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
          break;
        }
        if !line.trim().is_empty() {
          count += 1;
        }
      }
      count.max(1)
    }
  };

  Ok(FileStats {
    file_size_bytes: metadata.len(),
    detected_format,
    estimated_items,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use silt_core::{ChunkingConfig, FieldMapping};
  use std::io::Write;
  use tempfile::NamedTempFile;

  fn write_temp(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
  }

  fn schema(content_path: &str) -> SchemaConfig {
    SchemaConfig {
      format: None,
      validation_schema: None,
      mapping: FieldMapping {
        content_path: content_path.to_string(),
        metadata_paths: Default::default(),
      },
      chunking: ChunkingConfig::None,
    }
  }

  fn drain(processor: &mut StreamingProcessor) -> Vec<ProcessedItem> {
    let mut out = Vec::new();
    while let Some(item) = processor.next_item().unwrap() {
      out.push(item);
    }
    out
  }

  #[test]
  fn small_array_extracts_items() {
    let file = write_temp(r#"[{"c":"hello"},{"c":"world"}]"#);
    let mut processor = StreamingProcessor::open(file.path(), &schema("c"), "voyage-2").unwrap();
    let items = drain(&mut processor);

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].text, "hello");
    assert_eq!(items[1].text, "world");
    assert_eq!(items[0].metadata["_source_index"], json!(0));
    assert_eq!(items[0].metadata["_total_chunks"], json!(1));

    let stats = processor.stats();
    assert_eq!(stats.items_processed, 2);
    assert_eq!(stats.errors_encountered, 0);
    assert_eq!(stats.current_phase, ProcessingPhase::Completed);
    assert!(stats.bytes_processed > 0);
  }

  #[test]
  fn ndjson_bad_line_is_counted_and_skipped() {
    let file = write_temp("{\"c\":\"a\"}\n{bad\n{\"c\":\"b\"}\n");
    let mut processor = StreamingProcessor::open(file.path(), &schema("c"), "voyage-2").unwrap();
    let items = drain(&mut processor);

    assert_eq!(items.len(), 2);
    let stats = processor.stats();
    assert_eq!(stats.items_processed, 2);
    assert!(stats.errors_encountered >= 1);
  }

  #[test]
  fn empty_and_missing_content_skips_without_abort() {
    let file = write_temp(r#"[{"c":"ok"},{"c":""},{"c":"   "},{"other":1},{"c":42},{"c":"fine"}]"#);
    let mut processor = StreamingProcessor::open(file.path(), &schema("c"), "voyage-2").unwrap();
    let items = drain(&mut processor);

    let texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
    assert_eq!(texts, vec!["ok", "fine"]);
    assert_eq!(processor.stats().items_processed, 6);
  }

  #[test]
  fn metadata_paths_resolve_with_null_fallback() {
    let file = write_temp(r#"[{"c":"x","meta":{"lang":"en"}}]"#);
    let mut config = schema("c");
    config.mapping.metadata_paths.insert("lang".into(), "meta.lang".into());
    config.mapping.metadata_paths.insert("missing".into(), "meta.nope".into());

    let mut processor = StreamingProcessor::open(file.path(), &config, "voyage-2").unwrap();
    let items = drain(&mut processor);

    assert_eq!(items[0].metadata["lang"], json!("en"));
    assert_eq!(items[0].metadata["missing"], Value::Null);
  }

  #[test]
  fn chunking_injects_indices() {
    let file = write_temp(&format!(r#"[{{"c":"{}"}}]"#, "ab".repeat(30)));
    let mut config = schema("c");
    config.chunking = ChunkingConfig::Recursive {
      max_chars: 20,
      overlap: 5,
    };

    let mut processor = StreamingProcessor::open(file.path(), &config, "voyage-2").unwrap();
    let items = drain(&mut processor);

    assert!(items.len() > 1);
    let total = items.len() as u32;
    for (i, item) in items.iter().enumerate() {
      assert_eq!(item.chunk_index, i as u32);
      assert_eq!(item.total_chunks, total);
      assert_eq!(item.metadata["_chunk_index"], json!(i));
      assert_eq!(item.metadata["_total_chunks"], json!(total));
      assert_eq!(item.source_index, 0);
    }
  }

  #[test]
  fn schema_validation_fails_job() {
    let file = write_temp(r#"[{"c": 123}]"#);
    let mut config = schema("c");
    config.validation_schema = Some(json!({
      "type": "object",
      "properties": { "c": { "type": "string" } },
      "required": ["c"]
    }));

    let mut processor = StreamingProcessor::open(file.path(), &config, "voyage-2").unwrap();
    let err = processor.next_item().unwrap_err();
    match err {
      ParserError::SchemaValidation { errors } => {
        assert!(!errors.is_empty());
        assert!(errors.len() <= 20);
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[test]
  fn bad_content_path_syntax_fails_open() {
    let file = write_temp("[]");
    let mut config = schema("c");
    config.mapping.content_path = "items[x]".into();
    let err = StreamingProcessor::open(file.path(), &config, "voyage-2").unwrap_err();
    assert!(matches!(err, ParserError::PathSyntax(..)));
  }

  #[test]
  fn parse_twice_yields_identical_sequences() {
    let body: Vec<String> = (0..25).map(|i| format!(r#"{{"c":"document number {i} {}"}}"#, "pad ".repeat(i))).collect();
    let file = write_temp(&format!("[{}]", body.join(",")));
    let mut config = schema("c");
    config.chunking = ChunkingConfig::Recursive {
      max_chars: 30,
      overlap: 8,
    };

    let mut first = StreamingProcessor::open(file.path(), &config, "voyage-2").unwrap();
    let mut second = StreamingProcessor::open(file.path(), &config, "voyage-2").unwrap();
    let a = drain(&mut first);
    let b = drain(&mut second);

    assert_eq!(a.len(), b.len());
    let keys_a: Vec<(u64, u32)> = a.iter().map(|i| (i.source_index, i.chunk_index)).collect();
    let keys_b: Vec<(u64, u32)> = b.iter().map(|i| (i.source_index, i.chunk_index)).collect();
    assert_eq!(keys_a, keys_b);
  }

  #[test]
  fn skip_items_resumes_mid_stream() {
    let body: Vec<String> = (0..10).map(|i| format!(r#"{{"c":"doc {i}"}}"#)).collect();
    let file = write_temp(&format!("[{}]", body.join(",")));
    let config = schema("c");

    let mut full = StreamingProcessor::open(file.path(), &config, "voyage-2").unwrap();
    let all = drain(&mut full);

    let mut resumed = StreamingProcessor::open(file.path(), &config, "voyage-2").unwrap();
    resumed.skip_items(4);
    let tail = drain(&mut resumed);

    assert_eq!(tail.len(), 6);
    assert_eq!(tail, all[4..].to_vec());
  }

  #[test]
  fn file_stats_estimates() {
    let file = write_temp("{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n");
    let stats = file_stats(file.path()).unwrap();
    assert_eq!(stats.detected_format, SourceFormat::Ndjson);
    assert_eq!(stats.estimated_items, 3);
    assert!(stats.file_size_bytes > 0);
  }
}
