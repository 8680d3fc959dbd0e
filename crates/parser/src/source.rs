//! File opening with transparent gzip handling and byte accounting.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::MultiGzDecoder;
use tracing::debug;

use silt_core::SourceFormat;

use crate::ParserError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Buffer size for line-oriented reads.
pub(crate) const READ_BUF_SIZE: usize = 8 * 1024;

/// Counts raw bytes consumed from the underlying file, before decompression.
/// Shared with the processor so checkpoints can record how far into the file
/// the stream has read.
pub(crate) struct CountingReader<R> {
  inner: R,
  bytes: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
  fn new(inner: R, bytes: Arc<AtomicU64>) -> Self {
    Self { inner, bytes }
  }
}

impl<R: Read> Read for CountingReader<R> {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    let n = self.inner.read(buf)?;
    self.bytes.fetch_add(n as u64, Ordering::Relaxed);
    Ok(n)
  }
}

/// A readable source with its raw-byte counter.
pub struct Source {
  pub(crate) reader: Box<dyn BufRead + Send + Sync>,
  pub(crate) bytes_read: Arc<AtomicU64>,
  pub(crate) gzipped: bool,
}

impl Source {
  pub fn bytes_read(&self) -> u64 {
    self.bytes_read.load(Ordering::Relaxed)
  }

  pub fn is_gzipped(&self) -> bool {
    self.gzipped
  }
}

fn is_gzipped(path: &Path) -> Result<bool, ParserError> {
  if path.extension().is_some_and(|ext| ext == "gz") {
    return Ok(true);
  }

  let mut file = File::open(path).map_err(|e| ParserError::Open {
    path: path.display().to_string(),
    source: e,
  })?;
  let mut magic = [0u8; 2];
  match file.read(&mut magic) {
    Ok(2) => Ok(magic == GZIP_MAGIC),
    Ok(_) => Ok(false),
    Err(e) => Err(ParserError::Io(e)),
  }
}

/// Open a corpus file, transparently decompressing gzip detected by `.gz`
/// suffix or the `1F 8B` magic bytes.
pub fn open_source(path: &Path) -> Result<Source, ParserError> {
  let gzipped = is_gzipped(path)?;
  let file = File::open(path).map_err(|e| ParserError::Open {
    path: path.display().to_string(),
    source: e,
  })?;

  let bytes_read = Arc::new(AtomicU64::new(0));
  let counting = CountingReader::new(file, bytes_read.clone());

  let reader: Box<dyn BufRead + Send + Sync> = if gzipped {
    Box::new(BufReader::with_capacity(READ_BUF_SIZE, MultiGzDecoder::new(counting)))
  } else {
    Box::new(BufReader::with_capacity(READ_BUF_SIZE, counting))
  };

  debug!(path = %path.display(), gzipped, "opened source file");
  Ok(Source {
    reader,
    bytes_read,
    gzipped,
  })
}

/// Peek at a file and decide whether it is a JSON array or NDJSON.
///
/// A `[` as the first non-blank character means json_array. Otherwise up to
/// five lines are sampled and the input is treated as NDJSON if any of them
/// parses as a JSON object. Defaults to json_array.
pub fn detect_format(path: &Path) -> Result<SourceFormat, ParserError> {
  let source = open_source(path)?;
  let mut reader = source.reader;

  let mut sample = Vec::with_capacity(5);
  let mut line = String::new();
  for _ in 0..5 {
    line.clear();
    match reader.read_line(&mut line) {
      Ok(0) => break,
      Ok(_) => {}
      Err(e) => {
        // undecodable sample, fall back to the default format
        debug!(path = %path.display(), error = %e, "format detection sample unreadable");
        return Ok(SourceFormat::JsonArray);
      }
    }
    let trimmed = line.trim();
    if !trimmed.is_empty() {
      sample.push(trimmed.to_string());
    }
  }

  if let Some(first) = sample.first()
    && first.starts_with('[')
  {
    return Ok(SourceFormat::JsonArray);
  }

  let object_lines = sample
    .iter()
    .filter(|l| serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(l).is_ok())
    .count();

  if object_lines >= 1 {
    debug!(path = %path.display(), object_lines, "detected ndjson input");
    Ok(SourceFormat::Ndjson)
  } else {
    Ok(SourceFormat::JsonArray)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tempfile::NamedTempFile;

  fn write_temp(content: &[u8], suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content).unwrap();
    file.flush().unwrap();
    file
  }

  fn gzip_bytes(content: &[u8]) -> Vec<u8> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
  }

  #[test]
  fn opens_plain_file_and_counts_bytes() {
    let file = write_temp(b"hello world", ".json");
    let mut source = open_source(file.path()).unwrap();
    let mut content = String::new();
    source.reader.read_to_string(&mut content).unwrap();
    assert_eq!(content, "hello world");
    assert_eq!(source.bytes_read.load(Ordering::Relaxed), 11);
  }

  #[test]
  fn detects_gzip_by_suffix() {
    let compressed = gzip_bytes(b"{\"a\":1}");
    let file = write_temp(&compressed, ".json.gz");
    let mut source = open_source(file.path()).unwrap();
    assert!(source.is_gzipped());
    let mut content = String::new();
    source.reader.read_to_string(&mut content).unwrap();
    assert_eq!(content, "{\"a\":1}");
  }

  #[test]
  fn detects_gzip_by_magic_without_suffix() {
    let compressed = gzip_bytes(b"[1,2,3]");
    let file = write_temp(&compressed, ".json");
    let mut source = open_source(file.path()).unwrap();
    assert!(source.is_gzipped());
    let mut content = String::new();
    source.reader.read_to_string(&mut content).unwrap();
    assert_eq!(content, "[1,2,3]");
  }

  #[test]
  fn detect_format_json_array() {
    let file = write_temp(b"\n  [{\"a\": 1}]", ".json");
    assert_eq!(detect_format(file.path()).unwrap(), SourceFormat::JsonArray);
  }

  #[test]
  fn detect_format_ndjson() {
    let file = write_temp(b"{\"a\": 1}\n{\"a\": 2}\n", ".jsonl");
    assert_eq!(detect_format(file.path()).unwrap(), SourceFormat::Ndjson);
  }

  #[test]
  fn detect_format_defaults_to_json_array() {
    let file = write_temp(b"not json at all\nstill not\n", ".txt");
    assert_eq!(detect_format(file.path()).unwrap(), SourceFormat::JsonArray);
  }
}
