//! Incremental readers that yield one top-level JSON value at a time.
//!
//! The array scanner buffers exactly one element: bytes are accumulated until
//! the element's closing token, parsed, and the buffer released. This is what
//! keeps memory proportional to the largest single object rather than the
//! file.

use std::io::BufRead;

use serde_json::Value;
use tracing::warn;

use crate::ParserError;

/// What the feed produced on one pull.
pub(crate) enum Feed {
  /// A parsed top-level value with its source index.
  Item(u64, Value),
  /// A line that failed to parse (NDJSON only); counted and skipped.
  Skipped,
  Eof,
}

/// Unified pull interface over both source formats.
pub(crate) enum ItemFeed {
  Array(JsonArrayItems),
  Lines(NdjsonItems),
}

impl ItemFeed {
  pub(crate) fn next_raw(&mut self) -> Result<Feed, ParserError> {
    match self {
      ItemFeed::Array(items) => match items.next_element()? {
        Some(value) => {
          let index = items.yielded - 1;
          Ok(Feed::Item(index, value))
        }
        None => Ok(Feed::Eof),
      },
      ItemFeed::Lines(items) => items.next_line(),
    }
  }
}

/// Streaming scanner over a top-level JSON array.
pub(crate) struct JsonArrayItems {
  reader: Box<dyn BufRead + Send + Sync>,
  peeked: Option<u8>,
  started: bool,
  done: bool,
  /// Elements yielded so far; the current element's index is `yielded - 1`.
  yielded: u64,
  /// Reused element buffer, cleared after every parse.
  buf: Vec<u8>,
}

impl JsonArrayItems {
  pub(crate) fn new(reader: Box<dyn BufRead + Send + Sync>) -> Self {
    Self {
      reader,
      peeked: None,
      started: false,
      done: false,
      yielded: 0,
      buf: Vec::with_capacity(4096),
    }
  }

  fn next_byte(&mut self) -> Result<Option<u8>, ParserError> {
    if let Some(b) = self.peeked.take() {
      return Ok(Some(b));
    }
    let mut one = [0u8; 1];
    loop {
      return match self.reader.read(&mut one) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(one[0])),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
        Err(e) => Err(ParserError::Io(e)),
      };
    }
  }

  fn peek_byte(&mut self) -> Result<Option<u8>, ParserError> {
    if self.peeked.is_none() {
      self.peeked = self.next_byte()?;
    }
    Ok(self.peeked)
  }

  fn skip_whitespace(&mut self) -> Result<(), ParserError> {
    while let Some(b) = self.peek_byte()? {
      if b.is_ascii_whitespace() {
        self.peeked = None;
      } else {
        break;
      }
    }
    Ok(())
  }

  fn framing(message: impl Into<String>) -> ParserError {
    ParserError::Framing {
      format: "json_array",
      message: message.into(),
    }
  }

  /// Read one complete string literal into `self.buf` (opening quote already
  /// consumed and pushed).
  fn read_string_tail(&mut self) -> Result<(), ParserError> {
    let mut escaped = false;
    loop {
      let Some(b) = self.next_byte()? else {
        return Err(Self::framing("unterminated string"));
      };
      self.buf.push(b);
      if escaped {
        escaped = false;
      } else if b == b'\\' {
        escaped = true;
      } else if b == b'"' {
        return Ok(());
      }
    }
  }

  /// Accumulate one balanced composite value (object or array) into the
  /// buffer. The opening byte has already been consumed and pushed.
  fn read_composite_tail(&mut self, open: u8) -> Result<(), ParserError> {
    let mut depth = 1usize;
    loop {
      let Some(b) = self.next_byte()? else {
        return Err(Self::framing(format!("unterminated {}", open as char)));
      };
      self.buf.push(b);
      match b {
        b'"' => self.read_string_tail()?,
        b'{' | b'[' => depth += 1,
        b'}' | b']' => {
          depth -= 1;
          if depth == 0 {
            return Ok(());
          }
        }
        _ => {}
      }
    }
  }

  /// Accumulate a scalar (number, true/false/null) until a delimiter.
  fn read_scalar_tail(&mut self) -> Result<(), ParserError> {
    while let Some(b) = self.peek_byte()? {
      if b == b',' || b == b']' || b.is_ascii_whitespace() {
        break;
      }
      self.peeked = None;
      self.buf.push(b);
    }
    Ok(())
  }

  /// Produce the next top-level element, or None at the closing `]`.
  pub(crate) fn next_element(&mut self) -> Result<Option<Value>, ParserError> {
    if self.done {
      return Ok(None);
    }

    if !self.started {
      self.skip_whitespace()?;
      match self.next_byte()? {
        Some(b'[') => self.started = true,
        Some(other) => {
          return Err(Self::framing(format!("expected '[', found {:?}", other as char)));
        }
        None => return Err(Self::framing("empty input")),
      }
    }

    self.skip_whitespace()?;
    match self.peek_byte()? {
      Some(b']') => {
        self.peeked = None;
        self.done = true;
        return Ok(None);
      }
      Some(_) => {}
      None => return Err(Self::framing("truncated array")),
    }

    self.buf.clear();
    let Some(first) = self.next_byte()? else {
      return Err(Self::framing("truncated array"));
    };
    self.buf.push(first);
    match first {
      b'{' | b'[' => self.read_composite_tail(first)?,
      b'"' => self.read_string_tail()?,
      _ => self.read_scalar_tail()?,
    }

    let value: Value = serde_json::from_slice(&self.buf)
      .map_err(|e| Self::framing(format!("invalid element at index {}: {e}", self.yielded)))?;
    self.buf.clear();

    // Element separator or end of array.
    self.skip_whitespace()?;
    match self.next_byte()? {
      Some(b',') => {}
      Some(b']') => self.done = true,
      Some(other) => {
        return Err(Self::framing(format!(
          "expected ',' or ']' after element, found {:?}",
          other as char
        )));
      }
      None => return Err(Self::framing("truncated array")),
    }

    self.yielded += 1;
    Ok(Some(value))
  }
}

/// Line reader for NDJSON. Lines that fail to decode or parse are reported
/// as `Feed::Skipped`; the stream continues.
pub(crate) struct NdjsonItems {
  reader: Box<dyn BufRead + Send + Sync>,
  line_no: u64,
  parsed: u64,
  line: Vec<u8>,
}

impl NdjsonItems {
  pub(crate) fn new(reader: Box<dyn BufRead + Send + Sync>) -> Self {
    Self {
      reader,
      line_no: 0,
      parsed: 0,
      line: Vec::new(),
    }
  }

  fn next_line(&mut self) -> Result<Feed, ParserError> {
    loop {
      self.line.clear();
      let n = self.reader.read_until(b'\n', &mut self.line)?;
      if n == 0 {
        return Ok(Feed::Eof);
      }
      self.line_no += 1;

      let text = match std::str::from_utf8(&self.line) {
        Ok(text) => text,
        Err(e) => {
          warn!(line = self.line_no, error = %e, "skipping undecodable ndjson line");
          return Ok(Feed::Skipped);
        }
      };

      let trimmed = text.trim();
      if trimmed.is_empty() {
        continue;
      }

      match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => {
          let index = self.parsed;
          self.parsed += 1;
          return Ok(Feed::Item(index, value));
        }
        Err(e) => {
          warn!(line = self.line_no, error = %e, "skipping invalid ndjson line");
          return Ok(Feed::Skipped);
        }
      }
    }
  }
}
