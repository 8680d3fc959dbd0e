//! Content chunking: none, greedy character windows, or token windows.

use silt_core::ChunkingConfig;
use tokens::{FALLBACK_CHARS_PER_TOKEN, TokenCounter};
use tracing::warn;

/// Splits one document's content into bounded chunks.
#[derive(Debug, Clone)]
pub enum Chunker {
  /// One chunk equal to the content.
  None,
  /// Greedy char windows of `max_chars` with `overlap` backoff.
  Recursive { max_chars: usize, overlap: usize },
  /// Same window shape over tokens, counted against the target model.
  TokenAware {
    max_tokens: usize,
    overlap_tokens: usize,
    counter: TokenCounter,
  },
}

impl Chunker {
  /// Build a chunker from the schema's chunking section.
  ///
  /// Token-aware chunking needs a token counter for the target model; when
  /// the encoding is unavailable it degrades to character windows at
  /// `max_tokens * 4` / `overlap_tokens * 4`.
  pub fn from_config(config: &ChunkingConfig, fallback_model: &str) -> Self {
    match config {
      ChunkingConfig::None => Chunker::None,
      ChunkingConfig::Recursive { max_chars, overlap } => Chunker::Recursive {
        max_chars: *max_chars,
        overlap: *overlap,
      },
      ChunkingConfig::TokenAware {
        max_tokens,
        overlap_tokens,
        model_name,
      } => {
        let model = model_name.as_deref().unwrap_or(fallback_model);
        let counter = TokenCounter::for_model(model);
        if counter.encode("probe").is_none() {
          warn!(model, "token encoding unavailable, degrading token_aware chunking to char windows");
          return Chunker::Recursive {
            max_chars: max_tokens * FALLBACK_CHARS_PER_TOKEN,
            overlap: overlap_tokens * FALLBACK_CHARS_PER_TOKEN,
          };
        }
        Chunker::TokenAware {
          max_tokens: *max_tokens,
          overlap_tokens: *overlap_tokens,
          counter,
        }
      }
    }
  }

  pub fn chunk(&self, text: &str) -> Vec<String> {
    if text.is_empty() {
      return Vec::new();
    }

    match self {
      Chunker::None => vec![text.to_string()],
      Chunker::Recursive { max_chars, overlap } => chunk_chars(text, *max_chars, *overlap),
      Chunker::TokenAware {
        max_tokens,
        overlap_tokens,
        counter,
      } => chunk_tokens(text, *max_tokens, *overlap_tokens, counter),
    }
  }
}

/// Greedy char windows. `start` advances by at least one char per window so
/// pathological overlap settings cannot loop.
fn chunk_chars(text: &str, max_chars: usize, overlap: usize) -> Vec<String> {
  let offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
  let total = offsets.len();

  if total <= max_chars {
    return vec![text.to_string()];
  }

  let byte_at = |char_pos: usize| -> usize {
    if char_pos >= total { text.len() } else { offsets[char_pos] }
  };

  let mut chunks = Vec::new();
  let mut start = 0usize;

  while start < total {
    let end = (start + max_chars).min(total);
    chunks.push(text[byte_at(start)..byte_at(end)].to_string());
    if end == total {
      break;
    }
    start = (start + 1).max(end.saturating_sub(overlap));
  }

  chunks
}

/// Token windows with the same advance rule as the char variant. Windows that
/// split a multi-byte sequence at a boundary are widened by a token until
/// they decode; undecodable text degrades to char windows.
fn chunk_tokens(text: &str, max_tokens: usize, overlap_tokens: usize, counter: &TokenCounter) -> Vec<String> {
  let Some(token_ids) = counter.encode(text) else {
    return chunk_chars(
      text,
      max_tokens * FALLBACK_CHARS_PER_TOKEN,
      overlap_tokens * FALLBACK_CHARS_PER_TOKEN,
    );
  };

  let total = token_ids.len();
  if total <= max_tokens {
    return vec![text.to_string()];
  }

  let mut chunks = Vec::new();
  let mut start = 0usize;

  while start < total {
    let mut end = (start + max_tokens).min(total);
    let decoded = loop {
      match counter.decode(token_ids[start..end].to_vec()) {
        Some(text) => break Some(text),
        None if end < total => end += 1,
        None => break None,
      }
    };

    match decoded {
      Some(chunk) => chunks.push(chunk),
      None => {
        warn!("token window failed to decode, degrading to char windows");
        return chunk_chars(
          text,
          max_tokens * FALLBACK_CHARS_PER_TOKEN,
          overlap_tokens * FALLBACK_CHARS_PER_TOKEN,
        );
      }
    }

    if end == total {
      break;
    }
    start = (start + 1).max(end.saturating_sub(overlap_tokens));
  }

  chunks
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn none_returns_single_chunk() {
    let chunker = Chunker::from_config(&ChunkingConfig::None, "voyage-2");
    assert_eq!(chunker.chunk("hello"), vec!["hello".to_string()]);
    assert!(chunker.chunk("").is_empty());
  }

  #[test]
  fn short_text_is_one_chunk() {
    let chunker = Chunker::Recursive {
      max_chars: 100,
      overlap: 10,
    };
    assert_eq!(chunker.chunk("short"), vec!["short".to_string()]);
  }

  #[test]
  fn char_windows_cover_text_with_overlap() {
    let chunker = Chunker::Recursive {
      max_chars: 10,
      overlap: 3,
    };
    let text = "abcdefghijklmnopqrstuvwxyz";
    let chunks = chunker.chunk(text);

    assert_eq!(chunks[0], "abcdefghij");
    // next window starts at 10 - 3 = 7
    assert_eq!(chunks[1], "hijklmnopq");
    // terminal chunk ends exactly at the end of the text
    assert!(text.ends_with(chunks.last().unwrap().as_str()));
    for chunk in &chunks {
      assert!(chunk.chars().count() <= 10);
    }
  }

  #[test]
  fn char_windows_respect_utf8_boundaries() {
    let chunker = Chunker::Recursive {
      max_chars: 4,
      overlap: 1,
    };
    let text = "héllо wörld ünïcode";
    let chunks = chunker.chunk(text);
    for chunk in &chunks {
      assert!(chunk.chars().count() <= 4);
    }
    // no panics means boundaries were respected; last chunk is a suffix
    assert!(text.ends_with(chunks.last().unwrap().as_str()));
  }

  #[test]
  fn token_windows_match_expected_count() {
    // A document of exactly 5000 tokens with max=1000/overlap=100 must yield
    // 6 windows: starts at 0, 900, 1800, 2700, 3600, 4500.
    let counter = TokenCounter::for_model("voyage-large-2");
    let word = " alpha";
    let per_word = counter.count(word);
    assert!(per_word > 0);
    let words_needed = 5000 / per_word;
    let text: String = word.repeat(words_needed);
    let total = counter.count(&text);

    let chunker = Chunker::TokenAware {
      max_tokens: 1000,
      overlap_tokens: 100,
      counter: counter.clone(),
    };
    let chunks = chunker.chunk(&text);

    // stride is max - overlap = 900; windows = ceil((total - 1000) / 900) + 1
    let expected = if total <= 1000 {
      1
    } else {
      (total - 1000).div_ceil(900) + 1
    };
    assert_eq!(chunks.len(), expected);

    // first chunk is the decode of the first 1000 tokens, so a text prefix
    assert!(text.starts_with(chunks[0].as_str()));
    assert!(counter.count(&chunks[0]) <= 1000);
    // last chunk is a suffix of at most 1000 tokens
    let last = chunks.last().unwrap();
    assert!(counter.count(last) <= 1000);
    assert!(text.ends_with(last.as_str()));
  }

  #[test]
  fn token_exact_5000_gives_six_chunks() {
    let counter = TokenCounter::for_model("voyage-large-2");
    let word = " alpha";
    let per_word = counter.count(word);
    if 5000 % per_word != 0 {
      // counting granularity prevents an exact 5000-token document with this
      // vocabulary; covered by the general case above
      return;
    }
    let text = word.repeat(5000 / per_word);
    if counter.count(&text) != 5000 {
      // merges across repetitions broke the exact count; the general case
      // above still covers the window arithmetic
      return;
    }

    let chunker = Chunker::TokenAware {
      max_tokens: 1000,
      overlap_tokens: 100,
      counter,
    };
    assert_eq!(chunker.chunk(&text).len(), 6);
  }

  #[test]
  fn degraded_token_config_uses_char_windows() {
    // Directly exercise the degraded shape the config fallback produces.
    let chunker = Chunker::Recursive {
      max_chars: 1000 * FALLBACK_CHARS_PER_TOKEN,
      overlap: 100 * FALLBACK_CHARS_PER_TOKEN,
    };
    let text = "x".repeat(10_000);
    let chunks = chunker.chunk(&text);
    assert!(chunks.len() > 1);
    for chunk in &chunks {
      assert!(chunk.len() <= 4000);
    }
  }
}
