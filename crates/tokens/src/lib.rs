//! Token counting against the target embedding model.
//!
//! Provider batch limits are expressed in tokens, so the batch manager needs
//! counts that match what the provider will bill, not a character heuristic.
//! Counting is deterministic and side-effect free; the only state is the
//! process-wide cached BPE table.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tracing::warn;

/// Fallback estimate when no encoding is available: ~4 characters per token.
pub const FALLBACK_CHARS_PER_TOKEN: usize = 4;

/// Models with a known encoding. Everything else falls back to the general
/// BPE encoding (`cl100k_base`), which is what the hosted providers tokenize
/// with anyway.
const MODEL_ENCODINGS: &[(&str, &str)] = &[
  ("voyage-large-2", "cl100k_base"),
  ("voyage-code-2", "cl100k_base"),
  ("voyage-2", "cl100k_base"),
  ("voyage-lite-02-instruct", "cl100k_base"),
  ("text-embedding-3-small", "cl100k_base"),
  ("text-embedding-3-large", "cl100k_base"),
  ("text-embedding-ada-002", "cl100k_base"),
];

const DEFAULT_ENCODING: &str = "cl100k_base";

fn cl100k() -> Option<&'static CoreBPE> {
  static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
  BPE
    .get_or_init(|| match tiktoken_rs::cl100k_base() {
      Ok(bpe) => Some(bpe),
      Err(e) => {
        warn!(error = %e, "failed to load cl100k_base encoding, falling back to char estimate");
        None
      }
    })
    .as_ref()
}

/// Deterministic token counter for a specific embedding model.
#[derive(Debug, Clone)]
pub struct TokenCounter {
  model: String,
  encoding_name: &'static str,
}

impl TokenCounter {
  pub fn for_model(model: &str) -> Self {
    let encoding_name = MODEL_ENCODINGS
      .iter()
      .find(|(m, _)| *m == model)
      .map(|(_, e)| *e)
      .unwrap_or(DEFAULT_ENCODING);

    Self {
      model: model.to_string(),
      encoding_name,
    }
  }

  pub fn model(&self) -> &str {
    &self.model
  }

  pub fn encoding_name(&self) -> &str {
    self.encoding_name
  }

  /// Count tokens in a single text. Falls back to `len/4` when the encoding
  /// could not be loaded.
  pub fn count(&self, text: &str) -> usize {
    if text.is_empty() {
      return 0;
    }
    match cl100k() {
      Some(bpe) => bpe.encode_with_special_tokens(text).len(),
      None => text.len() / FALLBACK_CHARS_PER_TOKEN,
    }
  }

  /// Encode a text into token ids, when an encoding is available.
  ///
  /// Used by token-aware chunking; callers must degrade to character windows
  /// when this returns None.
  pub fn encode(&self, text: &str) -> Option<Vec<u32>> {
    cl100k().map(|bpe| bpe.encode_with_special_tokens(text))
  }

  /// Decode a token window back into text. Windows cut at arbitrary token
  /// boundaries can split a multi-byte sequence, in which case this fails.
  pub fn decode(&self, tokens: Vec<u32>) -> Option<String> {
    cl100k().and_then(|bpe| bpe.decode(tokens).ok())
  }

  /// Total tokens across a batch of texts.
  pub fn estimate_batch<S: AsRef<str>>(&self, texts: &[S]) -> usize {
    texts.iter().map(|t| self.count(t.as_ref())).sum()
  }

  /// Whether the batch fits under `token_limit`.
  pub fn can_fit<S: AsRef<str>>(&self, texts: &[S], token_limit: usize) -> bool {
    self.estimate_batch(texts) <= token_limit
  }

  /// Largest prefix of `texts` that fits under `token_limit`.
  ///
  /// Binary search over prefix lengths; always returns at least 1 for a
  /// nonempty slice so callers cannot loop forever on an oversized head item.
  pub fn max_fit<S: AsRef<str>>(&self, texts: &[S], token_limit: usize) -> usize {
    if texts.is_empty() {
      return 0;
    }

    let mut low = 1usize;
    let mut high = texts.len();
    let mut best = 0usize;

    while low <= high {
      let mid = (low + high) / 2;
      if self.can_fit(&texts[..mid], token_limit) {
        best = mid;
        low = mid + 1;
      } else {
        high = mid - 1;
      }
    }

    best.max(1)
  }
}

/// Exponentially-weighted tokens-per-char estimator.
///
/// Strictly informational: used for fast capacity pre-estimates, never for
/// the batch admission decision, which always uses real counts.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchSizer {
  avg_tokens_per_char: f64,
  sample_count: usize,
  max_samples: usize,
}

impl Default for AdaptiveBatchSizer {
  fn default() -> Self {
    Self {
      avg_tokens_per_char: 0.25,
      sample_count: 0,
      max_samples: 1000,
    }
  }
}

impl AdaptiveBatchSizer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Feed one real (text, count) observation into the moving average.
  pub fn update(&mut self, text: &str, actual_tokens: usize) {
    let chars = text.len();
    if chars == 0 {
      return;
    }
    let ratio = actual_tokens as f64 / chars as f64;
    if self.sample_count == 0 {
      self.avg_tokens_per_char = ratio;
    } else {
      let alpha = (1.0 / self.sample_count as f64).min(0.1);
      self.avg_tokens_per_char = alpha * ratio + (1.0 - alpha) * self.avg_tokens_per_char;
    }
    self.sample_count = (self.sample_count + 1).min(self.max_samples);
  }

  pub fn estimate_tokens_fast(&self, text: &str) -> usize {
    (text.len() as f64 * self.avg_tokens_per_char) as usize
  }

  /// Estimate how many of `remaining` texts fit in the next batch, applying a
  /// 10% safety factor on top of the learned ratio.
  pub fn estimate_capacity<S: AsRef<str>>(&self, remaining: &[S], token_limit: usize, chunk_limit: usize) -> usize {
    if remaining.is_empty() {
      return 0;
    }

    let sample_size = remaining.len().min(100);
    let estimated_tokens: usize = remaining[..sample_size]
      .iter()
      .map(|t| self.estimate_tokens_fast(t.as_ref()))
      .sum();

    if estimated_tokens <= token_limit {
      return remaining.len().min(chunk_limit);
    }

    let avg_per_text = estimated_tokens as f64 / sample_size as f64;
    let capacity = ((token_limit as f64 / avg_per_text) * 0.9) as usize;

    capacity.max(1).min(chunk_limit).min(remaining.len())
  }
}
