//! Greedy, limit-respecting batch packing over a stream of processed items.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use parser::ProcessedItem;
use silt_core::config::BatchLimits;
use tokens::{AdaptiveBatchSizer, TokenCounter};

use crate::IngestError;

/// One chunk inside a batch, with its token count counted exactly once.
#[derive(Debug, Clone)]
pub struct BatchItem {
  pub text: String,
  pub metadata: Map<String, Value>,
  pub source_index: u64,
  pub chunk_index: u32,
  pub total_chunks: u32,
  pub tokens: usize,
}

/// An ordered group of chunks jointly submitted for embedding.
#[derive(Debug, Clone)]
pub struct Batch {
  pub items: Vec<BatchItem>,
  pub total_tokens: usize,
  pub batch_id: String,
  pub created_at: DateTime<Utc>,
}

impl Batch {
  pub fn size(&self) -> usize {
    self.items.len()
  }

  pub fn texts(&self) -> Vec<&str> {
    self.items.iter().map(|i| i.text.as_str()).collect()
  }

  /// How many source items are fully contained once this batch is durable:
  /// the highest `source_index + 1` among items carrying their final chunk.
  ///
  /// Items are in production order, so everything before that index is
  /// already stored by this or an earlier batch.
  pub fn completed_source_items(&self) -> Option<u64> {
    self
      .items
      .iter()
      .rev()
      .find(|item| item.chunk_index + 1 == item.total_chunks)
      .map(|item| item.source_index + 1)
  }
}

/// Running totals for the status API's embedding stats.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
  pub batches_created: u64,
  pub total_items: u64,
  pub total_tokens: u64,
  pub rejected_empty: u64,
}

impl BatchStats {
  pub fn avg_batch_size(&self) -> f64 {
    if self.batches_created == 0 {
      0.0
    } else {
      self.total_items as f64 / self.batches_created as f64
    }
  }

  pub fn avg_tokens_per_batch(&self) -> f64 {
    if self.batches_created == 0 {
      0.0
    } else {
      self.total_tokens as f64 / self.batches_created as f64
    }
  }

  pub fn as_json(&self) -> std::collections::BTreeMap<String, Value> {
    let mut map = std::collections::BTreeMap::new();
    map.insert("batches_created".to_string(), Value::from(self.batches_created));
    map.insert("total_items".to_string(), Value::from(self.total_items));
    map.insert("total_tokens".to_string(), Value::from(self.total_tokens));
    map.insert("avg_batch_size".to_string(), Value::from(self.avg_batch_size()));
    map.insert("avg_tokens_per_batch".to_string(), Value::from(self.avg_tokens_per_batch()));
    map
  }
}

/// Packs items into batches under the configured safety margins and verifies
/// every emitted batch against the provider hard limits.
pub struct BatchManager {
  counter: Arc<TokenCounter>,
  sizer: AdaptiveBatchSizer,
  limits: BatchLimits,
  current: Vec<BatchItem>,
  current_tokens: usize,
  batch_seq: u64,
  stats: BatchStats,
}

impl BatchManager {
  pub fn new(model: &str, limits: BatchLimits) -> Self {
    debug!(
      model,
      chunk_limit = limits.chunk_limit,
      token_limit = limits.token_limit,
      "batch manager initialized"
    );
    Self {
      counter: Arc::new(TokenCounter::for_model(model)),
      sizer: AdaptiveBatchSizer::new(),
      limits,
      current: Vec::new(),
      current_tokens: 0,
      batch_seq: 0,
      stats: BatchStats::default(),
    }
  }

  pub fn counter(&self) -> &Arc<TokenCounter> {
    &self.counter
  }

  pub fn stats(&self) -> &BatchStats {
    &self.stats
  }

  /// Whether one more item of `tokens` fits the current batch.
  fn can_add(&self, tokens: usize) -> bool {
    self.current.len() + 1 <= self.limits.chunk_limit && self.current_tokens + tokens <= self.limits.token_limit
  }

  /// Offer an item. When it does not fit, the current contents are emitted
  /// as a finalized batch and the item starts the next one.
  ///
  /// Empty and whitespace-only texts are rejected (logged, counted). An item
  /// that alone exceeds the token limit is refused with a clear error: it can
  /// never be batched and must be pre-chunked by the schema.
  pub fn try_add(&mut self, item: ProcessedItem) -> Result<Option<Batch>, IngestError> {
    if item.text.trim().is_empty() {
      warn!(source_index = item.source_index, "rejecting empty chunk text");
      self.stats.rejected_empty += 1;
      return Ok(None);
    }

    let tokens = self.counter.count(&item.text);
    self.sizer.update(&item.text, tokens);

    if tokens > self.limits.token_limit {
      return Err(IngestError::Validation(format!(
        "chunk at source {} has {tokens} tokens, above the {}-token batch limit; configure chunking to split it",
        item.source_index, self.limits.token_limit
      )));
    }

    let batch_item = BatchItem {
      tokens,
      text: item.text,
      metadata: item.metadata,
      source_index: item.source_index,
      chunk_index: item.chunk_index,
      total_chunks: item.total_chunks,
    };

    let emitted = if self.can_add(tokens) {
      None
    } else {
      self.complete()?
    };

    self.current_tokens += batch_item.tokens;
    self.current.push(batch_item);
    self.stats.total_items += 1;

    Ok(emitted)
  }

  /// Emit whatever remains as a final batch.
  pub fn flush(&mut self) -> Result<Option<Batch>, IngestError> {
    self.complete()
  }

  /// Informational pre-estimate of how many of `remaining` fit the next
  /// batch. The admission rule in [`Self::try_add`] stays authoritative.
  pub fn estimate_capacity<S: AsRef<str>>(&self, remaining: &[S]) -> usize {
    self
      .sizer
      .estimate_capacity(remaining, self.limits.token_limit, self.limits.chunk_limit)
  }

  fn complete(&mut self) -> Result<Option<Batch>, IngestError> {
    if self.current.is_empty() {
      return Ok(None);
    }

    let items = std::mem::take(&mut self.current);
    self.current_tokens = 0;

    // Final verification: recount end to end and check the hard limits.
    // A failure here is a bug in the admission rule, never dispatched.
    let texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
    let total_tokens = self.counter.estimate_batch(&texts);
    if items.len() > BatchLimits::HARD_CHUNK_LIMIT || total_tokens > BatchLimits::HARD_TOKEN_LIMIT {
      error!(
        size = items.len(),
        total_tokens, "emitted batch exceeds provider hard limits, refusing to dispatch"
      );
      return Err(IngestError::BatchInvariant(format!(
        "batch of {} items / {total_tokens} tokens exceeds hard limits {}/{}",
        items.len(),
        BatchLimits::HARD_CHUNK_LIMIT,
        BatchLimits::HARD_TOKEN_LIMIT
      )));
    }

    let batch = Batch {
      total_tokens,
      batch_id: format!("batch_{:06}", self.batch_seq),
      created_at: Utc::now(),
      items,
    };

    self.batch_seq += 1;
    self.stats.batches_created += 1;
    self.stats.total_tokens += total_tokens as u64;

    debug!(
      batch_id = %batch.batch_id,
      size = batch.size(),
      total_tokens = batch.total_tokens,
      "completed batch"
    );

    Ok(Some(batch))
  }
}
