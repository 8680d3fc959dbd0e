//! Retry, timeout, and cancellation around a provider's batched call.
//!
//! The orchestrator dispatches every batch through here. Each attempt is
//! bounded by a request timeout, classified on failure, and backed off
//! exponentially; the job's cancellation token is observed before and during
//! every attempt and every backoff sleep.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use silt_core::config::BatchLimits;

use super::{EmbeddingError, EmbeddingMode, EmbeddingProvider, is_retryable_error, validate_embeddings};

#[derive(Debug, Clone)]
pub struct RetryConfig {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  /// Backoff before the second attempt.
  pub initial_backoff: Duration,
  /// Backoff ceiling.
  pub max_backoff: Duration,
  /// Full doubling between attempts.
  pub backoff_multiplier: f64,
  /// Bound on each provider call.
  pub request_timeout: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 4,
      initial_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(60),
      backoff_multiplier: 2.0,
      request_timeout: Duration::from_secs(60),
    }
  }
}

impl RetryConfig {
  /// Backoff before attempt `attempt` (1-based; attempt 1 has none).
  pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2) as i32;
    let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
    Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
  }
}

/// Validated embeddings for one batch.
#[derive(Debug, Clone)]
pub struct EmbeddingMatrix {
  pub vectors: Vec<Vec<f32>>,
  pub dim: usize,
}

/// Wraps a provider with the batch retry policy.
pub struct ResilientEmbedder {
  provider: Arc<dyn EmbeddingProvider>,
  config: RetryConfig,
}

impl ResilientEmbedder {
  pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
    Self {
      provider,
      config: RetryConfig::default(),
    }
  }

  pub fn with_config(provider: Arc<dyn EmbeddingProvider>, config: RetryConfig) -> Self {
    Self { provider, config }
  }

  pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
    &self.provider
  }

  /// Embed one batch with retries.
  ///
  /// `total_tokens` is the batch manager's verified count, re-checked here
  /// against the provider hard limits before anything is dispatched. On
  /// success the result satisfies `vectors.len() == texts.len()` with one
  /// consistent dimension.
  pub async fn embed_batch_with_retry(
    &self,
    texts: &[&str],
    total_tokens: usize,
    cancel: &CancellationToken,
  ) -> Result<EmbeddingMatrix, EmbeddingError> {
    if texts.len() > BatchLimits::HARD_CHUNK_LIMIT {
      return Err(EmbeddingError::Invariant(format!(
        "batch size {} exceeds hard limit {}",
        texts.len(),
        BatchLimits::HARD_CHUNK_LIMIT
      )));
    }
    if total_tokens > BatchLimits::HARD_TOKEN_LIMIT {
      return Err(EmbeddingError::Invariant(format!(
        "batch tokens {} exceed hard limit {}",
        total_tokens,
        BatchLimits::HARD_TOKEN_LIMIT
      )));
    }
    if texts.is_empty() {
      return Ok(EmbeddingMatrix {
        vectors: Vec::new(),
        dim: 0,
      });
    }

    let max_attempts = self.config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
      if attempt > 1 {
        let backoff = self.config.backoff_for_attempt(attempt);
        debug!(
          attempt,
          max_attempts,
          backoff_ms = backoff.as_millis(),
          batch_size = texts.len(),
          "retrying batch embed after backoff"
        );
        tokio::select! {
          _ = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
          _ = sleep(backoff) => {}
        }
      }

      if cancel.is_cancelled() {
        return Err(EmbeddingError::Cancelled);
      }

      let outcome = tokio::select! {
        _ = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
        outcome = timeout(self.config.request_timeout, self.provider.embed_batch(texts, EmbeddingMode::Document)) => outcome,
      };

      match outcome {
        Ok(Ok(vectors)) => {
          if attempt > 1 {
            info!(attempt, batch_size = texts.len(), "batch embed succeeded after retry");
          }
          let dim = validate_embeddings(texts.len(), &vectors)?;
          trace!(batch_size = texts.len(), dim, "batch embed complete");
          return Ok(EmbeddingMatrix { vectors, dim });
        }
        Ok(Err(e)) => {
          if is_retryable_error(&e) && attempt < max_attempts {
            warn!(attempt, max_attempts, err = %e, "retryable embedding error, will retry");
            last_error = Some(e);
            continue;
          }
          return Err(e);
        }
        Err(_) => {
          warn!(
            attempt,
            max_attempts,
            timeout_ms = self.config.request_timeout.as_millis(),
            "embedding request timed out"
          );
          if attempt < max_attempts {
            last_error = Some(EmbeddingError::Timeout);
            continue;
          }
          return Err(EmbeddingError::Timeout);
        }
      }
    }

    Err(last_error.unwrap_or_else(|| EmbeddingError::ProviderError("max retries exceeded".to_string())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn fast_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
      max_attempts,
      initial_backoff: Duration::from_millis(1),
      max_backoff: Duration::from_millis(10),
      backoff_multiplier: 2.0,
      request_timeout: Duration::from_secs(5),
    }
  }

  #[test]
  fn backoff_doubles_up_to_cap() {
    let config = RetryConfig::default();
    assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(1));
    assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(2));
    assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(4));

    let config = RetryConfig {
      initial_backoff: Duration::from_secs(30),
      ..Default::default()
    };
    assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(60));
  }

  struct FlakyProvider {
    calls: AtomicUsize,
    fail_first: usize,
    retryable: bool,
  }

  impl FlakyProvider {
    fn new(fail_first: usize, retryable: bool) -> Self {
      Self {
        calls: AtomicUsize::new(0),
        fail_first,
        retryable,
      }
    }
  }

  #[async_trait]
  impl EmbeddingProvider for FlakyProvider {
    fn name(&self) -> &str {
      "flaky"
    }
    fn model_id(&self) -> &str {
      "flaky-model"
    }

    async fn embed_batch(&self, texts: &[&str], _mode: EmbeddingMode) -> Result<Vec<Vec<f32>>, EmbeddingError> {
      let call = self.calls.fetch_add(1, Ordering::SeqCst);
      if call < self.fail_first {
        if self.retryable {
          return Err(EmbeddingError::Provider {
            status: 503,
            message: "service unavailable".into(),
          });
        }
        return Err(EmbeddingError::Provider {
          status: 401,
          message: "unauthorized".into(),
        });
      }
      Ok(texts.iter().map(|_| vec![0.5; 8]).collect())
    }
  }

  #[tokio::test]
  async fn succeeds_after_transient_failures() {
    let provider = Arc::new(FlakyProvider::new(2, true));
    let embedder = ResilientEmbedder::with_config(provider.clone(), fast_config(4));
    let cancel = CancellationToken::new();

    let result = embedder.embed_batch_with_retry(&["a", "b"], 4, &cancel).await.unwrap();
    assert_eq!(result.vectors.len(), 2);
    assert_eq!(result.dim, 8);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn gives_up_after_max_attempts() {
    let provider = Arc::new(FlakyProvider::new(100, true));
    let embedder = ResilientEmbedder::with_config(provider.clone(), fast_config(4));
    let cancel = CancellationToken::new();

    let err = embedder.embed_batch_with_retry(&["a"], 2, &cancel).await.unwrap_err();
    assert!(is_retryable_error(&err));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
  }

  #[tokio::test]
  async fn fatal_errors_do_not_retry() {
    let provider = Arc::new(FlakyProvider::new(100, false));
    let embedder = ResilientEmbedder::with_config(provider.clone(), fast_config(4));
    let cancel = CancellationToken::new();

    let err = embedder.embed_batch_with_retry(&["a"], 2, &cancel).await.unwrap_err();
    assert!(!is_retryable_error(&err));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn cancellation_preempts_attempts() {
    let provider = Arc::new(FlakyProvider::new(0, true));
    let embedder = ResilientEmbedder::with_config(provider.clone(), fast_config(4));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = embedder.embed_batch_with_retry(&["a"], 2, &cancel).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::Cancelled));
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn oversized_batches_are_refused_before_dispatch() {
    let provider = Arc::new(FlakyProvider::new(0, true));
    let embedder = ResilientEmbedder::with_config(provider.clone(), fast_config(4));
    let cancel = CancellationToken::new();

    let texts: Vec<String> = (0..1001).map(|i| format!("t{i}")).collect();
    let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
    let err = embedder.embed_batch_with_retry(&refs, 1001, &cancel).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::Invariant(_)));

    let err = embedder.embed_batch_with_retry(&["a"], 10_001, &cancel).await.unwrap_err();
    assert!(matches!(err, EmbeddingError::Invariant(_)));

    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn empty_batch_short_circuits() {
    let provider = Arc::new(FlakyProvider::new(0, true));
    let embedder = ResilientEmbedder::new(provider.clone());
    let cancel = CancellationToken::new();

    let result = embedder.embed_batch_with_retry(&[], 0, &cancel).await.unwrap();
    assert!(result.vectors.is_empty());
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
  }
}
