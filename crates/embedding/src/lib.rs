//! Embedding providers and the resilience layers around them.
//!
//! Three provider variants sit behind one trait: a local Ollama-compatible
//! model, Voyage, and OpenAI. The orchestrator never talks to a provider
//! directly; it goes through [`ResilientEmbedder`], which adds hard-limit
//! validation, retry with exponential backoff, per-attempt timeouts, and
//! cancellation. Hosted providers can additionally be wrapped with
//! [`RateLimitedProvider`] to bound calls per minute.

mod ollama;
mod openai;
mod rate_limit;
mod resilient;
mod voyage;

use std::sync::Arc;

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use rate_limit::{RateLimitConfig, RateLimitedProvider, SlidingWindowLimiter};
pub use resilient::{EmbeddingMatrix, ResilientEmbedder, RetryConfig};
pub use voyage::VoyageProvider;

use silt_core::config::{EmbeddingConfig, EmbeddingProviderKind};

/// How text is framed before embedding. Retrieval-tuned models distinguish
/// indexed documents from search queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingMode {
  #[default]
  Document,
  Query,
}

impl EmbeddingMode {
  /// Wire name used by providers that take an input type.
  pub fn as_input_type(&self) -> &'static str {
    match self {
      EmbeddingMode::Document => "document",
      EmbeddingMode::Query => "query",
    }
  }
}

#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
  fn name(&self) -> &str;
  fn model_id(&self) -> &str;

  async fn embed_batch(&self, texts: &[&str], mode: EmbeddingMode) -> Result<Vec<Vec<f32>>, EmbeddingError>;

  /// Single-text convenience used by the chat-time collaborator.
  async fn embed(&self, text: &str, mode: EmbeddingMode) -> Result<Vec<f32>, EmbeddingError> {
    let mut vectors = self.embed_batch(&[text], mode).await?;
    vectors
      .pop()
      .ok_or_else(|| EmbeddingError::Invariant("provider returned no embedding for single text".to_string()))
  }
}

/// Build the configured provider, wrapping hosted variants with a
/// calls-per-minute limiter when one is configured.
pub fn provider_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
  match config.provider {
    EmbeddingProviderKind::Ollama => Ok(Arc::new(OllamaProvider::new(config))),
    EmbeddingProviderKind::Voyage => {
      let provider = VoyageProvider::new(config)?;
      Ok(wrap_hosted(provider, config))
    }
    EmbeddingProviderKind::OpenAi => {
      let provider = OpenAiProvider::new(config)?;
      Ok(wrap_hosted(provider, config))
    }
  }
}

fn wrap_hosted<P: EmbeddingProvider + 'static>(provider: P, config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
  match config.requests_per_minute {
    Some(limit) => Arc::new(RateLimitedProvider::with_config(
      provider,
      RateLimitConfig::per_minute(limit),
    )),
    None => Arc::new(provider),
  }
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
  #[error("no api key configured for provider")]
  NoApiKey,
  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),
  #[error("provider returned {status}: {message}")]
  Provider { status: u16, message: String },
  #[error("provider error: {0}")]
  ProviderError(String),
  #[error("network error: {0}")]
  Network(String),
  #[error("request timed out")]
  Timeout,
  #[error("embedding cancelled")]
  Cancelled,
  #[error("embedding invariant violated: {0}")]
  Invariant(String),
}

/// Message fragments that mark an error as permanently failed regardless of
/// anything else it says.
const NO_RETRY_INDICATORS: &[&str] = &[
  "unauthorized",
  "forbidden",
  "invalid key",
  "api key",
  "permission denied",
  "malformed",
];

/// Message fragments that mark an error as transient.
const RETRY_INDICATORS: &[&str] = &[
  "rate limit",
  "timeout",
  "connection",
  "network",
  "temporary",
  "service unavailable",
  "too many requests",
  "throttled",
  "quota",
];

fn message_is_retryable(message: &str) -> bool {
  let lowered = message.to_lowercase();
  if NO_RETRY_INDICATORS.iter().any(|m| lowered.contains(m)) {
    return false;
  }
  RETRY_INDICATORS.iter().any(|m| lowered.contains(m))
}

/// Classify an error per the retry policy: rate limits, timeouts, connection
/// resets, and 5xx responses are retryable; authentication, permission, and
/// malformed-request failures are not.
pub fn is_retryable_error(error: &EmbeddingError) -> bool {
  match error {
    EmbeddingError::Timeout | EmbeddingError::Network(_) => true,
    EmbeddingError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
    EmbeddingError::Provider { status, message } => match status {
      429 => true,
      s if *s >= 500 => true,
      401 | 403 => false,
      _ => message_is_retryable(message),
    },
    EmbeddingError::ProviderError(message) => message_is_retryable(message),
    EmbeddingError::NoApiKey | EmbeddingError::Cancelled | EmbeddingError::Invariant(_) => false,
  }
}

/// Check the provider result invariant: one vector per input, all the same
/// nonzero dimension. Returns that dimension.
pub fn validate_embeddings(expected: usize, vectors: &[Vec<f32>]) -> Result<usize, EmbeddingError> {
  if vectors.len() != expected {
    return Err(EmbeddingError::Invariant(format!(
      "got {} embeddings for {} inputs",
      vectors.len(),
      expected
    )));
  }
  if expected == 0 {
    return Ok(0);
  }
  let dim = vectors[0].len();
  if dim == 0 {
    return Err(EmbeddingError::Invariant("provider returned zero-length vectors".to_string()));
  }
  if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
    return Err(EmbeddingError::Invariant(format!(
      "inconsistent vector dimensions: {} vs {}",
      bad.len(),
      dim
    )));
  }
  Ok(dim)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn retryable_classification() {
    assert!(is_retryable_error(&EmbeddingError::Timeout));
    assert!(is_retryable_error(&EmbeddingError::Network("connection reset".into())));
    assert!(is_retryable_error(&EmbeddingError::Provider {
      status: 429,
      message: "too many requests".into()
    }));
    assert!(is_retryable_error(&EmbeddingError::Provider {
      status: 503,
      message: "service unavailable".into()
    }));
    assert!(is_retryable_error(&EmbeddingError::ProviderError("request throttled, retry later".into())));
    assert!(is_retryable_error(&EmbeddingError::ProviderError("quota temporarily exceeded".into())));
  }

  #[test]
  fn non_retryable_classification() {
    assert!(!is_retryable_error(&EmbeddingError::NoApiKey));
    assert!(!is_retryable_error(&EmbeddingError::Cancelled));
    assert!(!is_retryable_error(&EmbeddingError::Provider {
      status: 401,
      message: "unauthorized".into()
    }));
    assert!(!is_retryable_error(&EmbeddingError::Provider {
      status: 403,
      message: "forbidden".into()
    }));
    assert!(!is_retryable_error(&EmbeddingError::ProviderError("invalid key provided".into())));
    assert!(!is_retryable_error(&EmbeddingError::Provider {
      status: 400,
      message: "malformed request body".into()
    }));
    // auth wording wins over transient wording
    assert!(!is_retryable_error(&EmbeddingError::ProviderError(
      "api key rejected due to rate limit policy".into()
    )));
  }

  #[test]
  fn validate_embeddings_checks_shape() {
    let good = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
    assert_eq!(validate_embeddings(2, &good).unwrap(), 2);

    assert!(validate_embeddings(3, &good).is_err());

    let ragged = vec![vec![0.1, 0.2], vec![0.3]];
    assert!(validate_embeddings(2, &ragged).is_err());

    let empty_vecs = vec![vec![], vec![]];
    assert!(validate_embeddings(2, &empty_vecs).is_err());

    assert_eq!(validate_embeddings(0, &[]).unwrap(), 0);
  }
}
