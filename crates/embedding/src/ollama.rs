//! Local model variant served by an Ollama-compatible endpoint.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use silt_core::config::EmbeddingConfig;

use super::{EmbeddingError, EmbeddingMode, EmbeddingProvider};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Keep sub-batches small enough that a local GPU finishes each request
/// promptly.
const MAX_SUB_BATCH: usize = 64;
const MAX_CONCURRENT_REQUESTS: usize = 4;

#[derive(Debug, Clone)]
pub struct OllamaProvider {
  client: reqwest::Client,
  base_url: String,
  model: String,
}

impl OllamaProvider {
  pub fn new(config: &EmbeddingConfig) -> Self {
    let base_url = config.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    debug!(base_url, model = %config.model, "ollama provider initialized");
    Self {
      client: reqwest::Client::new(),
      base_url,
      model: config.model.clone(),
    }
  }

  fn embed_url(&self) -> String {
    format!("{}/api/embed", self.base_url)
  }

  async fn embed_single_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let request = EmbedRequest {
      model: &self.model,
      input: texts,
    };

    let start = Instant::now();
    let response = self
      .client
      .post(self.embed_url())
      .json(&request)
      .send()
      .await
      .map_err(|e| {
        if e.is_timeout() {
          EmbeddingError::Timeout
        } else {
          EmbeddingError::Network(e.to_string())
        }
      })?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      warn!(status = %status, batch_size = texts.len(), "ollama embed request failed");
      return Err(EmbeddingError::Provider {
        status: status.as_u16(),
        message: body,
      });
    }

    let result: EmbedResponse = response.json().await?;
    trace!(
      batch_size = texts.len(),
      elapsed_ms = start.elapsed().as_millis(),
      "ollama batch complete"
    );

    if result.embeddings.len() != texts.len() {
      return Err(EmbeddingError::Invariant(format!(
        "got {} embeddings for {} inputs",
        result.embeddings.len(),
        texts.len()
      )));
    }

    Ok(result.embeddings)
  }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
  model: &'a str,
  input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
  embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
  fn name(&self) -> &str {
    "ollama"
  }

  fn model_id(&self) -> &str {
    &self.model
  }

  /// Large batches are split into sub-batches embedded with bounded
  /// concurrency, then reassembled in order.
  async fn embed_batch(&self, texts: &[&str], _mode: EmbeddingMode) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    use tokio::sync::Semaphore;

    if texts.len() <= MAX_SUB_BATCH {
      return self.embed_single_batch(texts).await;
    }

    let sub_batches = texts.len().div_ceil(MAX_SUB_BATCH);
    debug!(
      batch_size = texts.len(),
      sub_batches,
      model = %self.model,
      "embedding batch as concurrent sub-batches"
    );

    // Bound concurrent requests so a local GPU is not flooded. The futures
    // only borrow, so no task spawning is needed.
    let gate = Semaphore::new(MAX_CONCURRENT_REQUESTS);
    let jobs = texts.chunks(MAX_SUB_BATCH).enumerate().map(|(index, sub)| {
      let gate = &gate;
      async move {
        let _slot = gate
          .acquire()
          .await
          .map_err(|_| EmbeddingError::ProviderError("concurrency gate closed".to_string()))?;
        Ok::<_, EmbeddingError>((index, self.embed_single_batch(sub).await?))
      }
    });

    let mut ordered: Vec<(usize, Vec<Vec<f32>>)> = Vec::with_capacity(sub_batches);
    for outcome in futures::future::join_all(jobs).await {
      ordered.push(outcome?);
    }
    ordered.sort_by_key(|(index, _)| *index);

    Ok(ordered.into_iter().flat_map(|(_, vectors)| vectors).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_base_url_applies() {
    let provider = OllamaProvider::new(&EmbeddingConfig::default());
    assert_eq!(provider.embed_url(), "http://localhost:11434/api/embed");
  }

  #[test]
  fn base_url_override() {
    let config = EmbeddingConfig {
      base_url: Some("http://gpu-box:11434".to_string()),
      ..Default::default()
    };
    let provider = OllamaProvider::new(&config);
    assert_eq!(provider.embed_url(), "http://gpu-box:11434/api/embed");
  }
}
