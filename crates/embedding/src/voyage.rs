//! Hosted provider with document/query input types and hard batch limits
//! (1000 chunks / 10000 tokens per request).

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use silt_core::config::{BatchLimits, EmbeddingConfig};

use super::{EmbeddingError, EmbeddingMode, EmbeddingProvider};

const VOYAGE_URL: &str = "https://api.voyageai.com/v1/embeddings";

#[derive(Debug, Clone)]
pub struct VoyageProvider {
  client: reqwest::Client,
  api_key: String,
  model: String,
}

impl VoyageProvider {
  pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
    let api_key = match &config.api_key {
      Some(key) if !key.is_empty() => key.clone(),
      _ => match std::env::var("VOYAGE_API_KEY") {
        Ok(key) => key,
        Err(_) => return Err(EmbeddingError::NoApiKey),
      },
    };

    debug!(model = %config.model, "voyage provider initialized");
    Ok(Self {
      client: reqwest::Client::new(),
      api_key,
      model: config.model.clone(),
    })
  }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
  model: &'a str,
  input: &'a [&'a str],
  input_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
  data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
  embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for VoyageProvider {
  fn name(&self) -> &str {
    "voyage"
  }

  fn model_id(&self) -> &str {
    &self.model
  }

  /// One batched call per attempt; the batch manager guarantees the payload
  /// fits the provider limits before we get here.
  async fn embed_batch(&self, texts: &[&str], mode: EmbeddingMode) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }
    if texts.len() > BatchLimits::HARD_CHUNK_LIMIT {
      return Err(EmbeddingError::Invariant(format!(
        "batch of {} texts exceeds the {}-chunk provider limit",
        texts.len(),
        BatchLimits::HARD_CHUNK_LIMIT
      )));
    }

    let request = EmbeddingRequest {
      model: &self.model,
      input: texts,
      input_type: mode.as_input_type(),
    };

    trace!(batch_size = texts.len(), mode = ?mode, model = %self.model, "sending voyage embedding request");
    let start = Instant::now();

    let response = self
      .client
      .post(VOYAGE_URL)
      .header("Authorization", format!("Bearer {}", self.api_key))
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
      let status_code = status.as_u16();
      let body = response.text().await.unwrap_or_default();
      if status_code == 401 || status_code == 403 {
        error!(status = %status, model = %self.model, "voyage authentication failed");
      } else {
        warn!(status = %status, batch_size = texts.len(), model = %self.model, "voyage embedding failed");
      }
      return Err(EmbeddingError::Provider {
        status: status_code,
        message: body,
      });
    }

    let result: EmbeddingResponse = response.json().await?;
    trace!(
      embeddings = result.data.len(),
      elapsed_ms = start.elapsed().as_millis(),
      "voyage batch complete"
    );

    if result.data.len() != texts.len() {
      return Err(EmbeddingError::Invariant(format!(
        "got {} embeddings for {} inputs",
        result.data.len(),
        texts.len()
      )));
    }

    Ok(result.data.into_iter().map(|d| d.embedding).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_key_is_rejected() {
    // Only run when the environment cannot satisfy the fallback lookup.
    if std::env::var("VOYAGE_API_KEY").is_ok() {
      return;
    }
    let config = EmbeddingConfig {
      provider: silt_core::config::EmbeddingProviderKind::Voyage,
      model: "voyage-large-2".into(),
      api_key: None,
      ..Default::default()
    };
    assert!(matches!(VoyageProvider::new(&config), Err(EmbeddingError::NoApiKey)));
  }

  #[test]
  fn configured_key_wins() {
    let config = EmbeddingConfig {
      provider: silt_core::config::EmbeddingProviderKind::Voyage,
      model: "voyage-large-2".into(),
      api_key: Some("sk-test".into()),
      ..Default::default()
    };
    let provider = VoyageProvider::new(&config).unwrap();
    assert_eq!(provider.model_id(), "voyage-large-2");
    assert_eq!(provider.name(), "voyage");
  }
}
