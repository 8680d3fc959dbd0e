//! Hosted provider with a plain embeddings endpoint and no input-type
//! distinction.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use silt_core::config::EmbeddingConfig;

use super::{EmbeddingError, EmbeddingMode, EmbeddingProvider};

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";

#[derive(Debug, Clone)]
pub struct OpenAiProvider {
  client: reqwest::Client,
  api_key: String,
  model: String,
}

impl OpenAiProvider {
  pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
    let api_key = match &config.api_key {
      Some(key) if !key.is_empty() => key.clone(),
      _ => match std::env::var("OPENAI_API_KEY") {
        Ok(key) => key,
        Err(_) => return Err(EmbeddingError::NoApiKey),
      },
    };

    debug!(model = %config.model, "openai provider initialized");
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
impl EmbeddingProvider for OpenAiProvider {
  fn name(&self) -> &str {
    "openai"
  }

  fn model_id(&self) -> &str {
    &self.model
  }

  async fn embed_batch(&self, texts: &[&str], _mode: EmbeddingMode) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let request = EmbeddingRequest {
      model: &self.model,
      input: texts,
    };

    trace!(batch_size = texts.len(), model = %self.model, "sending openai embedding request");
    let start = Instant::now();

    let response = self
      .client
      .post(OPENAI_URL)
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
        error!(status = %status, model = %self.model, "openai authentication failed");
      } else {
        warn!(status = %status, batch_size = texts.len(), model = %self.model, "openai embedding failed");
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
      "openai batch complete"
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
