//! Service and per-tenant configuration.
//!
//! `ServiceConfig` holds the process-wide tunables and can be loaded from a
//! TOML file; per-job `EmbeddingConfig` and per-tenant `RagConfig` arrive as
//! JSON alongside job submissions. API keys may come from the environment
//! instead of the config payload.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Embedding provider selection for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
  /// Local model served by an Ollama-compatible endpoint.
  Ollama,
  /// Hosted provider with document/query input types and hard batch limits.
  Voyage,
  /// Hosted provider with a plain embeddings endpoint.
  OpenAi,
}

/// Per-job embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
  pub provider: EmbeddingProviderKind,
  pub model: String,
  #[serde(default)]
  pub api_key: Option<String>,
  /// Base URL override; only meaningful for the local provider.
  #[serde(default)]
  pub base_url: Option<String>,
  /// Upper bound applied by token-aware chunking when the schema does not
  /// specify its own.
  #[serde(default)]
  pub max_tokens_per_chunk: Option<usize>,
  /// Optional calls-per-minute cap enforced by the rate-limited wrapper.
  #[serde(default)]
  pub requests_per_minute: Option<usize>,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      provider: EmbeddingProviderKind::Ollama,
      model: "nomic-embed-text".to_string(),
      api_key: None,
      base_url: None,
      max_tokens_per_chunk: None,
      requests_per_minute: None,
    }
  }
}

/// Distance metric for the vector collection's ANN index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
  #[serde(rename = "IP")]
  Ip,
  #[serde(rename = "COSINE")]
  Cosine,
  #[serde(rename = "L2")]
  L2,
}

impl MetricType {
  pub fn as_str(&self) -> &'static str {
    match self {
      MetricType::Ip => "IP",
      MetricType::Cosine => "COSINE",
      MetricType::L2 => "L2",
    }
  }
}

fn default_vector_field() -> String {
  "embedding".to_string()
}
fn default_text_field() -> String {
  "text".to_string()
}
fn default_metadata_field() -> Option<String> {
  Some("metadata".to_string())
}
fn default_metric() -> MetricType {
  MetricType::Ip
}

/// Connection and schema settings for a tenant's vector collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
  pub uri: String,
  #[serde(default)]
  pub token: Option<String>,
  #[serde(default)]
  pub db: Option<String>,
  pub collection: String,
  #[serde(default = "default_vector_field")]
  pub vector_field: String,
  #[serde(default = "default_text_field")]
  pub text_field: String,
  #[serde(default = "default_metadata_field")]
  pub metadata_field: Option<String>,
  #[serde(default = "default_metric")]
  pub metric_type: MetricType,
}

fn default_top_k() -> usize {
  3
}

/// Tenant-level RAG configuration consumed by the ingest core and the
/// chat-time collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
  pub enabled: bool,
  pub milvus: VectorStoreConfig,
  pub embedding_provider: EmbeddingProviderKind,
  pub embedding_model: String,
  #[serde(default)]
  pub provider_keys: BTreeMap<String, String>,
  #[serde(default = "default_top_k")]
  pub top_k: usize,
}

/// Safety margins applied by the batch manager, strictly below the provider
/// hard limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchLimits {
  pub chunk_limit: usize,
  pub token_limit: usize,
}

impl BatchLimits {
  /// Provider hard limit on chunks per request.
  pub const HARD_CHUNK_LIMIT: usize = 1000;
  /// Provider hard limit on tokens per request.
  pub const HARD_TOKEN_LIMIT: usize = 10_000;
}

impl Default for BatchLimits {
  fn default() -> Self {
    Self {
      chunk_limit: 950,
      token_limit: 9500,
    }
  }
}

fn default_redis_url() -> String {
  "redis://127.0.0.1:6379".to_string()
}
fn default_max_concurrent_tasks() -> usize {
  5
}
fn default_checkpoint_interval() -> u64 {
  100
}
fn default_progress_update_secs() -> f64 {
  5.0
}
fn default_job_retries() -> u32 {
  3
}
fn default_embed_attempts() -> u32 {
  4
}
fn default_request_timeout_secs() -> u64 {
  60
}
fn default_max_age_hours() -> u64 {
  24
}
fn default_retry_backoff_secs() -> f64 {
  2.0
}
fn default_embed_backoff_secs() -> f64 {
  1.0
}

/// Process-wide configuration for the ingest service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
  #[serde(default = "default_redis_url")]
  pub redis_url: String,
  /// Cap on jobs in the `running` state, process-wide.
  #[serde(default = "default_max_concurrent_tasks")]
  pub max_concurrent_tasks: usize,
  /// Items between automatic checkpoints.
  #[serde(default = "default_checkpoint_interval")]
  pub checkpoint_interval: u64,
  /// Minimum seconds between persisted progress updates.
  #[serde(default = "default_progress_update_secs")]
  pub progress_update_secs: f64,
  /// Job-level retries on recoverable errors.
  #[serde(default = "default_job_retries")]
  pub max_job_retries: u32,
  /// Per-batch embedding attempts inside the resilient wrapper.
  #[serde(default = "default_embed_attempts")]
  pub embed_attempts: u32,
  /// Bound on each embedding / vector-store RPC.
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
  /// Age after which completed/failed/cancelled job records are swept.
  #[serde(default = "default_max_age_hours")]
  pub max_age_hours: u64,
  /// Base for the job-level exponential backoff (capped at 60s).
  #[serde(default = "default_retry_backoff_secs")]
  pub retry_backoff_secs: f64,
  /// Initial backoff between embedding attempts inside the resilient wrapper.
  #[serde(default = "default_embed_backoff_secs")]
  pub embed_backoff_secs: f64,
  #[serde(default)]
  pub batch_limits: BatchLimits,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      redis_url: default_redis_url(),
      max_concurrent_tasks: default_max_concurrent_tasks(),
      checkpoint_interval: default_checkpoint_interval(),
      progress_update_secs: default_progress_update_secs(),
      max_job_retries: default_job_retries(),
      embed_attempts: default_embed_attempts(),
      request_timeout_secs: default_request_timeout_secs(),
      max_age_hours: default_max_age_hours(),
      retry_backoff_secs: default_retry_backoff_secs(),
      embed_backoff_secs: default_embed_backoff_secs(),
      batch_limits: BatchLimits::default(),
    }
  }
}

impl ServiceConfig {
  /// Load from a TOML file, falling back to defaults for missing keys.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
    let config: ServiceConfig = toml::from_str(&raw)?;
    Ok(config)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config at {0}: {1}")]
  Read(String, #[source] std::io::Error),
  #[error("failed to parse config: {0}")]
  Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_documented_values() {
    let config = ServiceConfig::default();
    assert_eq!(config.max_concurrent_tasks, 5);
    assert_eq!(config.checkpoint_interval, 100);
    assert_eq!(config.batch_limits.chunk_limit, 950);
    assert_eq!(config.batch_limits.token_limit, 9500);
    assert!(config.batch_limits.chunk_limit < BatchLimits::HARD_CHUNK_LIMIT);
    assert!(config.batch_limits.token_limit < BatchLimits::HARD_TOKEN_LIMIT);
  }

  #[test]
  fn partial_toml_fills_defaults() {
    let config: ServiceConfig = toml::from_str("max_concurrent_tasks = 2\n").unwrap();
    assert_eq!(config.max_concurrent_tasks, 2);
    assert_eq!(config.checkpoint_interval, 100);
  }

  #[test]
  fn vector_store_config_defaults() {
    let raw = r#"{ "uri": "http://localhost:19530", "collection": "docs" }"#;
    let config: VectorStoreConfig = serde_json::from_str(raw).unwrap();
    assert_eq!(config.vector_field, "embedding");
    assert_eq!(config.text_field, "text");
    assert_eq!(config.metadata_field.as_deref(), Some("metadata"));
    assert_eq!(config.metric_type, MetricType::Ip);
  }

  #[test]
  fn metric_type_wire_names() {
    assert_eq!(serde_json::to_string(&MetricType::Cosine).unwrap(), "\"COSINE\"");
    let metric: MetricType = serde_json::from_str("\"L2\"").unwrap();
    assert_eq!(metric, MetricType::L2);
  }
}
