//! Explicit process-level context. Built once at startup and passed by
//! reference; there are no global singletons.

use std::sync::Arc;

use embedding::{EmbeddingProvider, provider_from_config};
use silt_core::config::{EmbeddingConfig, ServiceConfig, VectorStoreConfig};
use state::{CheckpointStore, JobStore, Kv, MemoryKv, ProgressTracker, RedisKv};
use vectordb::{MilvusClient, VectorSink};

use crate::IngestError;

/// Shared stores and configuration for the task manager and orchestrators.
#[derive(Clone)]
pub struct IngestContext {
  pub config: Arc<ServiceConfig>,
  pub jobs: Arc<JobStore>,
  pub checkpoints: Arc<CheckpointStore>,
  pub progress: Arc<ProgressTracker>,
}

impl IngestContext {
  /// Assemble the context over any KV backend.
  pub fn new(config: ServiceConfig, kv: Arc<dyn Kv>) -> Self {
    let jobs = Arc::new(JobStore::new(kv.clone()));
    let checkpoints = Arc::new(CheckpointStore::new(kv.clone(), config.checkpoint_interval));
    let progress = Arc::new(ProgressTracker::new(kv, config.progress_update_secs));
    Self {
      config: Arc::new(config),
      jobs,
      checkpoints,
      progress,
    }
  }

  /// Production context over Redis.
  pub async fn connect(config: ServiceConfig) -> Result<Self, IngestError> {
    let kv = Arc::new(RedisKv::connect(&config.redis_url).await?);
    Ok(Self::new(config, kv))
  }

  /// Self-contained context for tests and single-node deployments.
  pub fn in_memory(config: ServiceConfig) -> Self {
    Self::new(config, Arc::new(MemoryKv::new()))
  }
}

/// Factory seam for the per-job collaborators, so tests can substitute mock
/// providers and sinks.
pub trait Backends: Send + Sync {
  fn embedder(&self, config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, IngestError>;
  fn vector_sink(&self, config: &VectorStoreConfig) -> Result<Arc<dyn VectorSink>, IngestError>;
}

/// Production backends: real embedding providers, real vector store.
#[derive(Debug, Default)]
pub struct LiveBackends;

impl Backends for LiveBackends {
  fn embedder(&self, config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, IngestError> {
    Ok(provider_from_config(config)?)
  }

  fn vector_sink(&self, config: &VectorStoreConfig) -> Result<Arc<dyn VectorSink>, IngestError> {
    Ok(Arc::new(MilvusClient::connect(config.clone())))
  }
}
