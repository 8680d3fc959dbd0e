//! Shared domain types for the silt ingestion engine.
//!
//! Everything the pipeline crates agree on lives here: job records and their
//! lifecycle states, schema/chunking configuration, processing phases, the
//! error taxonomy, and service configuration. The crates downstream (parser,
//! embedding, vectordb, state, ingest) depend on these types but not on each
//! other's internals.

pub mod config;
pub mod error;
pub mod job;
pub mod phase;
pub mod schema;

pub use config::{
  BatchLimits, EmbeddingConfig, EmbeddingProviderKind, MetricType, RagConfig, ServiceConfig, VectorStoreConfig,
};
pub use error::{ErrorInfo, ErrorKind};
pub use job::{FileInfo, IngestOutcome, IngestRunStats, JobConfig, JobProgress, JobRecord, JobStatus};
pub use phase::ProcessingPhase;
pub use schema::{ChunkingConfig, FieldMapping, SchemaConfig, SourceFormat};
