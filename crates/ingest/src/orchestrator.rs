//! The per-job orchestrator: drives parser → batcher → embedder → sink with
//! checkpoint and progress callbacks at batch boundaries.
//!
//! One invocation per worker slot. Cancellation is observed at every batch
//! boundary and inside every embedding attempt; at most the in-flight batch's
//! upsert completes after the token trips. Every error exit forces a
//! checkpoint first, so even a crash between job-level retries resumes from
//! the latest durable prefix.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use embedding::{EmbeddingError, EmbeddingProvider, ResilientEmbedder, RetryConfig};
use parser::StreamingProcessor;
use silt_core::config::BatchLimits;
use silt_core::{IngestOutcome, IngestRunStats, JobRecord, ProcessingPhase};
use state::{FailedBatchPayload, ProgressCounters};
use vectordb::{EnsureOutcome, VectorRow, VectorSink};

use crate::IngestError;
use crate::batch::{Batch, BatchManager};
use crate::context::IngestContext;

#[derive(Debug, Default)]
struct RunCounters {
  /// Source items whose chunks are all durably upserted.
  durable_items: u64,
  chunks: u64,
  embeddings: u64,
  upserted: u64,
  batches: u64,
}

/// Run one ingest job to completion, pause, cancellation, or failure.
pub(crate) async fn run_job(
  ctx: &IngestContext,
  record: &JobRecord,
  provider: Arc<dyn EmbeddingProvider>,
  sink: Arc<dyn VectorSink>,
  cancel: &CancellationToken,
) -> Result<IngestOutcome, IngestError> {
  let retry = RetryConfig {
    max_attempts: ctx.config.embed_attempts,
    initial_backoff: std::time::Duration::from_secs_f64(ctx.config.embed_backoff_secs.max(0.001)),
    request_timeout: std::time::Duration::from_secs(ctx.config.request_timeout_secs),
    ..Default::default()
  };

  let runner = JobRunner {
    ctx,
    record,
    embedder: ResilientEmbedder::with_config(provider, retry),
    sink,
    cancel,
    batcher: BatchManager::new(&record.config.embedding.model, ctx.config.batch_limits),
    counters: RunCounters::default(),
    collection_ready: false,
    dim: 0,
    started: Instant::now(),
  };

  runner.run().await
}

struct JobRunner<'a> {
  ctx: &'a IngestContext,
  record: &'a JobRecord,
  embedder: ResilientEmbedder,
  sink: Arc<dyn VectorSink>,
  cancel: &'a CancellationToken,
  batcher: BatchManager,
  counters: RunCounters,
  collection_ready: bool,
  dim: usize,
  started: Instant,
}

impl JobRunner<'_> {
  async fn run(mut self) -> Result<IngestOutcome, IngestError> {
    let job_id = self.record.job_id.clone();

    self
      .record
      .config
      .schema
      .validate()
      .map_err(|e| IngestError::Validation(e.message))?;

    self.ctx.progress.update_phase(&job_id, ProcessingPhase::Analyzing).await?;

    let recovery = self
      .ctx
      .checkpoints
      .recovery_context(&job_id, self.ctx.config.max_job_retries)
      .await?;

    let mut processor = StreamingProcessor::open(
      &self.record.file.path,
      &self.record.config.schema,
      &self.record.config.embedding.model,
    )?;

    if let Some(recovery) = &recovery {
      if recovery.should_retry_failed {
        self.recover_failed_batches(&job_id).await?;
      }

      self.counters.durable_items = recovery.checkpoint.items_processed;
      self.counters.chunks = recovery.checkpoint.chunks_processed;
      self.counters.embeddings = recovery.checkpoint.embeddings_generated;
      processor.skip_items(recovery.checkpoint.items_processed);

      info!(
        %job_id,
        items_processed = recovery.checkpoint.items_processed,
        "resuming from checkpoint"
      );
      self
        .ctx
        .progress
        .update(
          &job_id,
          ProgressCounters {
            items_processed: Some(recovery.checkpoint.items_processed),
            chunks_created: Some(recovery.checkpoint.chunks_processed),
            embeddings_generated: Some(recovery.checkpoint.embeddings_generated),
            ..Default::default()
          },
          true,
        )
        .await?;
    }

    self.ctx.progress.update_phase(&job_id, ProcessingPhase::Parsing).await?;

    match self.pump(&job_id, &mut processor).await {
      Ok(()) => {}
      Err(e) => {
        // Forced checkpoint on every error exit, cancellation included, so
        // the next attempt resumes from the latest durable prefix.
        let mut processing_state = BTreeMap::new();
        processing_state.insert("last_error".to_string(), e.to_string());
        if let Err(save_err) = self.force_checkpoint(&job_id, &processor, processing_state).await {
          warn!(%job_id, error = %save_err, "failed to save checkpoint on error exit");
        }
        return Err(e);
      }
    }

    self.ctx.progress.update_phase(&job_id, ProcessingPhase::Finalizing).await?;
    let stats = processor.stats();
    self
      .ctx
      .progress
      .update(
        &job_id,
        ProgressCounters {
          items_processed: Some(stats.items_processed),
          chunks_created: Some(self.counters.chunks),
          embeddings_generated: Some(self.counters.embeddings),
          vectors_stored: Some(self.counters.upserted),
          bytes_processed: Some(stats.bytes_processed),
          errors_encountered: Some(stats.errors_encountered),
        },
        true,
      )
      .await?;
    self
      .ctx
      .progress
      .update_embedding_stats(&job_id, self.batcher.stats().as_json())
      .await?;

    // A deleted checkpoint implies the job reached completion
    self.ctx.checkpoints.delete(&job_id).await?;

    info!(
      %job_id,
      items = stats.items_processed,
      chunks = self.counters.chunks,
      embeddings = self.counters.embeddings,
      batches = self.counters.batches,
      upserted = self.counters.upserted,
      "ingest complete"
    );

    Ok(IngestOutcome {
      upserted: self.counters.upserted,
      dim: self.dim,
      stats: IngestRunStats {
        items_processed: stats.items_processed,
        chunks_created: self.counters.chunks,
        embeddings_generated: self.counters.embeddings,
        batches_processed: self.counters.batches,
        errors_encountered: stats.errors_encountered,
        processing_secs: self.started.elapsed().as_secs_f64(),
      },
    })
  }

  /// The main item loop: pull, batch, dispatch, checkpoint.
  async fn pump(&mut self, job_id: &str, processor: &mut StreamingProcessor) -> Result<(), IngestError> {
    let mut last_checkpoint = self.counters.durable_items;

    loop {
      if self.cancel.is_cancelled() {
        debug!(%job_id, "cancellation observed at item boundary");
        return Err(IngestError::Cancelled);
      }

      let Some(item) = processor.next_item()? else { break };

      if let Some(batch) = self.batcher.try_add(item)? {
        self.process_batch(job_id, batch).await?;

        if self.counters.durable_items.saturating_sub(last_checkpoint) >= self.ctx.config.checkpoint_interval {
          self.force_checkpoint(job_id, processor, BTreeMap::new()).await?;
          last_checkpoint = self.counters.durable_items;
        }
      }

      let stats = processor.stats();
      self
        .ctx
        .progress
        .update(
          job_id,
          ProgressCounters {
            items_processed: Some(stats.items_processed),
            chunks_created: Some(self.counters.chunks),
            embeddings_generated: Some(self.counters.embeddings),
            vectors_stored: Some(self.counters.upserted),
            bytes_processed: Some(stats.bytes_processed),
            errors_encountered: Some(stats.errors_encountered),
          },
          false,
        )
        .await?;
    }

    if let Some(batch) = self.batcher.flush()? {
      self.process_batch(job_id, batch).await?;
    }

    Ok(())
  }

  /// Embed, ensure the collection, and upsert one batch.
  async fn process_batch(&mut self, job_id: &str, batch: Batch) -> Result<(), IngestError> {
    if batch.size() > BatchLimits::HARD_CHUNK_LIMIT || batch.total_tokens > BatchLimits::HARD_TOKEN_LIMIT {
      return Err(IngestError::BatchInvariant(format!(
        "batch {} with {} items / {} tokens reached dispatch",
        batch.batch_id,
        batch.size(),
        batch.total_tokens
      )));
    }

    let texts = batch.texts();
    debug!(%job_id, batch_id = %batch.batch_id, size = batch.size(), tokens = batch.total_tokens, "processing batch");

    let matrix = match self
      .embedder
      .embed_batch_with_retry(&texts, batch.total_tokens, self.cancel)
      .await
    {
      Ok(matrix) => matrix,
      Err(EmbeddingError::Cancelled) => return Err(IngestError::Cancelled),
      Err(e) => {
        let err = IngestError::Embedding(e);
        let _ = self
          .ctx
          .checkpoints
          .save_failed_batch(job_id, Self::payload_of(&batch), err.to_info())
          .await;
        return Err(err);
      }
    };

    if let Err(e) = self.ensure_collection(job_id, matrix.dim).await {
      let _ = self
        .ctx
        .checkpoints
        .save_failed_batch(job_id, Self::payload_of(&batch), e.to_info())
        .await;
      return Err(e);
    }

    let rows: Vec<VectorRow> = batch
      .items
      .iter()
      .zip(matrix.vectors.iter())
      .map(|(item, vector)| VectorRow {
        text: item.text.clone(),
        embedding: vector.clone(),
        metadata: Some(serde_json::to_string(&item.metadata).unwrap_or_else(|_| "{}".to_string())),
      })
      .collect();

    let outcome = match self.sink.upsert(rows).await {
      Ok(outcome) => outcome,
      Err(e) => {
        let err = IngestError::Store(e);
        let _ = self
          .ctx
          .checkpoints
          .save_failed_batch(job_id, Self::payload_of(&batch), err.to_info())
          .await;
        return Err(err);
      }
    };

    if outcome.is_partial() {
      warn!(
        job_id,
        batch_id = %batch.batch_id,
        inserted = outcome.inserted_count,
        requested = outcome.requested_count,
        "partial insert, continuing"
      );
    }

    self.counters.chunks += batch.size() as u64;
    self.counters.embeddings += matrix.vectors.len() as u64;
    self.counters.upserted += outcome.inserted_count as u64;
    self.counters.batches += 1;
    if let Some(completed) = batch.completed_source_items() {
      self.counters.durable_items = self.counters.durable_items.max(completed);
    }

    Ok(())
  }

  /// Replay batches persisted by a previous failed run, deleting each on
  /// success. A batch past its retry cap is left to expire by TTL.
  async fn recover_failed_batches(&mut self, job_id: &str) -> Result<(), IngestError> {
    let failed = self.ctx.checkpoints.list_failed_batches(job_id).await?;
    info!(%job_id, count = failed.len(), "retrying failed batches from previous run");

    for entry in failed {
      let Some(payload) = self
        .ctx
        .checkpoints
        .retry_failed_batch(&entry.failed_id, self.ctx.config.max_job_retries)
        .await?
      else {
        warn!(failed_id = %entry.failed_id, "failed batch exhausted retries, leaving for ttl expiry");
        continue;
      };

      let texts: Vec<&str> = payload.texts.iter().map(String::as_str).collect();
      let tokens = self.batcher.counter().estimate_batch(&texts);

      let matrix = match self.embedder.embed_batch_with_retry(&texts, tokens, self.cancel).await {
        Ok(matrix) => matrix,
        Err(EmbeddingError::Cancelled) => return Err(IngestError::Cancelled),
        // The stored batch stays put for the next attempt
        Err(e) => return Err(IngestError::Embedding(e)),
      };

      self.ensure_collection(job_id, matrix.dim).await?;

      let rows: Vec<VectorRow> = payload
        .texts
        .iter()
        .enumerate()
        .zip(matrix.vectors.iter())
        .map(|((i, text), vector)| VectorRow {
          text: text.clone(),
          embedding: vector.clone(),
          metadata: payload
            .metadatas
            .get(i)
            .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "{}".to_string())),
        })
        .collect();

      let outcome = self.sink.upsert(rows).await?;
      self.ctx.checkpoints.mark_batch_recovered(&entry.failed_id).await?;

      self.counters.chunks += payload.texts.len() as u64;
      self.counters.embeddings += matrix.vectors.len() as u64;
      self.counters.upserted += outcome.inserted_count as u64;
      self.counters.batches += 1;
    }

    Ok(())
  }

  async fn ensure_collection(&mut self, job_id: &str, dim: usize) -> Result<(), IngestError> {
    if self.collection_ready {
      return Ok(());
    }
    let outcome = self.sink.ensure_collection(dim).await?;
    if outcome == EnsureOutcome::Created {
      info!(%job_id, dim, "created vector collection");
    }
    self.collection_ready = true;
    self.dim = dim;
    Ok(())
  }

  async fn force_checkpoint(
    &self,
    job_id: &str,
    processor: &StreamingProcessor,
    processing_state: BTreeMap<String, String>,
  ) -> Result<(), IngestError> {
    let stats = processor.stats();
    self
      .ctx
      .checkpoints
      .save(
        job_id,
        &self.record.file.path.to_string_lossy(),
        stats.bytes_processed,
        self.counters.durable_items,
        self.counters.chunks,
        self.counters.embeddings,
        processing_state,
        true,
      )
      .await?;
    Ok(())
  }

  fn payload_of(batch: &Batch) -> FailedBatchPayload {
    FailedBatchPayload {
      texts: batch.items.iter().map(|i| i.text.clone()).collect(),
      metadatas: batch.items.iter().map(|i| serde_json::Value::Object(i.metadata.clone())).collect(),
    }
  }
}
