//! Background task manager: job lifecycle, the bounded worker pool, and the
//! pause/resume/cancel control surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use silt_core::config::{EmbeddingConfig, VectorStoreConfig};
use silt_core::{ErrorInfo, FileInfo, IngestOutcome, JobConfig, JobRecord, JobStatus, ProcessingPhase, SchemaConfig};
use state::{DetailedProgress, RecoveryReport};

use crate::IngestError;
use crate::context::{Backends, IngestContext};
use crate::orchestrator::run_job;

/// Everything needed to start a job, as handed over by the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
  pub tenant_id: String,
  pub file_path: PathBuf,
  pub file_size: u64,
  pub filename: String,
  pub schema: SchemaConfig,
  pub embedding: EmbeddingConfig,
  pub vector_store: VectorStoreConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
  Pause,
  Resume,
  Cancel,
}

/// Condensed job view for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
  pub job_id: String,
  pub tenant_id: String,
  pub status: JobStatus,
  pub filename: String,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSummary {
  pub items_processed: u64,
  #[serde(default)]
  pub items_expected: Option<u64>,
  pub chunks_processed: u64,
  pub embeddings_generated: u64,
  pub bytes_processed: u64,
  #[serde(default)]
  pub percentage: Option<f64>,
  pub phase: ProcessingPhase,
  pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSummary {
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub elapsed_secs: f64,
  #[serde(default)]
  pub eta_secs: Option<f64>,
}

/// Full status response for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
  pub job_id: String,
  pub tenant_id: String,
  pub status: JobStatus,
  pub file: FileInfo,
  pub configuration: JobConfig,
  pub progress: ProgressSummary,
  pub timing: TimingSummary,
  #[serde(default)]
  pub detailed: Option<DetailedProgress>,
  #[serde(default)]
  pub error: Option<ErrorInfo>,
  #[serde(default)]
  pub results: Option<IngestOutcome>,
}

struct RunningJob {
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

struct ManagerInner {
  ctx: IngestContext,
  backends: Arc<dyn Backends>,
  running: Mutex<HashMap<String, RunningJob>>,
}

/// Owns the execution handle of every running job. All lifecycle mutations
/// of job records go through here.
#[derive(Clone)]
pub struct TaskManager {
  inner: Arc<ManagerInner>,
}

impl TaskManager {
  pub fn new(ctx: IngestContext, backends: Arc<dyn Backends>) -> Self {
    info!(
      max_concurrent_tasks = ctx.config.max_concurrent_tasks,
      "task manager initialized"
    );
    Self {
      inner: Arc::new(ManagerInner {
        ctx,
        backends,
        running: Mutex::new(HashMap::new()),
      }),
    }
  }

  pub fn context(&self) -> &IngestContext {
    &self.inner.ctx
  }

  /// Queue a new ingest job. Validates the schema up front so a bad
  /// submission never reaches a worker.
  pub async fn submit(&self, submission: JobSubmission) -> Result<String, IngestError> {
    submission
      .schema
      .validate()
      .map_err(|e| IngestError::Validation(e.message))?;

    let job_id = format!("ingest_{}", Uuid::new_v4().simple());
    let record = JobRecord::new(
      job_id.clone(),
      submission.tenant_id,
      FileInfo {
        path: submission.file_path,
        size: submission.file_size,
        filename: submission.filename,
      },
      JobConfig {
        schema: submission.schema,
        embedding: submission.embedding,
        vector_store: submission.vector_store,
      },
    );

    self.inner.ctx.jobs.store(&record).await?;
    self.inner.ctx.jobs.queue_push(&job_id).await?;
    info!(%job_id, tenant_id = %record.tenant_id, filename = %record.file.filename, "submitted ingest job");

    Self::pump(&self.inner).await;
    Ok(job_id)
  }

  /// Fill free worker slots from the queue, FIFO.
  async fn pump(inner: &Arc<ManagerInner>) {
    loop {
      let mut running = inner.running.lock().await;
      if running.len() >= inner.ctx.config.max_concurrent_tasks {
        return;
      }

      let job_id = match inner.ctx.jobs.queue_pop().await {
        Ok(Some(job_id)) => job_id,
        Ok(None) => return,
        Err(e) => {
          warn!(error = %e, "failed to pop task queue");
          return;
        }
      };

      let record = match inner.ctx.jobs.load(&job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
          warn!(%job_id, "queued job has no record, dropping");
          continue;
        }
        Err(e) => {
          warn!(%job_id, error = %e, "failed to load queued job");
          continue;
        }
      };

      // A job cancelled while queued stays out of the pool
      if record.status != JobStatus::Queued {
        debug!(%job_id, status = %record.status, "skipping non-queued job from queue");
        continue;
      }

      let cancel = CancellationToken::new();
      let handle = tokio::spawn(Self::execute(inner.clone(), job_id.clone(), cancel.clone()));
      running.insert(job_id.clone(), RunningJob { cancel, handle });
      drop(running);

      if let Err(e) = inner.ctx.jobs.active_add(&job_id).await {
        warn!(%job_id, error = %e, "failed to add job to active set");
      }
    }
  }

  fn execute(
    inner: Arc<ManagerInner>,
    job_id: String,
    cancel: CancellationToken,
  ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
      if let Err(e) = Self::execute_inner(&inner, &job_id, &cancel).await {
        error!(%job_id, error = %e, "job execution error");
      }

      inner.running.lock().await.remove(&job_id);
      if let Err(e) = inner.ctx.jobs.active_remove(&job_id).await {
        warn!(%job_id, error = %e, "failed to remove job from active set");
      }

      // Hand the freed slot to the next queued job
      Self::pump(&inner).await;
    })
  }

  async fn execute_inner(inner: &Arc<ManagerInner>, job_id: &str, cancel: &CancellationToken) -> Result<(), IngestError> {
    let ctx = &inner.ctx;
    let mut record = ctx.jobs.require(job_id).await?;

    let expected = parser::file_stats(&record.file.path).ok().map(|s| s.estimated_items);
    ctx.progress.start(job_id, &record.tenant_id, expected).await?;

    record.status = JobStatus::Running;
    record.progress.items_total = expected;
    record.progress.current_phase = Some(ProcessingPhase::Initializing);
    record.touch();
    ctx.jobs.store(&record).await?;

    let provider = match inner.backends.embedder(&record.config.embedding) {
      Ok(provider) => provider,
      Err(e) => return Self::fail(ctx, job_id, e).await,
    };
    let sink = match inner.backends.vector_sink(&record.config.vector_store) {
      Ok(sink) => sink,
      Err(e) => return Self::fail(ctx, job_id, e).await,
    };

    let mut attempt: u32 = 0;
    let result = loop {
      match run_job(ctx, &record, provider.clone(), sink.clone(), cancel).await {
        Ok(outcome) => break Ok(outcome),
        Err(e) if e.is_cancelled() => break Err(e),
        Err(e) if e.recoverable() && attempt < ctx.config.max_job_retries => {
          attempt += 1;
          let delay = ctx.config.retry_backoff_secs.max(0.001).powi(attempt as i32).min(60.0);
          warn!(
            job_id,
            attempt,
            max = ctx.config.max_job_retries,
            delay_secs = delay,
            error = %e,
            "recoverable failure, retrying job from checkpoint"
          );
          // run_job forced a checkpoint on its way out; back off, then rerun
          tokio::select! {
            _ = cancel.cancelled() => break Err(IngestError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
          }
        }
        Err(e) => break Err(e),
      }
    };

    match result {
      Ok(outcome) => {
        let mut record = ctx.jobs.require(job_id).await?;
        record.status = JobStatus::Completed;
        record.progress.items_processed = outcome.stats.items_processed;
        record.progress.chunks_processed = outcome.stats.chunks_created;
        record.progress.embeddings_generated = outcome.stats.embeddings_generated;
        record.progress.error_count = outcome.stats.errors_encountered;
        record.progress.current_phase = Some(ProcessingPhase::Completed);
        record.results = Some(outcome);
        record.touch();
        ctx.jobs.store(&record).await?;
        ctx.progress.finish(job_id, true).await?;
        info!(%job_id, "job completed");
      }
      Err(e) if e.is_cancelled() => {
        // pause()/cancel() set the status before tripping the token
        let record = ctx.jobs.require(job_id).await?;
        match record.status {
          JobStatus::Paused => {
            ctx.progress.update_phase(job_id, ProcessingPhase::Paused).await?;
            info!(%job_id, "job paused, checkpoint preserved");
          }
          JobStatus::Cancelled => {
            ctx.progress.update_phase(job_id, ProcessingPhase::Cancelled).await?;
            ctx.progress.finish(job_id, false).await?;
            info!(%job_id, "job cancelled");
          }
          other => warn!(%job_id, status = %other, "cancellation observed with unexpected status"),
        }
      }
      Err(e) => return Self::fail(ctx, job_id, e).await,
    }

    Ok(())
  }

  async fn fail(ctx: &IngestContext, job_id: &str, error: IngestError) -> Result<(), IngestError> {
    let mut record = ctx.jobs.require(job_id).await?;
    record.status = JobStatus::Failed;
    record.error = Some(error.to_info());
    record.progress.current_phase = Some(ProcessingPhase::Error);
    record.touch();
    ctx.jobs.store(&record).await?;

    ctx.progress.update_phase(job_id, ProcessingPhase::Error).await?;
    ctx.progress.finish(job_id, false).await?;

    error!(%job_id, kind = %error.kind(), error = %error, "job failed");
    Ok(())
  }

  async fn require(&self, job_id: &str) -> Result<JobRecord, IngestError> {
    self
      .inner
      .ctx
      .jobs
      .load(job_id)
      .await?
      .ok_or_else(|| IngestError::NotFound(job_id.to_string()))
  }

  /// Pause a running job. The orchestrator exits at the next suspension
  /// point, leaving the latest checkpoint in place.
  pub async fn pause(&self, job_id: &str) -> Result<(), IngestError> {
    let mut record = self.require(job_id).await?;
    if record.status != JobStatus::Running {
      return Err(IngestError::IllegalTransition {
        action: "pause",
        status: record.status,
      });
    }

    record.status = JobStatus::Paused;
    record.touch();
    self.inner.ctx.jobs.store(&record).await?;

    if let Some(running) = self.inner.running.lock().await.get(job_id) {
      running.cancel.cancel();
    }

    info!(%job_id, "pause requested");
    Ok(())
  }

  /// Re-queue a paused job; it resumes from its checkpoint.
  pub async fn resume(&self, job_id: &str) -> Result<(), IngestError> {
    let mut record = self.require(job_id).await?;
    if record.status != JobStatus::Paused {
      return Err(IngestError::IllegalTransition {
        action: "resume",
        status: record.status,
      });
    }

    record.status = JobStatus::Queued;
    record.touch();
    self.inner.ctx.jobs.store(&record).await?;
    self.inner.ctx.jobs.queue_push(job_id).await?;

    info!(%job_id, "resumed");
    Self::pump(&self.inner).await;
    Ok(())
  }

  /// Cancel from any non-terminal state. Terminal; checkpoints are retained
  /// for post-mortem until their TTL expires.
  pub async fn cancel(&self, job_id: &str) -> Result<(), IngestError> {
    let mut record = self.require(job_id).await?;
    if record.status.is_terminal() {
      return Err(IngestError::IllegalTransition {
        action: "cancel",
        status: record.status,
      });
    }

    let was_queued = record.status == JobStatus::Queued;
    record.status = JobStatus::Cancelled;
    record.touch();
    self.inner.ctx.jobs.store(&record).await?;

    let had_worker = {
      let running = self.inner.running.lock().await;
      match running.get(job_id) {
        Some(running_job) => {
          running_job.cancel.cancel();
          true
        }
        None => false,
      }
    };

    if was_queued {
      self.inner.ctx.jobs.queue_remove(job_id).await?;
    }
    if !had_worker {
      // no worker will observe the token, so seal the progress here
      self.inner.ctx.progress.update_phase(job_id, ProcessingPhase::Cancelled).await?;
      self.inner.ctx.progress.finish(job_id, false).await?;
    }

    info!(%job_id, "cancel requested");
    Ok(())
  }

  /// Dispatch a control action, mapping to the legal-transition checks.
  pub async fn control(&self, job_id: &str, action: ControlAction) -> Result<String, IngestError> {
    match action {
      ControlAction::Pause => self.pause(job_id).await.map(|_| format!("job {job_id} pausing")),
      ControlAction::Resume => self.resume(job_id).await.map(|_| format!("job {job_id} resumed")),
      ControlAction::Cancel => self.cancel(job_id).await.map(|_| format!("job {job_id} cancelled")),
    }
  }

  /// Status and progress for one job, merging the live progress snapshot
  /// over the durable record.
  pub async fn status(&self, job_id: &str) -> Result<StatusReport, IngestError> {
    let record = self.require(job_id).await?;
    let detailed = self.inner.ctx.progress.detailed(job_id).await?;

    let progress = match &detailed {
      Some(detailed) => ProgressSummary {
        items_processed: detailed.snapshot.items_processed,
        items_expected: detailed.snapshot.items_expected,
        chunks_processed: detailed.snapshot.chunks_created,
        embeddings_generated: detailed.snapshot.embeddings_generated,
        bytes_processed: detailed.snapshot.bytes_processed,
        percentage: detailed.percentage,
        phase: detailed.snapshot.current_phase,
        errors: detailed.snapshot.errors_encountered,
      },
      None => ProgressSummary {
        items_processed: record.progress.items_processed,
        items_expected: record.progress.items_total,
        chunks_processed: record.progress.chunks_processed,
        embeddings_generated: record.progress.embeddings_generated,
        bytes_processed: record.progress.bytes_processed,
        percentage: record.progress.percentage(),
        phase: record.progress.current_phase.unwrap_or(ProcessingPhase::Initializing),
        errors: record.progress.error_count,
      },
    };

    let timing = TimingSummary {
      created_at: record.created_at,
      updated_at: record.updated_at,
      elapsed_secs: detailed.as_ref().map(|d| d.elapsed_secs).unwrap_or_else(|| record.elapsed_secs()),
      eta_secs: detailed.as_ref().and_then(|d| d.eta_secs),
    };

    Ok(StatusReport {
      job_id: record.job_id.clone(),
      tenant_id: record.tenant_id.clone(),
      status: record.status,
      file: record.file.clone(),
      configuration: record.config.clone(),
      progress,
      timing,
      detailed,
      error: record.error.clone(),
      results: record.results.clone(),
    })
  }

  /// Recovery statistics: whether the job can resume and what is pending.
  pub async fn recovery(&self, job_id: &str) -> Result<RecoveryReport, IngestError> {
    Ok(self.inner.ctx.checkpoints.recovery_report(job_id).await?)
  }

  /// Summaries of currently active (running) jobs, optionally filtered by
  /// tenant.
  pub async fn active(&self, tenant_id: Option<&str>) -> Result<Vec<JobSummary>, IngestError> {
    let mut summaries = Vec::new();
    for job_id in self.inner.ctx.jobs.active_list().await? {
      let Some(record) = self.inner.ctx.jobs.load(&job_id).await? else {
        continue;
      };
      if let Some(tenant) = tenant_id
        && record.tenant_id != tenant
      {
        continue;
      }
      summaries.push(JobSummary {
        job_id: record.job_id,
        tenant_id: record.tenant_id,
        status: record.status,
        filename: record.file.filename,
        created_at: record.created_at,
      });
    }
    summaries.sort_by_key(|s| s.created_at);
    Ok(summaries)
  }

  /// Number of jobs currently holding worker slots.
  pub async fn running_count(&self) -> usize {
    self.inner.running.lock().await.len()
  }

  /// Sweep expired job records, checkpoints, failed batches, and progress
  /// snapshots. Returns how many records were removed.
  pub async fn cleanup_expired(&self) -> Result<usize, IngestError> {
    let ctx = &self.inner.ctx;
    let mut cleaned = ctx.jobs.cleanup_old(ctx.config.max_age_hours).await?;

    let checkpoint_cutoff = Utc::now() - chrono::Duration::days(7);
    cleaned += ctx.checkpoints.cleanup_old(checkpoint_cutoff).await?;
    cleaned += ctx.progress.cleanup_old(checkpoint_cutoff).await?;
    Ok(cleaned)
  }

  /// Periodic cleanup task; stops when `shutdown` trips.
  pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    let manager = self.clone();
    tokio::spawn(async move {
      let mut timer = tokio::time::interval(interval);
      timer.tick().await; // skip the immediate tick
      loop {
        tokio::select! {
          _ = timer.tick() => {
            match manager.cleanup_expired().await {
              Ok(cleaned) if cleaned > 0 => info!(cleaned, "sweeper removed expired records"),
              Ok(_) => {}
              Err(e) => warn!(error = %e, "sweeper pass failed"),
            }
          }
          _ = shutdown.cancelled() => {
            debug!("sweeper received shutdown signal");
            break;
          }
        }
      }
    })
  }

  /// Cancel all running jobs and wait for their workers to exit.
  pub async fn shutdown(&self) {
    let handles: Vec<(String, JoinHandle<()>)> = {
      let mut running = self.inner.running.lock().await;
      running
        .iter()
        .for_each(|(job_id, job)| {
          info!(%job_id, "cancelling job during shutdown");
          job.cancel.cancel();
        });
      running.drain().map(|(job_id, job)| (job_id, job.handle)).collect()
    };

    for (job_id, handle) in handles {
      if let Err(e) = handle.await {
        warn!(%job_id, error = %e, "worker task join failed during shutdown");
      }
    }
    info!("task manager shutdown complete");
  }
}
