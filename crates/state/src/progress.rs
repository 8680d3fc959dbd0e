//! Per-job progress snapshots with rate-limited persistence.
//!
//! Snapshots are kept in memory and written through to the store at most
//! every `update_interval` seconds, except for phase transitions and forced
//! updates, which always persist. Phase transitions close the previous
//! phase's elapsed time; the history is append-only.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use silt_core::ProcessingPhase;

use crate::keys;
use crate::kv::Kv;
use crate::StateError;

/// Progress through one named phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
  pub phase: ProcessingPhase,
  pub items_processed: u64,
  #[serde(default)]
  pub items_total: Option<u64>,
  pub bytes_processed: u64,
  pub errors_encountered: u64,
  pub started_at: DateTime<Utc>,
  #[serde(default)]
  pub ended_at: Option<DateTime<Utc>>,
}

impl PhaseProgress {
  fn start(phase: ProcessingPhase, items_total: Option<u64>) -> Self {
    Self {
      phase,
      items_processed: 0,
      items_total,
      bytes_processed: 0,
      errors_encountered: 0,
      started_at: Utc::now(),
      ended_at: None,
    }
  }

  pub fn elapsed_secs(&self) -> f64 {
    let end = self.ended_at.unwrap_or_else(Utc::now);
    ((end - self.started_at).num_milliseconds() as f64 / 1000.0).max(0.0)
  }

  pub fn items_per_second(&self) -> f64 {
    let elapsed = self.elapsed_secs();
    if elapsed > 0.0 { self.items_processed as f64 / elapsed } else { 0.0 }
  }
}

/// Counter deltas applied by [`ProgressTracker::update`]. Absent fields are
/// left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressCounters {
  pub items_processed: Option<u64>,
  pub chunks_created: Option<u64>,
  pub embeddings_generated: Option<u64>,
  pub vectors_stored: Option<u64>,
  pub bytes_processed: Option<u64>,
  pub errors_encountered: Option<u64>,
}

/// The full per-job progress record persisted under `progress:{job}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
  pub job_id: String,
  pub tenant_id: String,
  pub items_processed: u64,
  #[serde(default)]
  pub items_expected: Option<u64>,
  pub chunks_created: u64,
  pub embeddings_generated: u64,
  pub vectors_stored: u64,
  pub bytes_processed: u64,
  pub errors_encountered: u64,
  pub current_phase: ProcessingPhase,
  pub phase_history: Vec<PhaseProgress>,
  pub started_at: DateTime<Utc>,
  pub last_update: DateTime<Utc>,
  #[serde(default)]
  pub estimated_completion: Option<DateTime<Utc>>,
  pub avg_rate: f64,
  pub peak_rate: f64,
  #[serde(default)]
  pub embedding_stats: BTreeMap<String, serde_json::Value>,
}

impl ProgressSnapshot {
  fn new(job_id: &str, tenant_id: &str, items_expected: Option<u64>) -> Self {
    let now = Utc::now();
    Self {
      job_id: job_id.to_string(),
      tenant_id: tenant_id.to_string(),
      items_processed: 0,
      items_expected,
      chunks_created: 0,
      embeddings_generated: 0,
      vectors_stored: 0,
      bytes_processed: 0,
      errors_encountered: 0,
      current_phase: ProcessingPhase::Initializing,
      phase_history: vec![PhaseProgress::start(ProcessingPhase::Initializing, items_expected)],
      started_at: now,
      last_update: now,
      estimated_completion: None,
      avg_rate: 0.0,
      peak_rate: 0.0,
      embedding_stats: BTreeMap::new(),
    }
  }

  pub fn elapsed_secs(&self) -> f64 {
    ((Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0).max(0.0)
  }

  pub fn percentage(&self) -> Option<f64> {
    let expected = self.items_expected?;
    if expected == 0 {
      return None;
    }
    Some(((self.items_processed as f64 / expected as f64) * 100.0).min(100.0))
  }

  pub fn eta_secs(&self) -> Option<f64> {
    let expected = self.items_expected?;
    if self.avg_rate <= 0.0 || self.items_processed == 0 {
      return None;
    }
    let remaining = expected.saturating_sub(self.items_processed);
    Some(remaining as f64 / self.avg_rate)
  }

  fn refresh_rates(&mut self) {
    let elapsed = self.elapsed_secs();
    if elapsed > 0.0 && self.items_processed > 0 {
      self.avg_rate = self.items_processed as f64 / elapsed;
      if self.avg_rate > self.peak_rate {
        self.peak_rate = self.avg_rate;
      }
    }
    if let Some(eta) = self.eta_secs() {
      self.estimated_completion = Some(Utc::now() + chrono::Duration::milliseconds((eta * 1000.0) as i64));
    }
  }
}

/// Detailed view served by the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedProgress {
  pub snapshot: ProgressSnapshot,
  pub percentage: Option<f64>,
  pub elapsed_secs: f64,
  pub eta_secs: Option<f64>,
}

/// Tracks progress for active jobs; one instance per process, shared between
/// the task manager and orchestrators.
pub struct ProgressTracker {
  kv: Arc<dyn Kv>,
  update_interval_secs: f64,
  active: Mutex<HashMap<String, ProgressSnapshot>>,
}

impl ProgressTracker {
  pub fn new(kv: Arc<dyn Kv>, update_interval_secs: f64) -> Self {
    Self {
      kv,
      update_interval_secs,
      active: Mutex::new(HashMap::new()),
    }
  }

  fn progress_key(job_id: &str) -> String {
    format!("{}{job_id}", keys::PROGRESS_PREFIX)
  }

  async fn persist(&self, snapshot: &ProgressSnapshot) -> Result<(), StateError> {
    let raw = serde_json::to_string(snapshot)?;
    self
      .kv
      .set_ex(&Self::progress_key(&snapshot.job_id), &raw, keys::PROGRESS_TTL)
      .await
  }

  /// Begin tracking a job. Overwrites any prior snapshot for the id.
  pub async fn start(&self, job_id: &str, tenant_id: &str, items_expected: Option<u64>) -> Result<(), StateError> {
    let snapshot = ProgressSnapshot::new(job_id, tenant_id, items_expected);
    self.persist(&snapshot).await?;
    self.active.lock().await.insert(job_id.to_string(), snapshot);
    info!(job_id, tenant_id, "started progress tracking");
    Ok(())
  }

  async fn with_snapshot<F>(&self, job_id: &str, mutate: F) -> Result<bool, StateError>
  where
    F: FnOnce(&mut ProgressSnapshot) -> bool,
  {
    let mut active = self.active.lock().await;
    let snapshot = match active.get_mut(job_id) {
      Some(snapshot) => snapshot,
      None => {
        // Fall back to the store for readers in other processes
        let Some(raw) = self.kv.get(&Self::progress_key(job_id)).await? else {
          return Ok(false);
        };
        let snapshot: ProgressSnapshot = serde_json::from_str(&raw)?;
        active.entry(job_id.to_string()).or_insert(snapshot)
      }
    };

    let persist = mutate(snapshot);
    if persist {
      snapshot.last_update = Utc::now();
      let snapshot = snapshot.clone();
      drop(active);
      self.persist(&snapshot).await?;
    }
    Ok(true)
  }

  /// Transition to a new phase. Always persisted; closes the prior phase.
  pub async fn update_phase(&self, job_id: &str, phase: ProcessingPhase) -> Result<bool, StateError> {
    let updated = self
      .with_snapshot(job_id, |snapshot| {
        if let Some(current) = snapshot.phase_history.last_mut()
          && current.ended_at.is_none()
        {
          current.ended_at = Some(Utc::now());
        }
        let expected = snapshot.items_expected;
        snapshot.phase_history.push(PhaseProgress::start(phase, expected));
        snapshot.current_phase = phase;
        true
      })
      .await?;

    if updated {
      debug!(job_id, phase = %phase, "entered phase");
    }
    Ok(updated)
  }

  /// Update counters; persisted only when forced or the update interval has
  /// elapsed since the last write.
  pub async fn update(&self, job_id: &str, counters: ProgressCounters, force: bool) -> Result<bool, StateError> {
    let interval = self.update_interval_secs;
    self
      .with_snapshot(job_id, |snapshot| {
        if let Some(v) = counters.items_processed {
          snapshot.items_processed = v;
        }
        if let Some(v) = counters.chunks_created {
          snapshot.chunks_created = v;
        }
        if let Some(v) = counters.embeddings_generated {
          snapshot.embeddings_generated = v;
        }
        if let Some(v) = counters.vectors_stored {
          snapshot.vectors_stored = v;
        }
        if let Some(v) = counters.bytes_processed {
          snapshot.bytes_processed = v;
        }
        if let Some(v) = counters.errors_encountered {
          snapshot.errors_encountered = v;
        }

        if let Some(current) = snapshot.phase_history.last_mut() {
          if let Some(v) = counters.items_processed {
            current.items_processed = v;
          }
          if let Some(v) = counters.bytes_processed {
            current.bytes_processed = v;
          }
          if let Some(v) = counters.errors_encountered {
            current.errors_encountered = v;
          }
        }

        snapshot.refresh_rates();

        let since_last = (Utc::now() - snapshot.last_update).num_milliseconds() as f64 / 1000.0;
        force || since_last >= interval
      })
      .await
  }

  /// Merge embedding batch statistics into the snapshot.
  pub async fn update_embedding_stats(
    &self,
    job_id: &str,
    stats: BTreeMap<String, serde_json::Value>,
  ) -> Result<bool, StateError> {
    self
      .with_snapshot(job_id, |snapshot| {
        snapshot.embedding_stats.extend(stats);
        true
      })
      .await
  }

  pub async fn snapshot(&self, job_id: &str) -> Result<Option<ProgressSnapshot>, StateError> {
    {
      let active = self.active.lock().await;
      if let Some(snapshot) = active.get(job_id) {
        return Ok(Some(snapshot.clone()));
      }
    }
    match self.kv.get(&Self::progress_key(job_id)).await? {
      Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
      None => Ok(None),
    }
  }

  /// Phase history plus derived metrics for the status API.
  pub async fn detailed(&self, job_id: &str) -> Result<Option<DetailedProgress>, StateError> {
    let Some(snapshot) = self.snapshot(job_id).await? else {
      return Ok(None);
    };
    Ok(Some(DetailedProgress {
      percentage: snapshot.percentage(),
      elapsed_secs: snapshot.elapsed_secs(),
      eta_secs: snapshot.eta_secs(),
      snapshot,
    }))
  }

  /// Seal the phase history with a terminal phase and release the in-memory
  /// entry.
  pub async fn finish(&self, job_id: &str, success: bool) -> Result<bool, StateError> {
    let terminal = if success {
      ProcessingPhase::Completed
    } else {
      ProcessingPhase::Error
    };
    let updated = self
      .with_snapshot(job_id, |snapshot| {
        if let Some(current) = snapshot.phase_history.last_mut()
          && current.ended_at.is_none()
        {
          current.ended_at = Some(Utc::now());
        }
        if !snapshot.current_phase.is_terminal() {
          snapshot.current_phase = terminal;
        }
        true
      })
      .await?;

    self.active.lock().await.remove(job_id);
    info!(job_id, success, "finished progress tracking");
    Ok(updated)
  }

  /// Drop persisted snapshots older than the cutoff.
  pub async fn cleanup_old(&self, cutoff: DateTime<Utc>) -> Result<usize, StateError> {
    let mut cleaned = 0usize;
    for key in self.kv.keys(&format!("{}*", keys::PROGRESS_PREFIX)).await? {
      if let Some(raw) = self.kv.get(&key).await? {
        match serde_json::from_str::<ProgressSnapshot>(&raw) {
          Ok(snapshot) if snapshot.started_at < cutoff => {
            if self.kv.del(&key).await? {
              cleaned += 1;
            }
          }
          Ok(_) => {}
          Err(e) => warn!(key = %key, error = %e, "skipping undecodable progress record"),
        }
      }
    }
    Ok(cleaned)
  }
}
