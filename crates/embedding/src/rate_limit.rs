//! Calls-per-minute limiting for hosted embedding providers.
//!
//! The limiter keeps the send times of recent requests and refuses a new one
//! until the oldest falls out of the window. The wrapping provider blocks
//! before each call; one job issues one batched request at a time, so lock
//! contention stays negligible.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{EmbeddingError, EmbeddingMode, EmbeddingProvider};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
  /// Requests admitted per window.
  pub max_requests: usize,
  pub window: Duration,
  /// Give up waiting for a slot after this long.
  pub max_wait: Duration,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self::per_minute(60)
  }
}

impl RateLimitConfig {
  /// The shape hosted embedding APIs document: N calls per minute.
  pub fn per_minute(max_requests: usize) -> Self {
    Self {
      max_requests,
      window: Duration::from_secs(60),
      max_wait: Duration::from_secs(120),
    }
  }

  pub fn new(max_requests: usize, window: Duration) -> Self {
    Self {
      max_requests,
      window,
      max_wait: window * 2,
    }
  }

  pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
    self.max_wait = max_wait;
    self
  }
}

/// Sliding window over request send times. Time is passed in explicitly so
/// the admission logic is deterministic under test.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
  capacity: usize,
  window: Duration,
  sent_at: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
  pub fn new(config: RateLimitConfig) -> Self {
    Self {
      capacity: config.max_requests,
      window: config.window,
      sent_at: VecDeque::with_capacity(config.max_requests + 1),
    }
  }

  fn evict_expired(&mut self, now: Instant) {
    while self.sent_at.front().is_some_and(|&sent| now.duration_since(sent) >= self.window) {
      self.sent_at.pop_front();
    }
  }

  /// Admit a request at `now`, or say how long until the oldest slot frees.
  pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
    self.evict_expired(now);

    if self.sent_at.len() < self.capacity {
      self.sent_at.push_back(now);
      return Ok(());
    }

    let wait = match self.sent_at.front() {
      Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
      None => Duration::ZERO,
    };
    Err(wait.max(Duration::from_millis(1)))
  }

  /// Requests still inside the window.
  pub fn in_window(&mut self, now: Instant) -> usize {
    self.evict_expired(now);
    self.sent_at.len()
  }
}

/// Wraps a provider so every batched call first claims a window slot,
/// sleeping as needed up to `max_wait`.
pub struct RateLimitedProvider<P: EmbeddingProvider> {
  inner: P,
  limiter: Arc<Mutex<SlidingWindowLimiter>>,
  max_wait: Duration,
}

impl<P: EmbeddingProvider> RateLimitedProvider<P> {
  pub fn with_config(provider: P, config: RateLimitConfig) -> Self {
    let max_wait = config.max_wait;
    Self {
      inner: provider,
      limiter: Arc::new(Mutex::new(SlidingWindowLimiter::new(config))),
      max_wait,
    }
  }

  async fn wait_for_slot(&self) -> Result<(), EmbeddingError> {
    let deadline = Instant::now() + self.max_wait;

    loop {
      let admitted = {
        let mut limiter = self.limiter.lock().await;
        limiter.try_acquire(Instant::now())
      };

      let wait = match admitted {
        Ok(()) => return Ok(()),
        Err(wait) => wait,
      };

      if Instant::now() + wait > deadline {
        warn!(max_wait_ms = self.max_wait.as_millis(), "rate limit slot did not free up in time");
        return Err(EmbeddingError::ProviderError(format!(
          "rate limit wait exceeded {:?}",
          self.max_wait
        )));
      }

      debug!(wait_ms = wait.as_millis(), "rate limited, sleeping before next attempt");
      sleep(wait).await;
    }
  }
}

#[async_trait]
impl<P: EmbeddingProvider + Send + Sync> EmbeddingProvider for RateLimitedProvider<P> {
  fn name(&self) -> &str {
    self.inner.name()
  }

  fn model_id(&self) -> &str {
    self.inner.model_id()
  }

  async fn embed_batch(&self, texts: &[&str], mode: EmbeddingMode) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    // one batched call = one slot, regardless of batch size
    self.wait_for_slot().await?;
    self.inner.embed_batch(texts, mode).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn per_minute_shape() {
    let config = RateLimitConfig::per_minute(60);
    assert_eq!(config.max_requests, 60);
    assert_eq!(config.window, Duration::from_secs(60));
  }

  #[test]
  fn admits_up_to_capacity_then_reports_wait() {
    let mut limiter = SlidingWindowLimiter::new(RateLimitConfig::new(3, Duration::from_secs(10)));
    let t0 = Instant::now();

    assert!(limiter.try_acquire(t0).is_ok());
    assert!(limiter.try_acquire(t0 + Duration::from_secs(1)).is_ok());
    assert!(limiter.try_acquire(t0 + Duration::from_secs(2)).is_ok());

    // window full; the oldest slot frees 10s after t0
    let wait = limiter.try_acquire(t0 + Duration::from_secs(3)).unwrap_err();
    assert_eq!(wait, Duration::from_secs(7));
  }

  #[test]
  fn slots_free_as_the_window_slides() {
    let mut limiter = SlidingWindowLimiter::new(RateLimitConfig::new(2, Duration::from_secs(5)));
    let t0 = Instant::now();

    limiter.try_acquire(t0).unwrap();
    limiter.try_acquire(t0 + Duration::from_secs(1)).unwrap();
    assert_eq!(limiter.in_window(t0 + Duration::from_secs(2)), 2);

    // first request expires at t0+5
    assert!(limiter.try_acquire(t0 + Duration::from_secs(5)).is_ok());
    assert_eq!(limiter.in_window(t0 + Duration::from_secs(5)), 2);

    // everything expires eventually
    assert_eq!(limiter.in_window(t0 + Duration::from_secs(60)), 0);
  }

  struct CountingProvider {
    batches: AtomicUsize,
  }

  #[async_trait]
  impl EmbeddingProvider for CountingProvider {
    fn name(&self) -> &str {
      "counting"
    }
    fn model_id(&self) -> &str {
      "counting-model"
    }

    async fn embed_batch(&self, texts: &[&str], _mode: EmbeddingMode) -> Result<Vec<Vec<f32>>, EmbeddingError> {
      self.batches.fetch_add(1, Ordering::SeqCst);
      Ok(texts.iter().map(|_| vec![0.0; 2]).collect())
    }
  }

  fn counting() -> CountingProvider {
    CountingProvider {
      batches: AtomicUsize::new(0),
    }
  }

  #[tokio::test]
  async fn one_slot_per_batched_call() {
    let limited = RateLimitedProvider::with_config(counting(), RateLimitConfig::new(10, Duration::from_secs(1)));

    let vectors = limited.embed_batch(&["a", "b", "c"], EmbeddingMode::Document).await.unwrap();
    assert_eq!(vectors.len(), 3);
    assert_eq!(limited.inner.batches.load(Ordering::SeqCst), 1);
    assert_eq!(limited.limiter.lock().await.in_window(Instant::now()), 1);
  }

  #[tokio::test]
  async fn sleeps_when_window_is_saturated() {
    let config = RateLimitConfig::new(2, Duration::from_millis(80)).with_max_wait(Duration::from_secs(1));
    let limited = RateLimitedProvider::with_config(counting(), config);

    let start = Instant::now();
    for _ in 0..3 {
      limited.embed_batch(&["x"], EmbeddingMode::Document).await.unwrap();
    }

    // the third call had to wait for the window to slide
    assert!(start.elapsed() >= Duration::from_millis(80));
    assert_eq!(limited.inner.batches.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn gives_up_past_max_wait() {
    let config = RateLimitConfig::new(1, Duration::from_secs(30)).with_max_wait(Duration::from_millis(20));
    let limited = RateLimitedProvider::with_config(counting(), config);

    limited.embed_batch(&["x"], EmbeddingMode::Document).await.unwrap();
    let err = limited.embed_batch(&["x"], EmbeddingMode::Document).await.unwrap_err();
    assert!(err.to_string().contains("rate limit"));
    assert_eq!(limited.inner.batches.load(Ordering::SeqCst), 1);
  }
}
