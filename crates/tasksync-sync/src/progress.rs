//! Batch progress reporting
//!
//! [`ThroughputWindow`] keeps the last few (instant, completed) samples of a
//! run and derives the trailing speed and remaining-time estimate from them.
//! [`BatchStatus`] is what a status poll returns.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use tasksync_core::domain::BatchProgress;

/// Trailing throughput over the most recent batches
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    samples: VecDeque<(Instant, usize)>,
    capacity: usize,
}

impl ThroughputWindow {
    /// Samples kept after the starting point
    pub const DEFAULT_SAMPLES: usize = 5;

    /// Starts a window at `start` with nothing completed
    pub fn new(start: Instant) -> Self {
        Self::with_capacity(start, Self::DEFAULT_SAMPLES)
    }

    pub fn with_capacity(start: Instant, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut samples = VecDeque::with_capacity(capacity + 1);
        samples.push_back((start, 0));
        Self { samples, capacity }
    }

    /// Records the cumulative completed count at `at`
    pub fn record(&mut self, at: Instant, completed: usize) {
        self.samples.push_back((at, completed));
        while self.samples.len() > self.capacity + 1 {
            self.samples.pop_front();
        }
    }

    /// Items per second across the window; `None` until time has passed
    pub fn throughput(&self) -> Option<f64> {
        let (first_at, first_done) = self.samples.front()?;
        let (last_at, last_done) = self.samples.back()?;
        let elapsed = last_at.saturating_duration_since(*first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(last_done.saturating_sub(*first_done) as f64 / elapsed)
    }

    /// Time left for `remaining` items at the current throughput
    pub fn eta(&self, remaining: usize) -> Option<Duration> {
        let speed = self.throughput()?;
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }
}

/// Coarse status reported by a batch status poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Syncing,
    Completed,
}

/// Batch status poll response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<BatchProgress>,
}

impl BatchStatus {
    pub fn idle() -> Self {
        Self {
            status: RunStatus::Idle,
            progress: None,
        }
    }
}
