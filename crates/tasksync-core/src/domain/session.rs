//! Sync session and batch run state
//!
//! A [`SyncSession`] exists per (user, device) for the duration of one sync
//! transaction. A batch run exists per user and reports [`BatchProgress`]
//! after every batch.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::newtypes::{DeviceId, Timestamp, UserId};

/// Identity of a syncing client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl SessionKey {
    pub fn new(user_id: UserId, device_id: DeviceId) -> Self {
        Self { user_id, device_id }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// Observable state of a client's sync session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub key: SessionKey,
    pub is_running: bool,
    /// When the last transaction for this client finished
    pub last_sync_time: Option<Timestamp>,
}

/// Lifecycle of a batch run
///
/// `Idle -> Running -> {Completed, Cancelled, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl BatchState {
    /// Returns true once the run can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Cancelled | BatchState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Idle => "idle",
            BatchState::Running => "running",
            BatchState::Completed => "completed",
            BatchState::Cancelled => "cancelled",
            BatchState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a batch run's progress
///
/// `completed_items` counts every attempted item, failures included;
/// `failed_items` is the subset that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub percentage: f64,
    /// Trailing items per second
    #[serde(rename = "speed", skip_serializing_if = "Option::is_none")]
    pub throughput: Option<f64>,
    #[serde(
        rename = "estimatedTime",
        with = "duration_secs",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub estimated_time_remaining: Option<Duration>,
}

impl BatchProgress {
    /// Progress before the first batch runs
    pub fn starting(total_items: usize, total_batches: usize) -> Self {
        Self {
            total_items,
            completed_items: 0,
            failed_items: 0,
            current_batch: 0,
            total_batches,
            percentage: percentage(0, total_items),
            throughput: None,
            estimated_time_remaining: None,
        }
    }

    pub fn remaining_items(&self) -> usize {
        self.total_items.saturating_sub(self.completed_items)
    }

    /// Records a finished batch and recomputes the percentage
    pub fn record_batch(&mut self, batch_index: usize, attempted: usize, failed: usize) {
        self.current_batch = batch_index;
        self.completed_items += attempted;
        self.failed_items += failed;
        self.percentage = percentage(self.completed_items, self.total_items);
    }
}

/// Completion percentage; an empty run is complete
fn percentage(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}

/// Serializes an optional `Duration` as fractional seconds
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_f64(d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        Ok(secs
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_batch_state_terminal() {
        assert!(!BatchState::Idle.is_terminal());
        assert!(!BatchState::Running.is_terminal());
        assert!(BatchState::Completed.is_terminal());
        assert!(BatchState::Cancelled.is_terminal());
        assert!(BatchState::Failed.is_terminal());
    }

    #[test]
    fn test_progress_accumulates() {
        let mut progress = BatchProgress::starting(10, 3);
        assert_eq!(progress.percentage, 0.0);

        progress.record_batch(1, 4, 1);
        progress.record_batch(2, 4, 0);
        assert_eq!(progress.completed_items, 8);
        assert_eq!(progress.failed_items, 1);
        assert_eq!(progress.remaining_items(), 2);
        assert!((progress.percentage - 80.0).abs() < f64::EPSILON);

        progress.record_batch(3, 2, 0);
        assert_eq!(progress.percentage, 100.0);
    }

    #[test]
    fn test_empty_run_is_complete() {
        assert_eq!(BatchProgress::starting(0, 0).percentage, 100.0);
    }

    #[test]
    fn test_progress_wire_names() {
        let mut progress = BatchProgress::starting(4, 2);
        progress.throughput = Some(2.0);
        progress.estimated_time_remaining = Some(Duration::from_millis(1500));

        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["totalItems"], json!(4));
        assert_eq!(value["speed"], json!(2.0));
        assert_eq!(value["estimatedTime"], json!(1.5));

        let back: BatchProgress = serde_json::from_value(value).unwrap();
        assert_eq!(back.estimated_time_remaining, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new(UserId::new(4), DeviceId::new("tablet".to_string()).unwrap());
        assert_eq!(key.to_string(), "4/tablet");
    }
}
