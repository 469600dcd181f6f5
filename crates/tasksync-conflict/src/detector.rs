//! Conflict detection logic
//!
//! Decides whether an operation was written against a baseline that a
//! later commit has already invalidated.
//!
//! A conflict requires both signals:
//! 1. the entity's current value differs from the operation's `old_value`, AND
//! 2. the snapshot's `updated_at` is not older than the operation's server
//!    timestamp (a write was observed at or after the operation was ingested).
//!
//! Operations without a baseline (`old_value` unset, and every CREATE) are
//! always clean. A DELETE additionally conflicts with an existing tombstone.

use serde_json::Value;
use tracing::{debug, info};

use tasksync_core::domain::{ConflictRecord, EntitySnapshot, Operation, OperationType};

/// Result of conflict detection
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    /// Safe to apply
    Clean,
    /// A concurrent write was detected
    Conflict(Box<ConflictRecord>),
}

impl DetectionOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DetectionOutcome::Conflict(_))
    }

    /// Takes the record out of a conflict outcome
    pub fn into_record(self) -> Option<ConflictRecord> {
        match self {
            DetectionOutcome::Clean => None,
            DetectionOutcome::Conflict(record) => Some(*record),
        }
    }
}

/// Detects conflicting operations
///
/// Pure: reads its inputs, performs no I/O and mutates nothing.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Evaluates `op` against the entity's current snapshot
    ///
    /// A missing snapshot is clean; whether the operation can be applied at
    /// all is the resolver's concern.
    pub fn evaluate(op: &Operation, snapshot: Option<&EntitySnapshot>) -> DetectionOutcome {
        let Some(snapshot) = snapshot else {
            return DetectionOutcome::Clean;
        };

        match op.operation_type {
            OperationType::Create => DetectionOutcome::Clean,
            OperationType::Update => Self::evaluate_baseline(op, snapshot),
            OperationType::Delete if snapshot.deleted => {
                info!(
                    sequence_id = %op.sequence_id,
                    entity_id = %op.entity_id,
                    "Conflict detected: entity already deleted"
                );
                DetectionOutcome::Conflict(Box::new(ConflictRecord::new(
                    op,
                    None,
                    snapshot.updated_at,
                )))
            }
            OperationType::Delete => Self::evaluate_baseline(op, snapshot),
        }
    }

    fn evaluate_baseline(op: &Operation, snapshot: &EntitySnapshot) -> DetectionOutcome {
        let Some(old_value) = op.old_value.as_ref() else {
            return DetectionOutcome::Clean;
        };

        let (mismatch, server_value) = match op.field_name.as_deref() {
            Some(field) => {
                let current = snapshot.field(field).cloned().unwrap_or(Value::Null);
                (current != *old_value, current)
            }
            // Whole-record baseline: every field the client saw must still match
            None => match old_value {
                Value::Object(expected) => {
                    let mismatch = expected.iter().any(|(name, value)| {
                        snapshot.field(name).unwrap_or(&Value::Null) != value
                    });
                    (mismatch, snapshot.fields_object())
                }
                _ => return DetectionOutcome::Clean,
            },
        };

        if !mismatch {
            return DetectionOutcome::Clean;
        }

        if snapshot.updated_at < op.server_timestamp {
            debug!(
                sequence_id = %op.sequence_id,
                entity_id = %op.entity_id,
                updated_at = %snapshot.updated_at,
                server_timestamp = %op.server_timestamp,
                "Stale baseline predates operation, no conflict"
            );
            return DetectionOutcome::Clean;
        }

        info!(
            sequence_id = %op.sequence_id,
            entity_id = %op.entity_id,
            field = ?op.field_name,
            "Conflict detected: baseline overwritten by a concurrent write"
        );
        DetectionOutcome::Conflict(Box::new(ConflictRecord::new(
            op,
            Some(server_value),
            snapshot.updated_at,
        )))
    }
}
