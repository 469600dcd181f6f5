//! Conflict domain entities
//!
//! A [`ConflictRecord`] captures a concurrent write that the submitting
//! operation's baseline did not account for. Records are data, not errors:
//! they travel back in the sync response and may be persisted so a person
//! can resolve them later with a [`ConflictResolutionRequest`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::DomainError;
use super::newtypes::{EntityId, OperationId, SequenceId, Timestamp, UserId};
use super::operation::Operation;

/// Details of a detected conflict
///
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    operation_id: OperationId,
    sequence_id: SequenceId,
    user_id: UserId,
    #[serde(rename = "todoId")]
    entity_id: EntityId,
    /// Conflicting field; `None` for whole-record operations such as DELETE
    field: Option<String>,
    /// Value held by the server when the operation was evaluated
    server_value: Option<Value>,
    client_old_value: Option<Value>,
    client_new_value: Option<Value>,
    server_timestamp: Timestamp,
    entity_updated_at: Timestamp,
}

impl ConflictRecord {
    /// Builds a record from the operation and the server's view of the field
    pub fn new(op: &Operation, server_value: Option<Value>, entity_updated_at: Timestamp) -> Self {
        Self {
            operation_id: op.id,
            sequence_id: op.sequence_id.clone(),
            user_id: op.user_id,
            entity_id: op.entity_id,
            field: op.field_name.clone(),
            server_value,
            client_old_value: op.old_value.clone(),
            client_new_value: op.new_value.clone(),
            server_timestamp: op.server_timestamp,
            entity_updated_at,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn sequence_id(&self) -> &SequenceId {
        &self.sequence_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn server_value(&self) -> Option<&Value> {
        self.server_value.as_ref()
    }

    pub fn client_old_value(&self) -> Option<&Value> {
        self.client_old_value.as_ref()
    }

    pub fn client_new_value(&self) -> Option<&Value> {
        self.client_new_value.as_ref()
    }

    pub fn server_timestamp(&self) -> Timestamp {
        self.server_timestamp
    }

    pub fn entity_updated_at(&self) -> Timestamp {
        self.entity_updated_at
    }
}

/// How a person chose to settle a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    /// Keep the operation's new value
    AcceptClient,
    /// Restore the value the server held before the operation
    AcceptServer,
    /// Apply a caller-supplied field map
    Merge,
}

impl ResolutionChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionChoice::AcceptClient => "accept_client",
            ResolutionChoice::AcceptServer => "accept_server",
            ResolutionChoice::Merge => "merge",
        }
    }
}

impl std::fmt::Display for ResolutionChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResolutionChoice {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept_client" => Ok(ResolutionChoice::AcceptClient),
            "accept_server" => Ok(ResolutionChoice::AcceptServer),
            "merge" => Ok(ResolutionChoice::Merge),
            other => Err(DomainError::UnknownVariant {
                kind: "resolution",
                value: other.to_string(),
            }),
        }
    }
}

/// Request to resolve a conflicted operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionRequest {
    pub operation_id: OperationId,
    pub resolution: ResolutionChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_data: Option<BTreeMap<String, Value>>,
}

impl ConflictResolutionRequest {
    pub fn new(operation_id: OperationId, resolution: ResolutionChoice) -> Self {
        Self {
            operation_id,
            resolution,
            merged_data: None,
        }
    }

    pub fn with_merged_data(mut self, merged_data: BTreeMap<String, Value>) -> Self {
        self.merged_data = Some(merged_data);
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::newtypes::DeviceId;
    use crate::domain::operation::{OperationDraft, OperationType};

    fn conflicted_op() -> Operation {
        OperationDraft {
            sequence_id: SequenceId::new("seq-2".to_string()).unwrap(),
            user_id: UserId::new(3),
            entity_id: EntityId::new(8),
            operation_type: OperationType::Update,
            field_name: Some("title".to_string()),
            old_value: Some(json!("A")),
            new_value: Some(json!("C")),
            client_timestamp: None,
            server_timestamp: Timestamp::from_micros(30),
            logical_counter: 2,
            device_id: DeviceId::new("phone".to_string()).unwrap(),
        }
        .into_operation(OperationId::new(77))
    }

    #[test]
    fn test_record_captures_operation_and_server_view() {
        let record = ConflictRecord::new(&conflicted_op(), Some(json!("B")), Timestamp::from_micros(40));

        assert_eq!(record.operation_id(), OperationId::new(77));
        assert_eq!(record.field(), Some("title"));
        assert_eq!(record.server_value(), Some(&json!("B")));
        assert_eq!(record.client_old_value(), Some(&json!("A")));
        assert_eq!(record.client_new_value(), Some(&json!("C")));
        assert_eq!(record.entity_updated_at(), Timestamp::from_micros(40));
    }

    #[test]
    fn test_record_wire_shape() {
        let record = ConflictRecord::new(&conflicted_op(), Some(json!("B")), Timestamp::from_micros(40));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["operationId"], json!(77));
        assert_eq!(value["serverValue"], json!("B"));
        assert_eq!(value["clientNewValue"], json!("C"));
        assert_eq!(value["todoId"], json!(8));
    }

    #[test]
    fn test_resolution_request_deserializes() {
        let request: ConflictResolutionRequest = serde_json::from_value(json!({
            "operationId": 5,
            "resolution": "merge",
            "mergedData": {"title": "A+C"}
        }))
        .unwrap();
        assert_eq!(request.resolution, ResolutionChoice::Merge);
        assert_eq!(request.merged_data.unwrap().get("title"), Some(&json!("A+C")));

        assert_eq!(
            "accept_server".parse::<ResolutionChoice>().unwrap(),
            ResolutionChoice::AcceptServer
        );
        assert!("keep_both".parse::<ResolutionChoice>().is_err());
    }
}
