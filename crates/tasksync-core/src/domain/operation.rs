//! Operation domain entities
//!
//! An operation is a single field-level mutation queued by a disconnected
//! client and replayed against server state during a sync transaction.
//!
//! ## Lifecycle
//!
//! ```text
//! NewOperation ──validate──► OperationDraft ──OperationLog──► Operation (pending)
//!                                                                 │
//!                                  ┌──────────────┬───────────────┤
//!                                  ▼              ▼               ▼
//!                               synced       conflicted ──────► resolved
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::DomainError;
use super::newtypes::{DeviceId, EntityId, OperationId, SequenceId, Timestamp, UserId};

/// Maximum length of a field name
const MAX_FIELD_NAME_LEN: usize = 50;

/// Kind of mutation an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    /// Wire/storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(OperationType::Create),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            other => Err(DomainError::UnknownVariant {
                kind: "operation type",
                value: other.to_string(),
            }),
        }
    }
}

/// Synchronization status of a logged operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Logged but not yet applied
    Pending,
    /// Applied without conflict
    Synced,
    /// Applied, but a concurrent write was detected
    Conflicted,
    /// A conflict was resolved explicitly
    Resolved,
}

impl SyncStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflicted => "conflicted",
            SyncStatus::Resolved => "resolved",
        }
    }

    /// Returns true once the operation's mutation has been committed or discarded
    pub fn is_settled(&self) -> bool {
        !matches!(self, SyncStatus::Pending)
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "conflicted" => Ok(SyncStatus::Conflicted),
            "resolved" => Ok(SyncStatus::Resolved),
            other => Err(DomainError::UnknownVariant {
                kind: "sync status",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// NewOperation - as submitted by a client
// ============================================================================

/// An operation as submitted in a sync request
///
/// `client_timestamp` is untrusted and kept for diagnostics only. When
/// `sequence_id` is absent the server generates one, which makes the
/// operation impossible to deduplicate on resubmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    #[serde(default)]
    pub sequence_id: Option<SequenceId>,
    #[serde(rename = "todoId")]
    pub entity_id: EntityId,
    pub operation_type: OperationType,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default, rename = "timestamp")]
    pub client_timestamp: Option<DateTime<Utc>>,
}

impl NewOperation {
    /// Builds an UPDATE of a single field
    pub fn update(
        entity_id: EntityId,
        field_name: impl Into<String>,
        old_value: Option<Value>,
        new_value: Value,
    ) -> Self {
        Self {
            sequence_id: None,
            entity_id,
            operation_type: OperationType::Update,
            field_name: Some(field_name.into()),
            old_value,
            new_value: Some(new_value),
            device_id: None,
            client_timestamp: None,
        }
    }

    /// Builds a CREATE carrying the initial field map
    pub fn create(entity_id: EntityId, fields: serde_json::Map<String, Value>) -> Self {
        Self {
            sequence_id: None,
            entity_id,
            operation_type: OperationType::Create,
            field_name: None,
            old_value: None,
            new_value: Some(Value::Object(fields)),
            device_id: None,
            client_timestamp: None,
        }
    }

    /// Builds a DELETE
    pub fn delete(entity_id: EntityId) -> Self {
        Self {
            sequence_id: None,
            entity_id,
            operation_type: OperationType::Delete,
            field_name: None,
            old_value: None,
            new_value: None,
            device_id: None,
            client_timestamp: None,
        }
    }

    /// Sets the client-chosen idempotency key
    pub fn with_sequence_id(mut self, sequence_id: SequenceId) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    /// Sets the originating device
    pub fn with_device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Checks the operation is well-formed
    ///
    /// - `UPDATE` needs a field name and a new value
    /// - `CREATE` needs a new value; without a field name it must be an object
    /// - field names are non-empty and at most 50 characters
    pub fn validate(&self) -> Result<(), DomainError> {
        if let Some(field) = &self.field_name {
            if field.trim().is_empty() {
                return Err(DomainError::InvalidOperation(
                    "fieldName must not be empty".to_string(),
                ));
            }
            if field.len() > MAX_FIELD_NAME_LEN {
                return Err(DomainError::InvalidOperation(format!(
                    "fieldName exceeds {MAX_FIELD_NAME_LEN} characters"
                )));
            }
        }

        match self.operation_type {
            OperationType::Update => {
                if self.field_name.is_none() {
                    return Err(DomainError::InvalidOperation(
                        "UPDATE requires fieldName".to_string(),
                    ));
                }
                if self.new_value.is_none() {
                    return Err(DomainError::InvalidOperation(
                        "UPDATE requires newValue".to_string(),
                    ));
                }
            }
            OperationType::Create => match (&self.field_name, &self.new_value) {
                (_, None) => {
                    return Err(DomainError::InvalidOperation(
                        "CREATE requires newValue".to_string(),
                    ));
                }
                (None, Some(value)) if !value.is_object() => {
                    return Err(DomainError::InvalidOperation(
                        "CREATE without fieldName requires an object newValue".to_string(),
                    ));
                }
                _ => {}
            },
            OperationType::Delete => {}
        }

        Ok(())
    }
}

// ============================================================================
// OperationDraft - timestamped, ready to persist
// ============================================================================

/// A validated, server-timestamped operation about to be appended to the log
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    pub sequence_id: SequenceId,
    pub user_id: UserId,
    pub entity_id: EntityId,
    pub operation_type: OperationType,
    pub field_name: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub client_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Timestamp,
    pub logical_counter: u64,
    pub device_id: DeviceId,
}

impl OperationDraft {
    /// Materializes the stored record once the log has assigned an ID
    pub fn into_operation(self, id: OperationId) -> Operation {
        Operation {
            id,
            sequence_id: self.sequence_id,
            user_id: self.user_id,
            entity_id: self.entity_id,
            operation_type: self.operation_type,
            field_name: self.field_name,
            old_value: self.old_value,
            new_value: self.new_value,
            client_timestamp: self.client_timestamp,
            server_timestamp: self.server_timestamp,
            logical_counter: self.logical_counter,
            device_id: self.device_id,
            sync_status: SyncStatus::Pending,
        }
    }
}

// ============================================================================
// Operation - the persisted record
// ============================================================================

/// A persisted operation owned by the operation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    pub sequence_id: SequenceId,
    pub user_id: UserId,
    #[serde(rename = "todoId")]
    pub entity_id: EntityId,
    pub operation_type: OperationType,
    pub field_name: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub client_timestamp: Option<DateTime<Utc>>,
    pub server_timestamp: Timestamp,
    pub logical_counter: u64,
    pub device_id: DeviceId,
    pub sync_status: SyncStatus,
}

impl Operation {
    /// The field map this operation writes when applied
    ///
    /// A named field maps to `new_value`; a CREATE without a field name
    /// contributes every member of its object payload.
    pub fn mutation_fields(&self) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        match (&self.field_name, &self.new_value) {
            (Some(name), value) => {
                fields.insert(name.clone(), value.clone().unwrap_or(Value::Null));
            }
            (None, Some(Value::Object(map))) => {
                fields.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            (None, _) => {}
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_operation_type_roundtrip() {
        for ty in [OperationType::Create, OperationType::Update, OperationType::Delete] {
            assert_eq!(ty.as_str().parse::<OperationType>().unwrap(), ty);
        }
        assert!("PATCH".parse::<OperationType>().is_err());
        assert_eq!(
            serde_json::to_string(&OperationType::Update).unwrap(),
            "\"UPDATE\""
        );
    }

    #[test]
    fn test_sync_status_settled() {
        assert!(!SyncStatus::Pending.is_settled());
        assert!(SyncStatus::Synced.is_settled());
        assert!(SyncStatus::Conflicted.is_settled());
        assert!(SyncStatus::Resolved.is_settled());
        assert_eq!("conflicted".parse::<SyncStatus>().unwrap(), SyncStatus::Conflicted);
    }

    #[test]
    fn test_new_operation_deserializes_wire_format() {
        let op: NewOperation = serde_json::from_value(json!({
            "todoId": 12,
            "operationType": "UPDATE",
            "fieldName": "title",
            "oldValue": "A",
            "newValue": "B",
            "sequenceId": "dev1-0001"
        }))
        .unwrap();

        assert_eq!(op.entity_id, EntityId::new(12));
        assert_eq!(op.operation_type, OperationType::Update);
        assert_eq!(op.field_name.as_deref(), Some("title"));
        assert_eq!(op.old_value, Some(json!("A")));
        assert_eq!(op.sequence_id.unwrap().as_str(), "dev1-0001");
        assert!(op.device_id.is_none());
    }

    #[test]
    fn test_validate_update_requires_field_and_value() {
        let ok = NewOperation::update(EntityId::new(1), "title", None, json!("x"));
        assert!(ok.validate().is_ok());

        let mut missing_field = ok.clone();
        missing_field.field_name = None;
        assert!(missing_field.validate().is_err());

        let mut missing_value = ok.clone();
        missing_value.new_value = None;
        assert!(missing_value.validate().is_err());

        let mut blank_field = ok;
        blank_field.field_name = Some("  ".to_string());
        assert!(blank_field.validate().is_err());
    }

    #[test]
    fn test_validate_create() {
        let mut fields = serde_json::Map::new();
        fields.insert("title".to_string(), json!("Buy milk"));
        assert!(NewOperation::create(EntityId::new(1), fields).validate().is_ok());

        let mut scalar = NewOperation::delete(EntityId::new(1));
        scalar.operation_type = OperationType::Create;
        scalar.new_value = Some(json!("not an object"));
        assert!(scalar.validate().is_err());

        scalar.field_name = Some("title".to_string());
        assert!(scalar.validate().is_ok());
    }

    #[test]
    fn test_validate_delete_is_always_well_formed() {
        assert!(NewOperation::delete(EntityId::new(3)).validate().is_ok());
    }

    fn stored(field_name: Option<&str>, new_value: Option<Value>) -> Operation {
        OperationDraft {
            sequence_id: SequenceId::generate(),
            user_id: UserId::new(1),
            entity_id: EntityId::new(1),
            operation_type: OperationType::Create,
            field_name: field_name.map(str::to_string),
            old_value: None,
            new_value,
            client_timestamp: None,
            server_timestamp: Timestamp::from_micros(10),
            logical_counter: 1,
            device_id: DeviceId::new("d".to_string()).unwrap(),
        }
        .into_operation(OperationId::new(1))
    }

    #[test]
    fn test_mutation_fields() {
        let named = stored(Some("title"), Some(json!("B")));
        assert_eq!(named.sync_status, SyncStatus::Pending);
        assert_eq!(named.mutation_fields().get("title"), Some(&json!("B")));

        let object = stored(None, Some(json!({"title": "A", "completed": false})));
        let fields = object.mutation_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("completed"), Some(&json!(false)));

        assert!(stored(None, None).mutation_fields().is_empty());
    }
}
