//! Entity snapshot domain types
//!
//! The core never owns task records. It reads an [`EntitySnapshot`] through
//! the entity store port and requests changes with an [`EntityMutation`].
//! [`EntitySnapshot::apply_mutation`] is the single definition of how a
//! mutation transforms a snapshot; store adapters call it inside their own
//! transaction so every backend versions and tombstones identically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::DomainError;
use super::newtypes::{EntityId, Timestamp, UserId};

/// Conflict marker carried by an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// No unresolved concurrent write
    #[default]
    Clear,
    /// A conflicting write was committed and awaits review
    Detected,
    /// A detected conflict was resolved explicitly
    Resolved,
}

impl ConflictStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Clear => "clear",
            ConflictStatus::Detected => "detected",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConflictStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clear" => Ok(ConflictStatus::Clear),
            "detected" => Ok(ConflictStatus::Detected),
            "resolved" => Ok(ConflictStatus::Resolved),
            other => Err(DomainError::UnknownVariant {
                kind: "conflict status",
                value: other.to_string(),
            }),
        }
    }
}

/// The sync-relevant view of a task record
///
/// Serialized flat: the record's own fields sit next to the bookkeeping
/// attributes, which is the shape clients receive in `serverUpdates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub owner_id: UserId,
    pub version: u64,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub conflict_status: ConflictStatus,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl EntitySnapshot {
    /// Creates a live snapshot at version 1
    pub fn new(
        id: EntityId,
        owner_id: UserId,
        fields: BTreeMap<String, Value>,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id,
            owner_id,
            version: 1,
            updated_at,
            deleted: false,
            conflict_status: ConflictStatus::Clear,
            fields,
        }
    }

    /// Current value of a field, if set
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// All fields as a JSON object
    pub fn fields_object(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Computes the snapshot that results from applying `mutation`
    ///
    /// Returns `None` when the mutation targets nothing visible to `owner`:
    /// a missing entity (except for CREATE), an entity owned by someone else,
    /// or an UPDATE against a tombstone. Every accepted mutation bumps the
    /// version by exactly one, and `updated_at` never moves backwards: a
    /// stamp not newer than the current one becomes its successor.
    pub fn apply_mutation(
        current: Option<&EntitySnapshot>,
        owner: UserId,
        mutation: &EntityMutation,
    ) -> Option<EntitySnapshot> {
        let Some(current) = current else {
            return match mutation.kind {
                MutationKind::Create => {
                    let mut created = EntitySnapshot::new(
                        mutation.entity_id,
                        owner,
                        mutation.fields.clone(),
                        mutation.updated_at,
                    );
                    if let Some(status) = mutation.conflict_status {
                        created.conflict_status = status;
                    }
                    Some(created)
                }
                MutationKind::Update | MutationKind::Delete => None,
            };
        };

        if current.owner_id != owner {
            return None;
        }

        let mut next = current.clone();
        match mutation.kind {
            MutationKind::Create if current.deleted => {
                next.fields = mutation.fields.clone();
                next.deleted = false;
            }
            MutationKind::Create => {
                next.fields.extend(mutation.fields.clone());
            }
            MutationKind::Update if current.deleted => return None,
            MutationKind::Update => {
                next.fields.extend(mutation.fields.clone());
            }
            MutationKind::Delete => {
                next.deleted = true;
            }
        }

        next.version = current.version + 1;
        next.updated_at = if mutation.updated_at > current.updated_at {
            mutation.updated_at
        } else {
            current.updated_at.successor()
        };
        if let Some(status) = mutation.conflict_status {
            next.conflict_status = status;
        }
        Some(next)
    }
}

/// What an [`EntityMutation`] does to the targeted record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// Insert, revive a tombstone, or merge into a live record
    Create,
    /// Merge fields into a live record
    Update,
    /// Mark the record as a tombstone
    Delete,
}

/// A change the core asks the entity store to commit
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMutation {
    pub entity_id: EntityId,
    pub kind: MutationKind,
    pub fields: BTreeMap<String, Value>,
    pub updated_at: Timestamp,
    /// `None` keeps the stored status
    pub conflict_status: Option<ConflictStatus>,
}

impl EntityMutation {
    pub fn new(entity_id: EntityId, kind: MutationKind, updated_at: Timestamp) -> Self {
        Self {
            entity_id,
            kind,
            fields: BTreeMap::new(),
            updated_at,
            conflict_status: None,
        }
    }

    pub fn with_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_conflict_status(mut self, status: ConflictStatus) -> Self {
        self.conflict_status = Some(status);
        self
    }
}
