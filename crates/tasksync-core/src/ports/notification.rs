//! Change notification port (driven/secondary port)
//!
//! After every committed mutation the engine emits an [`EntityChange`] to
//! a one-way sink (presence/broadcast layer). Nothing flows back.
//!
//! ## Design Notes
//!
//! - Notifications are fire-and-forget; a failing notifier is logged by the
//!   caller and never aborts the sync transaction.

use serde::{Deserialize, Serialize};

use crate::domain::{DeviceId, EntityId, EntitySnapshot, Timestamp, UserId};

/// "Entity changed" event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub entity_id: EntityId,
    pub owner_id: UserId,
    pub version: u64,
    pub updated_at: Timestamp,
    pub deleted: bool,
    /// Device whose operation caused the change, if any
    pub device_id: Option<DeviceId>,
}

impl EntityChange {
    pub fn from_snapshot(snapshot: &EntitySnapshot, device_id: Option<DeviceId>) -> Self {
        Self {
            entity_id: snapshot.id,
            owner_id: snapshot.owner_id,
            version: snapshot.version,
            updated_at: snapshot.updated_at,
            deleted: snapshot.deleted,
            device_id,
        }
    }
}

/// Port trait for entity change notifications
#[async_trait::async_trait]
pub trait IChangeNotifier: Send + Sync {
    /// Publishes a change; errors are reported but never retried
    async fn notify(&self, change: &EntityChange) -> anyhow::Result<()>;
}
