//! Entity store port (driven/secondary port)
//!
//! Task records are owned by the host application. The sync engine only
//! reads [`EntitySnapshot`]s here; writes go through
//! [`IOperationStore::commit`](super::IOperationStore::commit) so an entity
//! change and the status of the operation behind it land together.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific;
//!   callers classify any error as an infrastructure failure.
//! - "Not found" is not an error: lookups return `Option`.

use crate::domain::{EntityId, EntitySnapshot, Timestamp, UserId};

/// Port trait for the entity store
#[async_trait::async_trait]
pub trait IEntityStore: Send + Sync {
    /// Retrieves the current snapshot of an entity, tombstones included
    async fn get_entity(&self, id: EntityId) -> anyhow::Result<Option<EntitySnapshot>>;

    /// Entities owned by `owner` with `updated_at > since`
    ///
    /// Ordered by `updated_at` ascending, ties broken by id, at most `limit`
    /// results. `since = None` returns every owned entity. Tombstones are
    /// included so deletions propagate.
    async fn list_changed_since(
        &self,
        owner: UserId,
        since: Option<Timestamp>,
        limit: usize,
    ) -> anyhow::Result<Vec<EntitySnapshot>>;
}
