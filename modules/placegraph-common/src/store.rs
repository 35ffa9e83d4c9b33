use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{EntityKey, EntitySnapshot, EntityType, EntityUpdate};

/// Narrow contract over the persistent graph. The merge engine only ever
/// reads a snapshot, commits a resolved batch, and lists known keys for
/// identity resolution; everything else the backing store does is invisible
/// to it.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Current stored state of one entity, or None if the key is unknown.
    async fn get_entity(
        &self,
        entity_type: EntityType,
        key: &EntityKey,
    ) -> Result<Option<EntitySnapshot>, StoreError>;

    /// Commit one resolved batch atomically. Creating the node if absent,
    /// setting each field with its provenance, and adding/removing edges all
    /// happen in a single transaction. Idempotent: re-running an identical
    /// update is a no-op apart from the write itself.
    async fn apply(&self, update: &EntityUpdate) -> Result<(), StoreError>;

    /// All keys currently stored for one entity type.
    async fn known_keys(&self, entity_type: EntityType) -> Result<Vec<EntityKey>, StoreError>;
}
