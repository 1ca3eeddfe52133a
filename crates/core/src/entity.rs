//! Entity trait: identity + revision across state changes.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::id::EntityId;
use crate::revision::Revision;

/// A durable, revisioned record.
///
/// The serialized form of an entity is its persisted payload. The revision is
/// tracked beside the payload (it is owned by the store), so implementations
/// usually mark their revision field `#[serde(skip)]`.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Stable type name used as the storage discriminator (e.g. `"job"`).
    const ENTITY_TYPE: &'static str;

    /// Returns the entity identifier.
    fn id(&self) -> EntityId;

    /// Revision this instance was read at (`Revision::NEW` if never persisted).
    fn revision(&self) -> Revision;

    fn set_revision(&mut self, revision: Revision);

    fn key(&self) -> EntityKey {
        EntityKey::new(Self::ENTITY_TYPE, self.id())
    }
}

/// Identity-map key: entity type + id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: &'static str,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(entity_type: &'static str, id: EntityId) -> Self {
        Self { entity_type, id }
    }

    pub fn of<E: Entity>(id: EntityId) -> Self {
        Self::new(E::ENTITY_TYPE, id)
    }
}

impl core::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}
