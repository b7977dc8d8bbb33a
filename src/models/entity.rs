//! Entity identity and the trait persisted types implement.

use crate::dao::DaoDescriptor;
use crate::models::TableConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::TypeId;
use std::hash::{Hash, Hasher};

/// Runtime identity of a persisted type.
///
/// Equality and hashing use only the [`TypeId`]; the name is carried for
/// diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct EntityType {
    id: TypeId,
    name: &'static str,
}

impl EntityType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EntityType {}

impl Hash for EntityType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// A type that maps onto one database table.
///
/// Field values travel through serde: every column named in
/// [`Entity::table_config`] must be a field of the serialized struct.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table metadata for this entity.
    fn table_config() -> TableConfig;

    /// DAO implementation used when the registry builds a DAO for this type.
    ///
    /// Defaults to [`BaseDao`](crate::dao::BaseDao).
    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::base::<Self>()
    }
}
