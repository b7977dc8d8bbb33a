//! Constructor descriptors for DAO implementations.
//!
//! An entity declares which DAO type serves it and which constructor shapes
//! that type accepts. The registry walks the shapes in a fixed preference
//! order and invokes the first one that fits; whatever the chosen
//! constructor returns as an error is kept as the cause of the resulting
//! [`OrmError::Construction`](crate::error::OrmError::Construction).

use crate::dao::{BaseDao, Dao};
use crate::db::ConnectionSource;
use crate::error::{BoxError, OrmError, OrmResult};
use crate::models::{Entity, EntityType, TableConfig};
use std::sync::Arc;

type SourceFn = dyn Fn(&Arc<dyn ConnectionSource>) -> Result<Arc<dyn Dao>, BoxError> + Send + Sync;
type SourceAndConfigFn = dyn Fn(&Arc<dyn ConnectionSource>, &Arc<TableConfig>) -> Result<Arc<dyn Dao>, BoxError>
    + Send
    + Sync;

/// One accepted parameter shape.
#[derive(Clone)]
pub enum DaoConstructor {
    /// `(connection source)`
    Source(Arc<SourceFn>),
    /// `(connection source, table configuration)`
    SourceAndConfig(Arc<SourceAndConfigFn>),
}

impl std::fmt::Debug for DaoConstructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source(_) => f.write_str("Source"),
            Self::SourceAndConfig(_) => f.write_str("SourceAndConfig"),
        }
    }
}

/// The DAO implementation an entity resolves to.
#[derive(Debug, Clone)]
pub struct DaoDescriptor {
    dao_name: &'static str,
    constructors: Vec<DaoConstructor>,
}

impl DaoDescriptor {
    /// Descriptor for DAO type `D` with no constructors yet.
    ///
    /// A descriptor left without constructors describes a DAO that cannot be
    /// built; creation fails with `MissingConstructor`.
    pub fn new<D: Dao>() -> Self {
        Self {
            dao_name: std::any::type_name::<D>(),
            constructors: Vec::new(),
        }
    }

    /// The default: [`BaseDao<T>`] with both shapes.
    pub fn base<T: Entity>() -> Self {
        Self::new::<BaseDao<T>>()
            .with_source_constructor(BaseDao::<T>::new)
            .with_table_config_constructor(BaseDao::<T>::with_table_config)
    }

    /// Accept `(connection source)`.
    pub fn with_source_constructor<D, E, F>(mut self, constructor: F) -> Self
    where
        D: Dao,
        E: Into<BoxError>,
        F: Fn(&Arc<dyn ConnectionSource>) -> Result<D, E> + Send + Sync + 'static,
    {
        self.constructors
            .push(DaoConstructor::Source(Arc::new(
                move |source: &Arc<dyn ConnectionSource>| -> Result<Arc<dyn Dao>, BoxError> {
                    constructor(source)
                        .map(|dao| Arc::new(dao) as Arc<dyn Dao>)
                        .map_err(Into::into)
                },
            )));
        self
    }

    /// Accept `(connection source, table configuration)`.
    pub fn with_table_config_constructor<D, E, F>(mut self, constructor: F) -> Self
    where
        D: Dao,
        E: Into<BoxError>,
        F: Fn(&Arc<dyn ConnectionSource>, &Arc<TableConfig>) -> Result<D, E>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .push(DaoConstructor::SourceAndConfig(Arc::new(
                move |source: &Arc<dyn ConnectionSource>,
                      config: &Arc<TableConfig>|
                      -> Result<Arc<dyn Dao>, BoxError> {
                    constructor(source, config)
                        .map(|dao| Arc::new(dao) as Arc<dyn Dao>)
                        .map_err(Into::into)
                },
            )));
        self
    }

    pub fn dao_name(&self) -> &'static str {
        self.dao_name
    }

    pub fn constructors(&self) -> &[DaoConstructor] {
        &self.constructors
    }

    fn source_constructor(&self) -> Option<&Arc<SourceFn>> {
        self.constructors.iter().find_map(|c| match c {
            DaoConstructor::Source(f) => Some(f),
            DaoConstructor::SourceAndConfig(_) => None,
        })
    }

    fn config_constructor(&self) -> Option<&Arc<SourceAndConfigFn>> {
        self.constructors.iter().find_map(|c| match c {
            DaoConstructor::SourceAndConfig(f) => Some(f),
            DaoConstructor::Source(_) => None,
        })
    }

    /// Build from an explicit table configuration.
    ///
    /// Prefers the `(source, config)` shape, falling back to `(source)`.
    pub fn construct_with_config(
        &self,
        source: &Arc<dyn ConnectionSource>,
        config: &Arc<TableConfig>,
    ) -> OrmResult<Arc<dyn Dao>> {
        let entity = config.entity();
        let result = if let Some(ctor) = self.config_constructor() {
            ctor(source, config)
        } else if let Some(ctor) = self.source_constructor() {
            ctor(source)
        } else {
            return Err(OrmError::missing_constructor(self.dao_name, entity.name()));
        };
        self.finish(entity, result)
    }

    /// Build from the entity type alone.
    ///
    /// The configuration is always derivable from the entity, so the
    /// `(source, config)` shape is preferred and receives what
    /// `default_config` produces. `(source)` is the fallback.
    pub fn construct_for_type(
        &self,
        source: &Arc<dyn ConnectionSource>,
        entity: EntityType,
        default_config: impl FnOnce() -> TableConfig,
    ) -> OrmResult<Arc<dyn Dao>> {
        let result = if let Some(ctor) = self.config_constructor() {
            ctor(source, &Arc::new(default_config()))
        } else if let Some(ctor) = self.source_constructor() {
            ctor(source)
        } else {
            return Err(OrmError::missing_constructor(self.dao_name, entity.name()));
        };
        self.finish(entity, result)
    }

    fn finish(
        &self,
        entity: EntityType,
        result: Result<Arc<dyn Dao>, BoxError>,
    ) -> OrmResult<Arc<dyn Dao>> {
        let dao = result.map_err(|cause| OrmError::construction(self.dao_name, entity.name(), cause))?;
        if dao.entity_type() != entity {
            return Err(OrmError::invalid_argument(format!(
                "DAO {} serves {}, not {}",
                self.dao_name,
                dao.entity_type(),
                entity
            )));
        }
        Ok(dao)
    }
}
