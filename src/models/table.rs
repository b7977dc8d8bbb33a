//! Table configuration consumed by DAOs and the registry.

use crate::dao::DaoDescriptor;
use crate::error::{OrmError, OrmResult};
use crate::models::{Entity, EntityType};
use std::collections::HashSet;

/// One persisted column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldConfig {
    pub column_name: String,
    /// Identifies rows for `query_for_id`, `update` and `delete`.
    pub id: bool,
}

impl FieldConfig {
    pub fn new(column_name: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            id: false,
        }
    }

    pub fn id(column_name: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            id: true,
        }
    }
}

/// Table metadata for one entity type.
///
/// Registry entries keyed by a configuration use the identity of the
/// `Arc<TableConfig>` holding it, not its contents.
#[derive(Debug, Clone)]
pub struct TableConfig {
    entity: EntityType,
    table_name: String,
    fields: Vec<FieldConfig>,
    dao_descriptor: fn() -> DaoDescriptor,
}

impl TableConfig {
    /// Start a configuration for `T` stored in `table_name`.
    pub fn for_entity<T: Entity>(table_name: impl Into<String>) -> Self {
        Self {
            entity: EntityType::of::<T>(),
            table_name: table_name.into(),
            fields: Vec::new(),
            dao_descriptor: T::dao_descriptor,
        }
    }

    pub fn field(mut self, column_name: impl Into<String>) -> Self {
        self.fields.push(FieldConfig::new(column_name));
        self
    }

    pub fn id_field(mut self, column_name: impl Into<String>) -> Self {
        self.fields.push(FieldConfig::id(column_name));
        self
    }

    pub fn with_fields(mut self, fields: impl IntoIterator<Item = FieldConfig>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn fields(&self) -> &[FieldConfig] {
        &self.fields
    }

    /// The id column, if the entity declares one.
    pub fn id_field_config(&self) -> Option<&FieldConfig> {
        self.fields.iter().find(|f| f.id)
    }

    /// Resolve the DAO implementation declared for the entity.
    pub fn dao_descriptor(&self) -> DaoDescriptor {
        (self.dao_descriptor)()
    }

    /// Check the table name and column list.
    pub fn validate(&self) -> OrmResult<()> {
        if self.table_name.trim().is_empty() {
            return Err(OrmError::invalid_argument(format!(
                "Table name for {} cannot be empty",
                self.entity
            )));
        }
        if self.fields.is_empty() {
            return Err(OrmError::invalid_argument(format!(
                "Table '{}' declares no fields",
                self.table_name
            )));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.column_name.as_str()) {
                return Err(OrmError::invalid_argument(format!(
                    "Column '{}' declared twice in table '{}'",
                    field.column_name, self.table_name
                )));
            }
        }
        if self.fields.iter().filter(|f| f.id).count() > 1 {
            return Err(OrmError::invalid_argument(format!(
                "Table '{}' declares more than one id field",
                self.table_name
            )));
        }
        Ok(())
    }
}
