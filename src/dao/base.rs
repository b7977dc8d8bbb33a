//! The DAO trait and its default implementation.

use crate::db::{ConnectionSource, DatabaseConnection};
use crate::error::{OrmError, OrmResult};
use crate::models::{Entity, EntityType, FieldConfig, SqlValue, TableConfig};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Type-erasure helpers implemented for every `Send + Sync + 'static` type.
pub trait AsAnyArc {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn as_any(&self) -> &dyn Any;

    fn concrete_type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn concrete_type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A data-access object bound to one entity type and one connection source.
pub trait Dao: AsAnyArc + Send + Sync + 'static {
    /// The entity this DAO persists.
    fn entity_type(&self) -> EntityType;

    fn connection_source(&self) -> &Arc<dyn ConnectionSource>;

    /// The table configuration this DAO was built from, if any.
    ///
    /// A DAO built through its `(source)` constructor returns `None`.
    fn table_config(&self) -> Option<&Arc<TableConfig>>;
}

impl dyn Dao {
    /// Downcast to the concrete DAO type, handing the original back on mismatch.
    pub fn downcast<D: Dao>(self: Arc<Self>) -> Result<Arc<D>, Arc<dyn Dao>> {
        let original = Arc::clone(&self);
        self.into_any_arc().downcast::<D>().map_err(|_| original)
    }

    pub fn is<D: Dao>(&self) -> bool {
        self.as_any().is::<D>()
    }
}

impl std::fmt::Debug for dyn Dao {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dao")
            .field("type", &self.concrete_type_name())
            .field("entity", &self.entity_type())
            .finish_non_exhaustive()
    }
}

/// Default DAO for any [`Entity`].
///
/// Every operation borrows a connection from the source and hands it back
/// afterwards, so inside a transaction the pinned connection is reused.
pub struct BaseDao<T> {
    source: Arc<dyn ConnectionSource>,
    table: Arc<TableConfig>,
    explicit_config: Option<Arc<TableConfig>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> BaseDao<T> {
    /// Build from the entity's own table metadata.
    pub fn new(source: &Arc<dyn ConnectionSource>) -> OrmResult<Self> {
        let table = Arc::new(T::table_config());
        Self::check_config(&table)?;
        Ok(Self {
            source: Arc::clone(source),
            table,
            explicit_config: None,
            _entity: PhantomData,
        })
    }

    /// Build from an explicit table configuration.
    pub fn with_table_config(
        source: &Arc<dyn ConnectionSource>,
        config: &Arc<TableConfig>,
    ) -> OrmResult<Self> {
        Self::check_config(config)?;
        Ok(Self {
            source: Arc::clone(source),
            table: Arc::clone(config),
            explicit_config: Some(Arc::clone(config)),
            _entity: PhantomData,
        })
    }

    fn check_config(config: &TableConfig) -> OrmResult<()> {
        if !config.entity().is::<T>() {
            return Err(OrmError::invalid_argument(format!(
                "Table config for {} cannot build a DAO for {}",
                config.entity(),
                EntityType::of::<T>()
            )));
        }
        config.validate()
    }

    /// Table metadata in effect for this DAO.
    pub fn table_info(&self) -> &TableConfig {
        &self.table
    }

    /// Insert one row.
    pub fn create(&self, entity: &T) -> OrmResult<u64> {
        let values = self.column_values(entity)?;
        let db = self.source.database_type();
        let columns: Vec<String> = values
            .iter()
            .map(|(field, _)| db.escape_identifier(&field.column_name))
            .collect();
        let placeholders: Vec<String> = (0..values.len()).map(|i| db.placeholder(i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            db.escape_identifier(self.table.table_name()),
            columns.join(", "),
            placeholders.join(", ")
        );
        let args: Vec<SqlValue> = values.into_iter().map(|(_, v)| v).collect();
        self.execute(&sql, &args)
    }

    /// Update every non-id column of the row with the entity's id.
    pub fn update(&self, entity: &T) -> OrmResult<u64> {
        let id_field = self.require_id_field()?;
        let values = self.column_values(entity)?;
        let db = self.source.database_type();

        let mut assignments = Vec::new();
        let mut args = Vec::new();
        let mut id_value = SqlValue::Null;
        for (field, value) in values {
            if field.id {
                id_value = value;
                continue;
            }
            assignments.push(format!(
                "{} = {}",
                db.escape_identifier(&field.column_name),
                db.placeholder(args.len())
            ));
            args.push(value);
        }
        if assignments.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            db.escape_identifier(self.table.table_name()),
            assignments.join(", "),
            db.escape_identifier(&id_field.column_name),
            db.placeholder(args.len())
        );
        args.push(id_value);
        self.execute(&sql, &args)
    }

    /// Delete the row with the entity's id.
    pub fn delete(&self, entity: &T) -> OrmResult<u64> {
        self.require_id_field()?;
        let id = self
            .column_values(entity)?
            .into_iter()
            .find_map(|(field, value)| field.id.then_some(value))
            .unwrap_or(SqlValue::Null);
        self.delete_by_id(id)
    }

    pub fn delete_by_id(&self, id: impl Into<SqlValue>) -> OrmResult<u64> {
        let id_field = self.require_id_field()?;
        let db = self.source.database_type();
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            db.escape_identifier(self.table.table_name()),
            db.escape_identifier(&id_field.column_name),
            db.placeholder(0)
        );
        self.execute(&sql, &[id.into()])
    }

    /// Fetch the row with the given id.
    pub fn query_for_id(&self, id: impl Into<SqlValue>) -> OrmResult<Option<T>> {
        let id_field = self.require_id_field()?;
        let db = self.source.database_type();
        let columns: Vec<String> = self
            .table
            .fields()
            .iter()
            .map(|f| db.escape_identifier(&f.column_name))
            .collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = {}",
            columns.join(", "),
            db.escape_identifier(self.table.table_name()),
            db.escape_identifier(&id_field.column_name),
            db.placeholder(0)
        );
        let args = [id.into()];
        let row = self.with_connection(|conn| conn.query_for_one(&sql, &args))?;
        row.map(|row| serde_json::from_value(JsonValue::Object(row)).map_err(OrmError::from))
            .transpose()
    }

    pub fn id_exists(&self, id: impl Into<SqlValue>) -> OrmResult<bool> {
        let id_field = self.require_id_field()?;
        let db = self.source.database_type();
        let sql = format!(
            "SELECT 1 AS found FROM {} WHERE {} = {}",
            db.escape_identifier(self.table.table_name()),
            db.escape_identifier(&id_field.column_name),
            db.placeholder(0)
        );
        let args = [id.into()];
        Ok(self
            .with_connection(|conn| conn.query_for_one(&sql, &args))?
            .is_some())
    }

    /// Number of rows in the table.
    pub fn count_of(&self) -> OrmResult<i64> {
        let db = self.source.database_type();
        let sql = format!(
            "SELECT COUNT(*) AS row_count FROM {}",
            db.escape_identifier(self.table.table_name())
        );
        let row = self.with_connection(|conn| conn.query_for_one(&sql, &[]))?;
        row.and_then(|r| r.get("row_count").and_then(JsonValue::as_i64))
            .ok_or_else(|| OrmError::mapping("COUNT(*) returned no integer"))
    }

    /// Run a statement that is not derived from the table metadata.
    pub fn execute_raw(&self, sql: &str, args: &[SqlValue]) -> OrmResult<u64> {
        self.execute(sql, args)
    }

    fn execute(&self, sql: &str, args: &[SqlValue]) -> OrmResult<u64> {
        let rows = self.with_connection(|conn| conn.execute(sql, args))?;
        debug!(
            entity = %EntityType::of::<T>(),
            sql = %sql,
            rows_affected = rows,
            "Executed statement"
        );
        Ok(rows)
    }

    fn require_id_field(&self) -> OrmResult<&FieldConfig> {
        self.table.id_field_config().ok_or_else(|| {
            OrmError::invalid_argument(format!(
                "Table '{}' for {} has no id field",
                self.table.table_name(),
                EntityType::of::<T>()
            ))
        })
    }

    /// Serialize the entity and pick out the configured columns, in order.
    fn column_values(&self, entity: &T) -> OrmResult<Vec<(&FieldConfig, SqlValue)>> {
        let JsonValue::Object(mut map) = serde_json::to_value(entity)? else {
            return Err(OrmError::mapping(format!(
                "{} does not serialize to an object",
                EntityType::of::<T>()
            )));
        };
        self.table
            .fields()
            .iter()
            .map(|field| {
                let value = map.remove(&field.column_name).ok_or_else(|| {
                    OrmError::mapping(format!(
                        "{} has no field named '{}'",
                        EntityType::of::<T>(),
                        field.column_name
                    ))
                })?;
                Ok((field, SqlValue::from(value)))
            })
            .collect()
    }

    fn with_connection<R>(
        &self,
        f: impl FnOnce(&dyn DatabaseConnection) -> OrmResult<R>,
    ) -> OrmResult<R> {
        let connection = self.source.get_read_write_connection()?;
        let result = f(connection.as_ref());
        match (result, self.source.release_connection(&connection)) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(release_err)) => Err(release_err),
            (Err(err), Err(release_err)) => {
                warn!(error = %release_err, "Failed to release connection after error");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }
}

impl<T: Entity> Dao for BaseDao<T> {
    fn entity_type(&self) -> EntityType {
        EntityType::of::<T>()
    }

    fn connection_source(&self) -> &Arc<dyn ConnectionSource> {
        &self.source
    }

    fn table_config(&self) -> Option<&Arc<TableConfig>> {
        self.explicit_config.as_ref()
    }
}
