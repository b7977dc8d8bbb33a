//! DAO cache keyed by connection source and table identity.
//!
//! # Design Decisions
//!
//! - **Identity keys**: a connection source is keyed by the address of its
//!   `Arc`, held as a `Weak` so the address cannot be reused while the key
//!   exists; a table configuration is keyed by the address of its `Arc`.
//!   Type-keyed and configuration-keyed entries never collide.
//! - **Single-flight construction**: the first creator of a key marks it in
//!   flight and builds; racing creators wait on a condition variable and
//!   observe its instance. The registry lock is never held while a
//!   constructor runs.
//! - **Cycle detection**: waiters record which key they wait for. A creator
//!   whose wait would close a cycle (its own thread already builds the key,
//!   or the owner is transitively waiting on it) fails with `IllegalState`
//!   instead of blocking.
//! - **Non-owning source index**: each source maps to the keys registered
//!   under it. It is only read for targeted invalidation.
//!
//! Races between `clear_cache` and in-flight construction resolve as
//! last-writer-wins.

use crate::dao::Dao;
use crate::db::ConnectionSource;
use crate::error::{OrmError, OrmResult};
use crate::models::{Entity, EntityType, TableConfig};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, info, warn};

#[derive(Clone)]
struct SourceKey {
    addr: usize,
    source: Weak<dyn ConnectionSource>,
}

impl SourceKey {
    fn new(source: &Arc<dyn ConnectionSource>) -> Self {
        Self {
            addr: Arc::as_ptr(source) as *const () as usize,
            source: Arc::downgrade(source),
        }
    }
}

impl PartialEq for SourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl Eq for SourceKey {}

impl Hash for SourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
    }
}

#[derive(Clone)]
enum TableKey {
    Type(EntityType),
    Config(Arc<TableConfig>),
}

impl PartialEq for TableKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Type(a), Self::Type(b)) => a == b,
            (Self::Config(a), Self::Config(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for TableKey {}

impl Hash for TableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Type(entity) => entity.hash(state),
            Self::Config(config) => (Arc::as_ptr(config) as usize).hash(state),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(entity) => write!(f, "{}", entity),
            Self::Config(config) => write!(f, "{} (table {})", config.entity(), config.table_name()),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct RegistryKey {
    source: SourceKey,
    table: TableKey,
}

impl RegistryKey {
    fn for_type(source: &Arc<dyn ConnectionSource>, entity: EntityType) -> Self {
        Self {
            source: SourceKey::new(source),
            table: TableKey::Type(entity),
        }
    }

    fn for_config(source: &Arc<dyn ConnectionSource>, config: &Arc<TableConfig>) -> Self {
        Self {
            source: SourceKey::new(source),
            table: TableKey::Config(Arc::clone(config)),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    daos: HashMap<RegistryKey, Arc<dyn Dao>>,
    by_source: HashMap<SourceKey, HashSet<TableKey>>,
    /// Keys under construction and the thread building each
    pending: HashMap<RegistryKey, ThreadId>,
    /// Threads blocked on someone else's construction
    waiting: HashMap<ThreadId, RegistryKey>,
    table_configs: HashMap<EntityType, Arc<TableConfig>>,
}

impl RegistryState {
    /// Whether `thread` waiting for `key` would wait on itself.
    fn would_deadlock(&self, key: &RegistryKey, thread: ThreadId) -> bool {
        let mut current = key;
        while let Some(owner) = self.pending.get(current) {
            if *owner == thread {
                return true;
            }
            match self.waiting.get(owner) {
                Some(next) => current = next,
                None => return false,
            }
        }
        false
    }

    /// Insert or overwrite.
    fn put(&mut self, key: RegistryKey, dao: Arc<dyn Dao>) {
        self.by_source
            .entry(key.source.clone())
            .or_default()
            .insert(key.table.clone());
        self.daos.insert(key, dao);
    }

    /// Insert unless present, returning whichever instance is stored.
    fn get_or_put(&mut self, key: RegistryKey, dao: Arc<dyn Dao>) -> Arc<dyn Dao> {
        if let Some(existing) = self.daos.get(&key) {
            return Arc::clone(existing);
        }
        self.put(key, Arc::clone(&dao));
        dao
    }

    fn remove(&mut self, key: &RegistryKey) -> Option<Arc<dyn Dao>> {
        if let Some(tables) = self.by_source.get_mut(&key.source) {
            tables.remove(&key.table);
            if tables.is_empty() {
                self.by_source.remove(&key.source);
            }
        }
        self.daos.remove(key)
    }

    fn remove_source(&mut self, source: &SourceKey) -> usize {
        let Some(tables) = self.by_source.remove(source) else {
            return 0;
        };
        tables
            .into_iter()
            .filter_map(|table| {
                self.daos.remove(&RegistryKey {
                    source: source.clone(),
                    table,
                })
            })
            .count()
    }
}

/// Cache of constructed DAOs.
///
/// One instance is shared by the whole process through
/// [`DaoRegistry::global`]; [`DaoRegistry::new`] builds an independent one
/// for code that passes its registry around explicitly.
#[derive(Default)]
pub struct DaoRegistry {
    state: Mutex<RegistryState>,
    /// Signalled whenever a construction finishes
    built: Condvar,
}

static GLOBAL: LazyLock<DaoRegistry> = LazyLock::new(DaoRegistry::new);

impl std::fmt::Debug for DaoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DaoRegistry")
            .field("daos", &state.daos.len())
            .field("sources", &state.by_source.len())
            .field("table_configs", &state.table_configs.len())
            .finish()
    }
}

impl DaoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry. Empty until first used.
    pub fn global() -> &'static DaoRegistry {
        &GLOBAL
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, key: &RegistryKey) -> Option<Arc<dyn Dao>> {
        self.lock().daos.get(key).cloned()
    }

    /// Number of cached entries. A DAO stored under both its type and its
    /// configuration counts twice.
    pub fn len(&self) -> usize {
        self.lock().daos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().daos.is_empty()
    }

    /// Create the DAO for `T`, or return the cached one.
    ///
    /// If a table configuration was cached for `T` with
    /// [`add_cached_table_configs`](Self::add_cached_table_configs), the DAO
    /// is built from it.
    pub fn create_dao<T: Entity>(&self, source: &Arc<dyn ConnectionSource>) -> OrmResult<Arc<dyn Dao>> {
        let entity = EntityType::of::<T>();
        let key = RegistryKey::for_type(source, entity);
        if let Some(dao) = self.get(&key) {
            return Ok(dao);
        }

        let cached_config = self.lock().table_configs.get(&entity).cloned();
        if let Some(config) = cached_config {
            return self.create_dao_for_config(source, &config);
        }

        self.single_flight(key, || {
            let descriptor = T::dao_descriptor();
            let dao = descriptor.construct_for_type(source, entity, T::table_config)?;
            info!(dao = %descriptor.dao_name(), entity = %entity, "Constructed DAO");
            Ok(dao)
        })
    }

    /// Create the DAO for an explicit table configuration, or return the
    /// cached one.
    ///
    /// Entries are keyed by the identity of `config`, so two equal
    /// configurations in different `Arc`s get different DAOs. A DAO already
    /// cached for the configuration's entity type is reused.
    pub fn create_dao_for_config(
        &self,
        source: &Arc<dyn ConnectionSource>,
        config: &Arc<TableConfig>,
    ) -> OrmResult<Arc<dyn Dao>> {
        let key = RegistryKey::for_config(source, config);
        if let Some(dao) = self.get(&key) {
            return Ok(dao);
        }

        self.single_flight(key, || {
            let entity = config.entity();
            let type_key = RegistryKey::for_type(source, entity);
            if let Some(dao) = self.get(&type_key) {
                return Ok(dao);
            }

            let descriptor = config.dao_descriptor();
            let dao = descriptor.construct_with_config(source, config)?;
            info!(
                dao = %descriptor.dao_name(),
                entity = %entity,
                table = %config.table_name(),
                "Constructed DAO from table config"
            );
            // Later lookups by type find it too
            Ok(self.lock().get_or_put(type_key, dao))
        })
    }

    /// Typed [`create_dao`](Self::create_dao).
    pub fn create_dao_as<T: Entity, D: Dao>(
        &self,
        source: &Arc<dyn ConnectionSource>,
    ) -> OrmResult<Arc<D>> {
        downcast_dao(self.create_dao::<T>(source)?)
    }

    /// The cached DAO for `T`. Never constructs.
    pub fn lookup_dao<T: Entity>(&self, source: &Arc<dyn ConnectionSource>) -> Option<Arc<dyn Dao>> {
        self.get(&RegistryKey::for_type(source, EntityType::of::<T>()))
    }

    /// The cached DAO for `config`. Never constructs.
    pub fn lookup_dao_for_config(
        &self,
        source: &Arc<dyn ConnectionSource>,
        config: &Arc<TableConfig>,
    ) -> Option<Arc<dyn Dao>> {
        self.get(&RegistryKey::for_config(source, config))
    }

    /// Typed [`lookup_dao`](Self::lookup_dao).
    pub fn lookup_dao_as<T: Entity, D: Dao>(
        &self,
        source: &Arc<dyn ConnectionSource>,
    ) -> OrmResult<Option<Arc<D>>> {
        self.lookup_dao::<T>(source).map(downcast_dao).transpose()
    }

    /// Cache `dao` under its entity type, replacing any existing entry.
    ///
    /// A DAO built from an explicit table configuration is also cached under
    /// that configuration.
    pub fn register_dao(&self, source: &Arc<dyn ConnectionSource>, dao: Arc<dyn Dao>) {
        let entity = dao.entity_type();
        let mut state = self.lock();
        if let Some(config) = dao.table_config() {
            state.put(RegistryKey::for_config(source, config), Arc::clone(&dao));
        }
        state.put(RegistryKey::for_type(source, entity), dao);
        debug!(entity = %entity, "Registered DAO");
    }

    /// Cache `dao` under its table configuration only, falling back to its
    /// entity type when it has none.
    pub fn register_dao_with_table_config(&self, source: &Arc<dyn ConnectionSource>, dao: Arc<dyn Dao>) {
        let key = match dao.table_config() {
            Some(config) => RegistryKey::for_config(source, config),
            None => RegistryKey::for_type(source, dao.entity_type()),
        };
        self.lock().put(key, dao);
    }

    /// Remove the entries `dao` would be registered under.
    pub fn unregister_dao(&self, source: &Arc<dyn ConnectionSource>, dao: &Arc<dyn Dao>) {
        let mut state = self.lock();
        if let Some(config) = dao.table_config() {
            state.remove(&RegistryKey::for_config(source, config));
        }
        state.remove(&RegistryKey::for_type(source, dao.entity_type()));
        debug!(entity = %dao.entity_type(), "Unregistered DAO");
    }

    /// Pre-register table configurations by entity type.
    ///
    /// Replaces earlier configurations for the same type.
    pub fn add_cached_table_configs(&self, configs: impl IntoIterator<Item = TableConfig>) -> OrmResult<()> {
        let configs = configs
            .into_iter()
            .map(|config| -> OrmResult<(EntityType, Arc<TableConfig>)> {
                config.validate()?;
                Ok((config.entity(), Arc::new(config)))
            })
            .collect::<OrmResult<Vec<_>>>()?;
        self.lock().table_configs.extend(configs);
        Ok(())
    }

    /// Drop every cached DAO and table configuration.
    pub fn clear_cache(&self) {
        let mut state = self.lock();
        state.daos.clear();
        state.by_source.clear();
        state.table_configs.clear();
        debug!("Cleared DAO registry");
    }

    /// Drop every cached DAO, keeping table configurations.
    pub fn clear_dao_cache(&self) {
        let mut state = self.lock();
        state.daos.clear();
        state.by_source.clear();
    }

    /// Drop every DAO cached for `source`. Returns how many entries went.
    pub fn clear_source(&self, source: &Arc<dyn ConnectionSource>) -> usize {
        self.lock().remove_source(&SourceKey::new(source))
    }

    /// Drop the entries of sources nobody outside the registry still uses.
    ///
    /// A source qualifies when its only owners are cached DAOs that nobody
    /// else holds. Returns how many entries were removed.
    pub fn purge_released_sources(&self) -> usize {
        let mut state = self.lock();
        let released: Vec<SourceKey> = state
            .by_source
            .iter()
            .filter(|(source, tables)| is_released(&state.daos, source, tables))
            .map(|(source, _)| source.clone())
            .collect();
        let removed: usize = released
            .iter()
            .map(|source| state.remove_source(source))
            .sum();
        if removed > 0 {
            debug!(sources = released.len(), entries = removed, "Purged released sources");
        }
        removed
    }

    /// Run `build` once per key at a time, caching what it returns.
    fn single_flight(
        &self,
        key: RegistryKey,
        build: impl FnOnce() -> OrmResult<Arc<dyn Dao>>,
    ) -> OrmResult<Arc<dyn Dao>> {
        let me = thread::current().id();
        let mut state = self.lock();
        loop {
            if let Some(dao) = state.daos.get(&key) {
                return Ok(Arc::clone(dao));
            }
            if !state.pending.contains_key(&key) {
                break;
            }
            if state.would_deadlock(&key, me) {
                warn!(key = %key.table, "Cyclic DAO construction detected");
                return Err(OrmError::illegal_state(format!(
                    "DAO for {} is already being constructed by the calling chain",
                    key.table
                )));
            }
            state.waiting.insert(me, key.clone());
            state = self.built.wait(state).unwrap_or_else(PoisonError::into_inner);
            state.waiting.remove(&me);
        }
        state.pending.insert(key.clone(), me);
        drop(state);

        let _in_flight = InFlight {
            registry: self,
            key: key.clone(),
        };
        build().map(|dao| self.lock().get_or_put(key, dao))
    }
}

/// Clears a pending mark and wakes waiters, also when the constructor panics.
struct InFlight<'a> {
    registry: &'a DaoRegistry,
    key: RegistryKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.registry.lock().pending.remove(&self.key);
        self.registry.built.notify_all();
    }
}

fn is_released(
    daos: &HashMap<RegistryKey, Arc<dyn Dao>>,
    source: &SourceKey,
    tables: &HashSet<TableKey>,
) -> bool {
    // Distinct cached DAOs and how many entries hold each
    let mut held: Vec<(&Arc<dyn Dao>, usize)> = Vec::new();
    for table in tables {
        let key = RegistryKey {
            source: source.clone(),
            table: table.clone(),
        };
        let Some(dao) = daos.get(&key) else {
            continue;
        };
        match held.iter_mut().find(|(d, _)| Arc::ptr_eq(d, dao)) {
            Some((_, count)) => *count += 1,
            None => held.push((dao, 1)),
        }
    }
    let only_registry_holds_daos = held
        .iter()
        .all(|(dao, entries)| Arc::strong_count(dao) == *entries);
    only_registry_holds_daos && source.source.strong_count() <= held.len()
}

fn downcast_dao<D: Dao>(dao: Arc<dyn Dao>) -> OrmResult<Arc<D>> {
    dao.downcast::<D>().map_err(|dao| {
        OrmError::dao_type_mismatch(
            dao.entity_type().name(),
            std::any::type_name::<D>(),
            (*dao).concrete_type_name(),
        )
    })
}
