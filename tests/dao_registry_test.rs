//! DAO registry behavior: identity, keys, construction failures.

mod common;

use common::noop_source;
use ormcore::dao::{BaseDao, Dao, DaoDescriptor, DaoRegistry};
use ormcore::db::ConnectionSource;
use ormcore::error::{OrmError, OrmResult};
use ormcore::models::{Entity, EntityType, TableConfig};
use serde::{Deserialize, Serialize};
use std::error::Error as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, LazyLock};
use std::thread;
use std::time::Duration;

#[derive(Serialize, Deserialize)]
struct Foo {
    id: String,
    val: i64,
}

impl Entity for Foo {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("foo").id_field("id").field("val")
    }
}

/// Entity served by a custom DAO type.
#[derive(Serialize, Deserialize)]
struct Bar {
    id: i64,
}

impl Entity for Bar {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("bar").id_field("id")
    }

    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::new::<BarDao>().with_source_constructor(BarDao::new)
    }
}

struct BarDao {
    inner: BaseDao<Bar>,
}

impl BarDao {
    fn new(source: &Arc<dyn ConnectionSource>) -> OrmResult<Self> {
        Ok(Self {
            inner: BaseDao::new(source)?,
        })
    }

    fn table_name(&self) -> &str {
        self.inner.table_info().table_name()
    }
}

impl Dao for BarDao {
    fn entity_type(&self) -> EntityType {
        self.inner.entity_type()
    }

    fn connection_source(&self) -> &Arc<dyn ConnectionSource> {
        self.inner.connection_source()
    }

    fn table_config(&self) -> Option<&Arc<TableConfig>> {
        self.inner.table_config()
    }
}

/// Entity whose DAO constructor always fails.
#[derive(Serialize, Deserialize)]
struct Baz {
    id: String,
}

impl Entity for Baz {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("baz").id_field("id")
    }

    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::new::<BaseDao<Self>>()
            .with_source_constructor(
                |_: &Arc<dyn ConnectionSource>| -> Result<BaseDao<Self>, std::io::Error> {
                    Err(std::io::Error::other("throw throw throw"))
                },
            )
            .with_table_config_constructor(
                |_: &Arc<dyn ConnectionSource>,
                 _: &Arc<TableConfig>|
                 -> Result<BaseDao<Self>, std::io::Error> {
                    Err(std::io::Error::other("throw throw throw"))
                },
            )
    }
}

/// Entity whose DAO declares no usable constructor.
#[derive(Serialize, Deserialize)]
struct Sealed {
    id: String,
}

impl Entity for Sealed {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("sealed").id_field("id")
    }

    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::new::<BaseDao<Self>>()
    }
}

/// Entity whose DAO only accepts a table configuration.
#[derive(Serialize, Deserialize)]
struct Configured {
    id: String,
}

impl Entity for Configured {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("configured").id_field("id")
    }

    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::new::<BaseDao<Self>>()
            .with_table_config_constructor(BaseDao::<Self>::with_table_config)
    }
}

static BOTH_SOURCE_BUILDS: AtomicUsize = AtomicUsize::new(0);
static BOTH_CONFIG_BUILDS: AtomicUsize = AtomicUsize::new(0);

/// Entity whose DAO accepts both constructor shapes.
#[derive(Serialize, Deserialize)]
struct Both {
    id: String,
}

impl Entity for Both {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("both").id_field("id")
    }

    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::new::<BaseDao<Self>>()
            .with_source_constructor(|source: &Arc<dyn ConnectionSource>| {
                BOTH_SOURCE_BUILDS.fetch_add(1, Ordering::SeqCst);
                BaseDao::<Self>::new(source)
            })
            .with_table_config_constructor(
                |source: &Arc<dyn ConnectionSource>, config: &Arc<TableConfig>| {
                    BOTH_CONFIG_BUILDS.fetch_add(1, Ordering::SeqCst);
                    BaseDao::<Self>::with_table_config(source, config)
                },
            )
    }
}

static RACED_BUILDS: AtomicUsize = AtomicUsize::new(0);

/// Entity with a slow configuration constructor.
#[derive(Serialize, Deserialize)]
struct Raced {
    id: String,
}

impl Entity for Raced {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("raced").id_field("id")
    }

    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::new::<BaseDao<Self>>().with_table_config_constructor(
            |source: &Arc<dyn ConnectionSource>, config: &Arc<TableConfig>| {
                RACED_BUILDS.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                BaseDao::<Self>::with_table_config(source, config)
            },
        )
    }
}

/// Registry shared with constructors that create other DAOs.
static NESTED_REGISTRY: LazyLock<DaoRegistry> = LazyLock::new(DaoRegistry::new);

/// Entity whose DAO constructor asks for its own DAO.
#[derive(Serialize, Deserialize)]
struct SelfRef {
    id: String,
}

impl Entity for SelfRef {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("self_ref").id_field("id")
    }

    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::new::<BaseDao<Self>>().with_source_constructor(
            |source: &Arc<dyn ConnectionSource>| -> OrmResult<BaseDao<Self>> {
                NESTED_REGISTRY.create_dao::<SelfRef>(source)?;
                BaseDao::new(source)
            },
        )
    }
}

/// Both constructors of the Ping/Pong pair wait here on their first run,
/// so each is in flight on its own thread before asking for the other.
static PING_PONG_BARRIER: LazyLock<Barrier> = LazyLock::new(|| Barrier::new(2));
static PING_ENTERED: AtomicBool = AtomicBool::new(false);
static PONG_ENTERED: AtomicBool = AtomicBool::new(false);

#[derive(Serialize, Deserialize)]
struct Ping {
    id: String,
}

impl Entity for Ping {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("ping").id_field("id")
    }

    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::new::<BaseDao<Self>>().with_source_constructor(
            |source: &Arc<dyn ConnectionSource>| -> OrmResult<BaseDao<Self>> {
                if !PING_ENTERED.swap(true, Ordering::SeqCst) {
                    PING_PONG_BARRIER.wait();
                }
                NESTED_REGISTRY.create_dao::<Pong>(source)?;
                BaseDao::new(source)
            },
        )
    }
}

#[derive(Serialize, Deserialize)]
struct Pong {
    id: String,
}

impl Entity for Pong {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("pong").id_field("id")
    }

    fn dao_descriptor() -> DaoDescriptor {
        DaoDescriptor::new::<BaseDao<Self>>().with_source_constructor(
            |source: &Arc<dyn ConnectionSource>| -> OrmResult<BaseDao<Self>> {
                if !PONG_ENTERED.swap(true, Ordering::SeqCst) {
                    PING_PONG_BARRIER.wait();
                }
                NESTED_REGISTRY.create_dao::<Ping>(source)?;
                BaseDao::new(source)
            },
        )
    }
}

/// True if any error in the chain is an `IllegalState`.
fn caused_by_illegal_state(err: &OrmError) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if matches!(
            e.downcast_ref::<OrmError>(),
            Some(OrmError::IllegalState { .. })
        ) {
            return true;
        }
        current = e.source();
    }
    false
}

/// Only used against the global registry.
#[derive(Serialize, Deserialize)]
struct GlobalOnly {
    id: String,
}

impl Entity for GlobalOnly {
    fn table_config() -> TableConfig {
        TableConfig::for_entity::<Self>("global_only").id_field("id")
    }
}

fn setup() -> (DaoRegistry, Arc<dyn ConnectionSource>) {
    common::init_tracing();
    (DaoRegistry::new(), noop_source())
}

#[test]
fn test_create_dao_returns_same_instance() {
    let (registry, source) = setup();
    assert!(registry.lookup_dao::<Foo>(&source).is_none());

    let dao1 = registry.create_dao::<Foo>(&source).unwrap();
    let dao2 = registry.create_dao::<Foo>(&source).unwrap();
    assert!(Arc::ptr_eq(&dao1, &dao2));
    assert!(dao1.entity_type().is::<Foo>());
    assert!(dao1.is::<BaseDao<Foo>>());
    assert!(Arc::ptr_eq(&registry.lookup_dao::<Foo>(&source).unwrap(), &dao1));
}

#[test]
fn test_distinct_sources_get_distinct_daos() {
    let (registry, source_a) = setup();
    let source_b = noop_source();

    let dao_a = registry.create_dao::<Foo>(&source_a).unwrap();
    let dao_b = registry.create_dao::<Foo>(&source_b).unwrap();
    assert!(!Arc::ptr_eq(&dao_a, &dao_b));
    assert!(Arc::ptr_eq(dao_a.connection_source(), &source_a));
    assert!(Arc::ptr_eq(dao_b.connection_source(), &source_b));
}

#[test]
fn test_clear_cache_builds_new_instance() {
    let (registry, source) = setup();
    let before = registry.create_dao::<Foo>(&source).unwrap();

    registry.clear_cache();
    assert!(registry.lookup_dao::<Foo>(&source).is_none());
    registry.clear_cache();

    let after = registry.create_dao::<Foo>(&source).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
}

#[test]
fn test_config_and_type_paths_share_instance() {
    let (registry, source) = setup();
    let config = Arc::new(Foo::table_config());

    let by_config = registry.create_dao_for_config(&source, &config).unwrap();
    let again = registry.create_dao_for_config(&source, &config).unwrap();
    assert!(Arc::ptr_eq(&by_config, &again));
    assert!(Arc::ptr_eq(by_config.table_config().unwrap(), &config));

    let by_type = registry.create_dao::<Foo>(&source).unwrap();
    assert!(Arc::ptr_eq(&by_config, &by_type));
    assert!(Arc::ptr_eq(
        &registry.lookup_dao_for_config(&source, &config).unwrap(),
        &by_config
    ));
}

#[test]
fn test_type_dao_is_reused_for_config() {
    let (registry, source) = setup();
    let by_type = registry.create_dao::<Foo>(&source).unwrap();

    let config = Arc::new(Foo::table_config());
    let by_config = registry.create_dao_for_config(&source, &config).unwrap();
    assert!(Arc::ptr_eq(&by_type, &by_config));
    assert!(registry.lookup_dao_for_config(&source, &config).is_some());
}

#[test]
fn test_equal_configs_are_distinct_keys() {
    let (registry, source) = setup();
    let first = Arc::new(Foo::table_config());
    let second = Arc::new(Foo::table_config());

    registry.create_dao_for_config(&source, &first).unwrap();
    assert!(registry.lookup_dao_for_config(&source, &second).is_none());
}

#[test]
fn test_register_dao() {
    let (registry, source) = setup();
    let dao: Arc<dyn Dao> = Arc::new(BaseDao::<Foo>::new(&source).unwrap());

    registry.register_dao(&source, Arc::clone(&dao));
    let found = registry.lookup_dao::<Foo>(&source).unwrap();
    assert!(Arc::ptr_eq(&found, &dao));
    assert!(Arc::ptr_eq(&registry.create_dao::<Foo>(&source).unwrap(), &dao));

    // Registering again overwrites
    let replacement: Arc<dyn Dao> = Arc::new(BaseDao::<Foo>::new(&source).unwrap());
    registry.register_dao(&source, Arc::clone(&replacement));
    assert!(Arc::ptr_eq(
        &registry.lookup_dao::<Foo>(&source).unwrap(),
        &replacement
    ));
}

#[test]
fn test_register_dao_built_from_config_registers_both_keys() {
    let (registry, source) = setup();
    let config = Arc::new(Foo::table_config());
    let dao: Arc<dyn Dao> = Arc::new(BaseDao::<Foo>::with_table_config(&source, &config).unwrap());

    registry.register_dao(&source, Arc::clone(&dao));
    assert!(Arc::ptr_eq(&registry.lookup_dao::<Foo>(&source).unwrap(), &dao));
    assert!(Arc::ptr_eq(
        &registry.lookup_dao_for_config(&source, &config).unwrap(),
        &dao
    ));
}

#[test]
fn test_register_dao_with_table_config() {
    let (registry, source) = setup();
    let config = Arc::new(Foo::table_config());
    let dao: Arc<dyn Dao> = Arc::new(BaseDao::<Foo>::with_table_config(&source, &config).unwrap());

    registry.register_dao_with_table_config(&source, Arc::clone(&dao));
    assert!(registry.lookup_dao::<Foo>(&source).is_none());
    assert!(Arc::ptr_eq(
        &registry.create_dao_for_config(&source, &config).unwrap(),
        &dao
    ));
}

#[test]
fn test_unregister_dao() {
    let (registry, source) = setup();
    let dao = registry.create_dao::<Foo>(&source).unwrap();

    registry.unregister_dao(&source, &dao);
    assert!(registry.lookup_dao::<Foo>(&source).is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_custom_dao_type() {
    let (registry, source) = setup();
    let dao = registry.create_dao_as::<Bar, BarDao>(&source).unwrap();
    assert_eq!(dao.table_name(), "bar");

    let erased = registry.lookup_dao::<Bar>(&source).unwrap();
    assert!(erased.is::<BarDao>());
    let typed = registry.lookup_dao_as::<Bar, BarDao>(&source).unwrap().unwrap();
    assert!(Arc::ptr_eq(&typed, &dao));
}

#[test]
fn test_wrong_dao_type_is_reported() {
    let (registry, source) = setup();
    let result = registry.create_dao_as::<Bar, BaseDao<Bar>>(&source);
    match result {
        Err(OrmError::DaoTypeMismatch { actual, .. }) => assert!(actual.contains("BarDao")),
        other => panic!("expected DaoTypeMismatch, got {:?}", other.map(|_| ())),
    }
    // The mismatch does not evict the cached DAO
    assert!(registry.lookup_dao::<Bar>(&source).is_some());
}

#[test]
fn test_failing_constructor_on_type_path() {
    let (registry, source) = setup();
    let err = registry.create_dao::<Baz>(&source).unwrap_err();

    assert!(matches!(err, OrmError::Construction { .. }));
    let cause = err.source().unwrap();
    assert_eq!(cause.to_string(), "throw throw throw");
    assert!(cause.downcast_ref::<std::io::Error>().is_some());
    assert!(registry.lookup_dao::<Baz>(&source).is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_failing_constructor_on_config_path() {
    let (registry, source) = setup();
    let config = Arc::new(Baz::table_config());
    let err = registry.create_dao_for_config(&source, &config).unwrap_err();

    assert!(err.is_construction_failure());
    assert_eq!(err.source().unwrap().to_string(), "throw throw throw");
    assert!(registry.lookup_dao_for_config(&source, &config).is_none());
    assert!(registry.is_empty());
}

#[test]
fn test_dao_without_constructor() {
    let (registry, source) = setup();
    let err = registry.create_dao::<Sealed>(&source).unwrap_err();
    assert!(matches!(err, OrmError::MissingConstructor { .. }));

    let config = Arc::new(Sealed::table_config());
    let err = registry.create_dao_for_config(&source, &config).unwrap_err();
    assert!(err.is_construction_failure());
    assert!(registry.is_empty());
}

#[test]
fn test_config_only_dao_gets_default_config() {
    let (registry, source) = setup();
    let dao = registry.create_dao::<Configured>(&source).unwrap();
    assert_eq!(dao.table_config().unwrap().table_name(), "configured");
}

#[test]
fn test_mismatched_config_is_invalid_argument() {
    let (_, source) = setup();
    let config = Arc::new(Foo::table_config());
    let result = BaseDao::<Bar>::with_table_config(&source, &config);
    assert!(matches!(result, Err(OrmError::InvalidArgument { .. })));
}

#[test]
fn test_cached_table_configs_drive_type_path() {
    let (registry, source) = setup();
    registry
        .add_cached_table_configs([TableConfig::for_entity::<Foo>("foo_archive")
            .id_field("id")
            .field("val")])
        .unwrap();

    let dao = registry.create_dao::<Foo>(&source).unwrap();
    assert_eq!(dao.table_config().unwrap().table_name(), "foo_archive");

    // DAOs go, table configurations stay
    registry.clear_dao_cache();
    let rebuilt = registry.create_dao::<Foo>(&source).unwrap();
    assert!(!Arc::ptr_eq(&dao, &rebuilt));
    assert_eq!(rebuilt.table_config().unwrap().table_name(), "foo_archive");

    registry.clear_cache();
    let plain = registry.create_dao::<Foo>(&source).unwrap();
    assert_eq!(plain.table_config().unwrap().table_name(), "foo");
}

#[test]
fn test_type_path_prefers_table_config_constructor() {
    let (registry, source) = setup();
    let dao = registry.create_dao::<Both>(&source).unwrap();

    assert_eq!(BOTH_CONFIG_BUILDS.load(Ordering::SeqCst), 1);
    assert_eq!(BOTH_SOURCE_BUILDS.load(Ordering::SeqCst), 0);
    assert_eq!(dao.table_config().unwrap().table_name(), "both");
}

#[test]
fn test_racing_config_creators_share_one_instance() {
    let (registry, source) = setup();
    let config = Arc::new(Raced::table_config());
    let barrier = Barrier::new(8);

    let daos: Vec<Arc<dyn Dao>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    registry.create_dao_for_config(&source, &config).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(RACED_BUILDS.load(Ordering::SeqCst), 1);
    assert!(daos.iter().all(|dao| Arc::ptr_eq(dao, &daos[0])));
    assert!(Arc::ptr_eq(
        &registry.lookup_dao::<Raced>(&source).unwrap(),
        &daos[0]
    ));
}

#[test]
fn test_constructor_asking_for_itself_fails() {
    common::init_tracing();
    let source = noop_source();
    let err = NESTED_REGISTRY.create_dao::<SelfRef>(&source).unwrap_err();

    assert!(err.is_construction_failure());
    assert!(caused_by_illegal_state(&err));
    assert!(NESTED_REGISTRY.lookup_dao::<SelfRef>(&source).is_none());
}

#[test]
fn test_cyclic_construction_across_threads_fails_instead_of_hanging() {
    common::init_tracing();
    let source = noop_source();
    let (tx, rx) = mpsc::channel();

    let ping_tx = tx.clone();
    let ping_source = Arc::clone(&source);
    thread::spawn(move || {
        let _ = ping_tx.send(NESTED_REGISTRY.create_dao::<Ping>(&ping_source).map(|_| ()));
    });
    let pong_source = Arc::clone(&source);
    thread::spawn(move || {
        let _ = tx.send(NESTED_REGISTRY.create_dao::<Pong>(&pong_source).map(|_| ()));
    });

    for _ in 0..2 {
        let result = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("cyclic construction blocked");
        let err = result.unwrap_err();
        assert!(caused_by_illegal_state(&err));
    }
    assert!(NESTED_REGISTRY.lookup_dao::<Ping>(&source).is_none());
    assert!(NESTED_REGISTRY.lookup_dao::<Pong>(&source).is_none());
}

#[test]
fn test_global_registry_is_shared() {
    let source = noop_source();
    let dao = DaoRegistry::global().create_dao::<GlobalOnly>(&source).unwrap();
    let again = DaoRegistry::global()
        .lookup_dao::<GlobalOnly>(&source)
        .unwrap();
    assert!(Arc::ptr_eq(&dao, &again));
    assert_eq!(DaoRegistry::global().clear_source(&source), 1);
}
