/// Model registry tests
///
/// Cache identity under concurrent builds, table naming, lazy loading from a
/// spec store and teardown.
/// Run with: cargo test --test registry_tests

use std::sync::{Arc, Barrier};
use std::thread;

use dynaschema::store::JsonFileSpecStore;
use dynaschema::{
    ConnectionConfig, ConnectionPool, ConnectionSource, DbError, FieldKind, FieldSpec,
    ModelRegistry, ModelSpec, SpecStore, SqlConnection,
};

fn file_pool(dir: &tempfile::TempDir) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(ConnectionConfig::new(dir.path().join("registry.db"))).unwrap())
}

fn product() -> ModelSpec {
    ModelSpec::new("Product")
        .field(FieldSpec::new("sku", FieldKind::char(32)).unique())
        .field(FieldSpec::new("price", FieldKind::decimal(10, 2)))
}

#[test]
fn test_concurrent_builds_share_one_handle() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ModelRegistry::new(file_pool(&dir)));
    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.register(&product()).unwrap()
            })
        })
        .collect();

    let built: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for handle in &built[1..] {
        assert!(Arc::ptr_eq(&built[0], handle));
    }
    assert_eq!(registry.list_names(), vec!["Product".to_string()]);
    assert_eq!(built[0].table_name(), "lowcode_product");
}

#[test]
fn test_changed_declaration_replaces_handle() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::new(file_pool(&dir));

    let first = registry.register(&product()).unwrap();
    let same = registry.register(&product()).unwrap();
    assert!(Arc::ptr_eq(&first, &same));

    // label does not take part in the cache key
    let relabeled = ModelSpec::new("Product")
        .field(FieldSpec::new("sku", FieldKind::char(32)).unique().label("SKU"))
        .field(FieldSpec::new("price", FieldKind::decimal(10, 2)));
    assert!(Arc::ptr_eq(&first, &registry.register(&relabeled).unwrap()));

    let wider = product().field(FieldSpec::new("stock", FieldKind::Integer));
    let second = registry.rebuild(&wider).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.table_name(), first.table_name());
    assert!(Arc::ptr_eq(&registry.require("Product").unwrap(), &second));
}

#[test]
fn test_readers_see_a_stable_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let registry = ModelRegistry::new(file_pool(&dir));
    registry.register(&product()).unwrap();

    let snapshot = registry.get_all();
    registry
        .register(&ModelSpec::new("Supplier").field(FieldSpec::new("name", FieldKind::Text)))
        .unwrap();
    assert!(registry.unregister("Product"));

    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.contains_key("Product"));
    assert_eq!(registry.list_names(), vec!["Supplier".to_string()]);
}

#[test]
fn test_reserved_and_malformed_names_register_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir);
    let registry = ModelRegistry::new(pool.clone());

    let reserved = ModelSpec::new("Bad").field(FieldSpec::new("delete", FieldKind::Text));
    assert!(matches!(registry.register(&reserved), Err(DbError::Validation(_))));

    let injected = ModelSpec::new("Evil").table_name("evil; DROP TABLE x");
    assert!(matches!(registry.register(&injected), Err(DbError::Validation(_))));

    assert!(registry.is_empty());
    let mut conn = pool.acquire().unwrap();
    assert!(!conn.table_exists("lowcode_bad").unwrap());
}

#[test]
fn test_lazy_load_from_json_store_and_reset() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileSpecStore::new(dir.path().join("specs.json")));

    // Child saved before its parent: loading must still succeed.
    store
        .save_model(
            &ModelSpec::new("Review")
                .field(FieldSpec::new("product", FieldKind::foreign_key("Product")))
                .field(FieldSpec::new("stars", FieldKind::SmallInteger)),
        )
        .unwrap();
    store.save_model(&product()).unwrap();
    store
        .save_model(&ModelSpec::new("Retired").field(FieldSpec::new("x", FieldKind::Text)).active(false))
        .unwrap();

    let registry = ModelRegistry::new(file_pool(&dir)).with_store(store.clone());
    assert!(!registry.is_loaded());

    assert_eq!(
        registry.list_names(),
        vec!["Product".to_string(), "Review".to_string()]
    );
    assert!(registry.is_loaded());
    let (child, fk) = registry.find_relation("Product", "review_set").unwrap();
    assert_eq!(child.name(), "Review");
    assert_eq!(fk.column_name(), "product_id");
    assert!(registry.verify_tables().unwrap().is_empty());

    registry.reset();
    assert!(!registry.is_loaded());
    // the next read loads again
    assert!(registry.contains("Review"));
}
