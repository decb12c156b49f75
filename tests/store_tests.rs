/// Spec store tests
///
/// Declarations written through the JSON file store from several threads and
/// read back by a fresh store.
/// Run with: cargo test --test store_tests

use std::sync::Arc;
use std::thread;

use dynaschema::methods::load_method_specs;
use dynaschema::store::JsonFileSpecStore;
use dynaschema::{FieldKind, FieldSpec, MethodSpec, ModelSpec, SpecStore};
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn test_concurrent_writers_lose_nothing() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileSpecStore::new(dir.path().join("specs.json")));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let name = format!("Model{}", i);
                store
                    .save_model(&ModelSpec::new(&name).field(FieldSpec::new("title", FieldKind::Text)))
                    .unwrap();
                store
                    .save_method(&MethodSpec::field_update(&name, "retitle", json!({"field": "title"})))
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let reopened = JsonFileSpecStore::new(store.path());
    assert_eq!(reopened.load_models().unwrap().len(), 6);
    assert_eq!(reopened.load_methods().unwrap().len(), 6);
}

#[test]
fn test_remove_model_cascades_to_methods() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileSpecStore::new(dir.path().join("specs.json"));
    store.save_model(&ModelSpec::new("Invoice")).unwrap();
    store.save_model(&ModelSpec::new("Customer")).unwrap();
    store
        .save_method(&MethodSpec::field_update("Invoice", "close", json!({"field": "status"})))
        .unwrap();
    store
        .save_method(&MethodSpec::custom_func("Customer", "greet", "custom_methods.greet"))
        .unwrap();

    assert!(store.remove_model("Invoice").unwrap());
    assert!(!store.remove_model("Invoice").unwrap());
    let methods = store.load_methods().unwrap();
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].model_name, "Customer");

    assert!(store.remove_method("Customer", "greet").unwrap());
    assert!(store.methods_of("Customer").unwrap().is_empty());
}

#[test]
fn test_saved_specs_read_back_equal() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("specs.json");
    let model = ModelSpec::new("Shipment")
        .table_name("ops_shipment")
        .allow_role("logistics")
        .field(FieldSpec::new("weight", FieldKind::decimal(8, 3)).required())
        .field(FieldSpec::new("status", FieldKind::char(16)).default_value("pending"));
    JsonFileSpecStore::new(&path).save_model(&model).unwrap();

    let loaded = JsonFileSpecStore::new(&path).model("Shipment").unwrap();
    assert_eq!(loaded, Some(model));
}

#[test]
fn test_method_definitions_from_json() {
    let specs = load_method_specs(
        r#"[
            {"model_name": "Order", "method_name": "total", "logic_type": "aggregate",
             "params": {"related": "line_set", "field": "price"}},
            {"model_name": "Order", "method_name": "ship", "logic_type": "field_update",
             "params": {"field": "status", "allow_null": true}}
        ]"#,
    )
    .unwrap();
    assert_eq!(specs.len(), 2);
    assert!(specs.iter().all(|s| s.active));

    let broken = load_method_specs(
        r#"[{"model_name": "Order", "method_name": "x", "logic_type": "aggregate", "params": {}}]"#,
    );
    assert!(broken.is_err());
}
