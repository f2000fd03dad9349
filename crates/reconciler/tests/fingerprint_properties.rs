//! Property-based tests for spec fingerprints using proptest.
//!
//! Properties verified:
//! - Fingerprints do not depend on key insertion order, at any depth
//! - Any change to a value changes the fingerprint
//! - Building an executor descriptor never alters the fingerprinted spec

use bundlectl_reconciler::{ControllerConfig, Parameters, ServiceInstance, fingerprint};
use proptest::prelude::*;
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Test helper: Unwrap a Result or panic with context
fn unwrap_result<T, E: std::fmt::Display>(result: std::result::Result<T, E>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{context}: {e}"),
    }
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z0-9 ]{0,12}".prop_map(Value::String),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn spec() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::btree_map("[a-z_]{1,8}", value(), 0..6)
        .prop_map(|m| m.into_iter().collect())
}

/// Rebuild every object with its keys inserted in reverse order.
fn reverse_objects(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut reversed = Map::new();
            for (k, v) in map.iter().rev() {
                reversed.insert(k.clone(), reverse_objects(v));
            }
            Value::Object(reversed)
        }
        Value::Array(items) => Value::Array(items.iter().map(reverse_objects).collect()),
        other => other.clone(),
    }
}

proptest! {
    /// Property: the same content yields the same fingerprint no matter how
    /// nested objects were built.
    #[test]
    fn prop_fingerprint_ignores_key_order(entries in spec()) {
        let forward: Parameters = entries.iter().cloned().collect();
        let reversed: Parameters = entries
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), reverse_objects(v)))
            .collect();

        let a = unwrap_result(fingerprint(&forward), "fingerprint should succeed");
        let b = unwrap_result(fingerprint(&reversed), "fingerprint should succeed");
        prop_assert_eq!(a, b);
    }

    /// Property: adding a key that was not present changes the fingerprint.
    #[test]
    fn prop_new_key_changes_fingerprint(entries in spec(), extra in value()) {
        let before: Parameters = entries.into_iter().collect();
        let mut after = before.clone();
        after.insert("zz_added_key".to_string(), extra);

        let a = unwrap_result(fingerprint(&before), "fingerprint should succeed");
        let b = unwrap_result(fingerprint(&after), "fingerprint should succeed");
        prop_assert_ne!(a, b);
    }

    /// Property: changing a scalar value changes the fingerprint.
    #[test]
    fn prop_changed_value_changes_fingerprint(n in any::<i64>()) {
        let mut before = Parameters::new();
        before.insert("replicas".to_string(), json!(n));
        let mut after = Parameters::new();
        after.insert("replicas".to_string(), json!(n.wrapping_add(1)));

        let a = unwrap_result(fingerprint(&before), "fingerprint should succeed");
        let b = unwrap_result(fingerprint(&after), "fingerprint should succeed");
        prop_assert_ne!(a, b);
    }

    /// Property: the plan key injected into descriptors never leaks back
    /// into the spec the fingerprint was taken from.
    #[test]
    fn prop_descriptor_leaves_spec_untouched(entries in spec()) {
        let params: Parameters = entries.into_iter().collect();
        let before = unwrap_result(fingerprint(&params), "fingerprint should succeed");

        let instance = ServiceInstance::for_spec(Uuid::new_v4(), &ControllerConfig::default(), &params);
        prop_assert!(instance.parameters.len() >= params.len());

        let after = unwrap_result(fingerprint(&params), "fingerprint should succeed");
        prop_assert_eq!(before, after);
    }
}
