//! Dot-path access and merging over nested configuration trees.
//!
//! None of these functions fail: a missing segment or a scalar sitting where a
//! table was expected simply reads as "not found".

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// A nested configuration table.
pub type ConfigTree = Map<String, Value>;

/// A flattened view of a tree: dot-path to leaf value.
pub type FlatMap = BTreeMap<String, Value>;

pub const DEFAULT_SEPARATOR: &str = ".";

/// Recursively merges `overlay` into `base`, consuming the overlay.
///
/// Tables present on both sides are merged key by key; every other
/// combination (including arrays) is replaced by the overlay value.
pub fn deep_merge_into(base: &mut ConfigTree, overlay: ConfigTree) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(base_table)), Value::Object(overlay_table)) => {
                deep_merge_into(base_table, overlay_table);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Returns a fresh tree with `overlay` merged over `base`.
///
/// Neither input is touched and the result shares nothing with them.
pub fn deep_merge(base: &ConfigTree, overlay: &ConfigTree) -> ConfigTree {
    let mut merged = base.clone();
    deep_merge_into(&mut merged, overlay.clone());
    merged
}

/// Looks up the value at `path`.
///
/// A present key holding `null` yields `Some(&Value::Null)`, which keeps it
/// distinguishable from an absent key.
pub fn get<'a>(tree: &'a ConfigTree, path: &str, sep: &str) -> Option<&'a Value> {
    let mut parts = path.split(sep);
    let first = parts.next()?;
    let mut current = tree.get(first)?;

    for part in parts {
        current = current.as_object()?.get(part)?;
    }

    Some(current)
}

pub fn has(tree: &ConfigTree, path: &str, sep: &str) -> bool {
    get(tree, path, sep).is_some()
}

/// Sets `value` at `path`, creating intermediate tables as needed.
///
/// Any non-table value found along the way is replaced by an empty table.
pub fn set(tree: &mut ConfigTree, path: &str, sep: &str, value: Value) {
    let parts: Vec<&str> = path.split(sep).collect();
    let (last, parents) = match parts.split_last() {
        Some(split) => split,
        None => return,
    };

    let mut current = tree;
    for part in parents {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(table) => table,
            _ => unreachable!("slot was just made a table"),
        };
    }

    current.insert(last.to_string(), value);
}

/// Removes the value at `path`, returning it if it was there.
pub fn delete(tree: &mut ConfigTree, path: &str, sep: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split(sep).collect();
    let (last, parents) = parts.split_last()?;

    let mut current = tree;
    for part in parents {
        current = current.get_mut(*part)?.as_object_mut()?;
    }

    current.remove(*last)
}

/// Flattens a tree into dot-path keys. Anything that is not a table is a leaf.
pub fn flatten(tree: &ConfigTree, sep: &str) -> FlatMap {
    let mut flat = FlatMap::new();
    flatten_into(tree, sep, None, &mut flat);
    flat
}

fn flatten_into(tree: &ConfigTree, sep: &str, prefix: Option<&str>, out: &mut FlatMap) {
    for (key, value) in tree {
        let path = match prefix {
            Some(prefix) => format!("{prefix}{sep}{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(nested) => flatten_into(nested, sep, Some(path.as_str()), out),
            leaf => {
                out.insert(path, leaf.clone());
            }
        }
    }
}

/// Rebuilds a tree from dot-path keys by repeated [`set`].
pub fn unflatten<I, K>(flat: I, sep: &str) -> ConfigTree
where
    I: IntoIterator<Item = (K, Value)>,
    K: AsRef<str>,
{
    let mut tree = ConfigTree::new();
    for (path, value) in flat {
        set(&mut tree, path.as_ref(), sep, value);
    }
    tree
}

/// Keeps entries whose key is `prefix` itself or lies beneath it.
///
/// With `remove_prefix`, keys beneath the prefix lose the `prefix + sep`
/// part; an exact match keeps its key unchanged.
pub fn filter_by_prefix(flat: &FlatMap, prefix: &str, remove_prefix: bool, sep: &str) -> FlatMap {
    let prefix_with_sep = format!("{prefix}{sep}");

    flat.iter()
        .filter_map(|(key, value)| {
            if let Some(rest) = key.strip_prefix(&prefix_with_sep) {
                let key = if remove_prefix { rest } else { key.as_str() };
                Some((key.to_string(), value.clone()))
            } else if key == prefix {
                Some((key.clone(), value.clone()))
            } else {
                None
            }
        })
        .collect()
}

/// Renders a value for humans: strings verbatim, everything else as JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn tree(value: Value) -> ConfigTree {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn test_merge_nested_tables() {
        let base = tree(json!({"database": {"host": "first", "port": 5432, "ssl": false}}));
        let overlay = tree(json!({"database": {"host": "second", "ssl": true}}));

        let merged = deep_merge(&base, &overlay);

        assert_eq!(
            Value::Object(merged),
            json!({"database": {"host": "second", "port": 5432, "ssl": true}})
        );
    }

    #[test]
    fn test_merge_replaces_mismatched_types() {
        let base = tree(json!({"a": {"b": 1}, "list": [1, 2, 3], "c": 1}));
        let overlay = tree(json!({"a": 5, "list": [4], "c": {"d": 2}}));

        let merged = deep_merge(&base, &overlay);

        assert_eq!(Value::Object(merged), json!({"a": 5, "list": [4], "c": {"d": 2}}));
    }

    #[test]
    fn test_merge_leaves_inputs_untouched() {
        let base = tree(json!({"a": {"b": 1}}));
        let overlay = tree(json!({"a": {"c": {"d": 2}}}));

        let mut merged = deep_merge(&base, &overlay);
        set(&mut merged, "a.c.d", DEFAULT_SEPARATOR, json!(99));

        assert_eq!(Value::Object(base), json!({"a": {"b": 1}}));
        assert_eq!(Value::Object(overlay), json!({"a": {"c": {"d": 2}}}));
    }

    #[test]
    fn test_get_walks_nested_tables() {
        let t = tree(json!({"database": {"host": "localhost", "port": 5432}}));

        assert_eq!(get(&t, "database.host", "."), Some(&json!("localhost")));
        assert_eq!(get(&t, "database.ssl", "."), None);
        assert_eq!(get(&t, "database.host.name", "."), None);
        assert_eq!(get(&t, "database..host", "."), None);
        assert_eq!(get(&t, "", "."), None);
    }

    #[test]
    fn test_get_distinguishes_null_from_missing() {
        let t = tree(json!({"a": null}));

        assert_eq!(get(&t, "a", "."), Some(&Value::Null));
        assert!(has(&t, "a", "."));
        assert!(!has(&t, "b", "."));
    }

    #[test]
    fn test_custom_separator() {
        let t = tree(json!({"a": {"b": {"c": true}}}));
        assert_eq!(get(&t, "a/b/c", "/"), Some(&json!(true)));
        assert_eq!(get(&t, "a.b.c", "/"), None);
    }

    #[test]
    fn test_set_creates_intermediates() {
        let mut t = ConfigTree::new();
        set(&mut t, "database.credentials.user", ".", json!("admin"));
        assert_eq!(Value::Object(t), json!({"database": {"credentials": {"user": "admin"}}}));
    }

    #[test]
    fn test_set_replaces_scalar_intermediate() {
        let mut t = tree(json!({"database": "sqlite://"}));
        set(&mut t, "database.host", ".", json!("localhost"));
        assert_eq!(Value::Object(t), json!({"database": {"host": "localhost"}}));
    }

    #[test]
    fn test_delete() {
        let mut t = tree(json!({"a": {"b": 1, "c": 2}}));

        assert_eq!(delete(&mut t, "a.b", "."), Some(json!(1)));
        assert_eq!(delete(&mut t, "a.missing", "."), None);
        assert_eq!(delete(&mut t, "nope.deeper.still", "."), None);
        assert_eq!(delete(&mut t, "a.c.d", "."), None);
        assert_eq!(Value::Object(t), json!({"a": {"c": 2}}));
    }

    #[test]
    fn test_flatten() {
        let t = tree(json!({
            "database": {"host": "localhost", "credentials": {"user": "admin"}},
            "features": ["a", "b"],
            "empty": {}
        }));

        let flat = flatten(&t, ".");

        assert_eq!(flat.len(), 3);
        assert_eq!(flat["database.host"], json!("localhost"));
        assert_eq!(flat["database.credentials.user"], json!("admin"));
        assert_eq!(flat["features"], json!(["a", "b"]));
    }

    #[test]
    fn test_unflatten() {
        let flat = [("database.host", json!("localhost")), ("database.port", json!(5432))];
        let t = unflatten(flat, ".");
        assert_eq!(Value::Object(t), json!({"database": {"host": "localhost", "port": 5432}}));
    }

    #[test]
    fn test_filter_by_prefix() {
        let t = tree(json!({
            "database": {"host": "h", "port": 1},
            "databases": {"x": 1},
            "app": {"name": "n"}
        }));
        let flat = flatten(&t, ".");

        let kept = filter_by_prefix(&flat, "database", false, ".");
        assert_eq!(kept.keys().collect::<Vec<_>>(), vec!["database.host", "database.port"]);

        let stripped = filter_by_prefix(&flat, "database", true, ".");
        assert_eq!(stripped.keys().collect::<Vec<_>>(), vec!["host", "port"]);
    }

    #[test]
    fn test_filter_by_prefix_exact_key_keeps_name() {
        let mut flat = FlatMap::new();
        flat.insert("debug".into(), json!(true));

        let stripped = filter_by_prefix(&flat, "debug", true, ".");
        assert_eq!(stripped.get("debug"), Some(&json!(true)));
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&json!("plain")), "plain");
        assert_eq!(display_value(&json!(99999)), "99999");
        assert_eq!(display_value(&json!(true)), "true");
        assert_eq!(display_value(&json!([1, 2])), "[1,2]");
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z ]{0,8}".prop_map(Value::from),
            prop::collection::vec(any::<i32>().prop_map(Value::from), 0..3).prop_map(Value::Array),
        ]
    }

    fn nested_tree() -> impl Strategy<Value = ConfigTree> {
        let leaf_table = prop::collection::btree_map("[a-z]{1,4}", leaf(), 1..4);
        leaf_table
            .prop_map(|m| m.into_iter().collect::<ConfigTree>())
            .prop_recursive(3, 24, 4, |inner| {
                prop::collection::btree_map(
                    "[a-z]{1,4}",
                    prop_oneof![leaf(), inner.prop_map(Value::Object)],
                    1..4,
                )
                .prop_map(|m| m.into_iter().collect::<ConfigTree>())
            })
    }

    proptest! {
        #[test]
        fn flatten_then_unflatten_is_identity(t in nested_tree()) {
            let rebuilt = unflatten(flatten(&t, "."), ".");
            prop_assert_eq!(rebuilt, t);
        }
    }
}
