//! Loading and layering of configuration documents.

use std::path::Path;

use serde_json::Value;

use crate::error::AssemblyError;

/// Loads a JSON or YAML document (chosen by extension) as a JSON tree.
///
/// The top level must be a mapping.
pub fn load_document(path: &Path) -> Result<Value, AssemblyError> {
    let contents = std::fs::read_to_string(path).map_err(|source| AssemblyError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let value: Value = if is_json {
        serde_json::from_str(&contents).map_err(|e| AssemblyError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&contents).map_err(|e| AssemblyError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    };

    match value {
        Value::Object(_) => Ok(value),
        // An empty YAML file parses as null.
        Value::Null => Ok(Value::Object(Default::default())),
        _ => Err(AssemblyError::NotAMapping {
            path: path.to_path_buf(),
        }),
    }
}

/// Recursively merges `overlay` into `base`.
///
/// Where both sides hold a mapping under the same key the mappings are
/// merged; any other overlay value replaces the base value wholesale.
pub fn merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_mappings_merge() {
        let merged = merge(json!({"x": {"a": 1, "b": 2}}), json!({"x": {"a": 9}}));
        assert_eq!(merged, json!({"x": {"a": 9, "b": 2}}));
    }

    #[test]
    fn test_sequences_are_replaced() {
        let merged = merge(json!({"x": [1, 2]}), json!({"x": [3]}));
        assert_eq!(merged, json!({"x": [3]}));
    }

    #[test]
    fn test_mapping_replaces_scalar_and_new_keys_are_added() {
        let merged = merge(
            json!({"x": 1, "keep": true}),
            json!({"x": {"nested": 1}, "new": "v"}),
        );
        assert_eq!(
            merged,
            json!({"x": {"nested": 1}, "keep": true, "new": "v"})
        );
    }

    #[test]
    fn test_load_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("base.yaml");
        std::fs::write(&yaml, "threads: 4\nbowtie:\n  db: /ref\n").unwrap();
        let json_path = dir.path().join("over.json");
        std::fs::write(&json_path, r#"{"bowtie": {"db": "/other"}}"#).unwrap();

        let merged = merge(
            load_document(&yaml).unwrap(),
            load_document(&json_path).unwrap(),
        );
        assert_eq!(merged, json!({"threads": 4, "bowtie": {"db": "/other"}}));
    }

    #[test]
    fn test_top_level_sequence_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "- 1\n- 2\n").unwrap();
        assert!(matches!(
            load_document(&path),
            Err(AssemblyError::NotAMapping { .. })
        ));
    }
}
