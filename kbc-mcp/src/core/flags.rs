//! Conversion of structured tool arguments into `kbc` command-line flags.

use serde_json::{Map, Value};

/// Convert structured arguments into flag tokens, preserving input order.
///
/// - `true` becomes `--name`, `false` emits nothing
/// - arrays repeat `--name value` once per element
/// - other scalars become `--name value`
/// - `null` emits nothing
///
/// Underscores in names are rewritten to hyphens (`dry_run` -> `--dry-run`).
pub fn args_to_flags(args: &Map<String, Value>) -> Vec<String> {
    let mut flags = Vec::new();
    for (key, value) in args {
        let flag = format!("--{}", key.replace('_', "-"));
        match value {
            Value::Bool(true) => flags.push(flag),
            Value::Bool(false) | Value::Null => {}
            Value::Array(items) => {
                for item in items {
                    flags.push(flag.clone());
                    flags.push(scalar_text(item));
                }
            }
            other => {
                flags.push(flag);
                flags.push(scalar_text(other));
            }
        }
    }
    flags
}

/// Render a value as a single argv token; strings are passed through unquoted.
fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flags(value: Value) -> Vec<String> {
        match value {
            Value::Object(map) => args_to_flags(&map),
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn empty_args_produce_no_flags() {
        assert!(flags(json!({})).is_empty());
    }

    #[test]
    fn true_becomes_bare_flag() {
        assert_eq!(flags(json!({"dry_run": true})), vec!["--dry-run"]);
    }

    #[test]
    fn false_and_null_are_omitted() {
        assert!(flags(json!({"dry_run": false})).is_empty());
        assert!(flags(json!({"branch": null})).is_empty());
    }

    #[test]
    fn scalar_becomes_flag_value_pair() {
        assert_eq!(
            flags(json!({"table": "in.c-main.users"})),
            vec!["--table", "in.c-main.users"]
        );
        assert_eq!(flags(json!({"limit": 10})), vec!["--limit", "10"]);
        assert_eq!(
            flags(json!({"output_json": "/tmp/out.json"})),
            vec!["--output-json", "/tmp/out.json"]
        );
    }

    #[test]
    fn list_repeats_flag_per_element() {
        assert_eq!(
            flags(json!({"columns": ["id", "name"]})),
            vec!["--columns", "id", "--columns", "name"]
        );
    }

    #[test]
    fn input_order_is_preserved() {
        assert_eq!(
            flags(json!({"table": "t", "force": true, "dry_run": true, "columns": ["a"]})),
            vec!["--table", "t", "--force", "--dry-run", "--columns", "a"]
        );
    }
}
