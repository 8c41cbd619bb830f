//! Template canonicalisation.
//!
//! LMs emit at least five placeholder dialects for the same reference:
//! `{{loop_item.Field}}`, `{{loop_item['Field']}}`, `{loop_item[Field]}`,
//! `{loop_item.Field}`, and bare `{Field}`. This pass runs exactly once,
//! immediately after plan generation, so every downstream stage sees one
//! shape: the canonical `{source, key}` dict.
//!
//! Pure-template strings become dicts. Embedded templates (a placeholder
//! inside a larger string) stay strings — the resolver substitutes them
//! at execution time.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use tess_domain::plan::{parse_phase_ref, Phase, Placeholder};

static PURE_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{([A-Za-z][A-Za-z0-9_]*)\}$").expect("regex"));

static PURE_LOOP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\{\{loop_item\.([A-Za-z0-9_]+)\}\}$",
        r#"^\{\{loop_item\[['"]([A-Za-z0-9_]+)['"]\]\}\}$"#,
        r#"^\{loop_item\[['"]?([A-Za-z0-9_]+)['"]?\]\}$"#,
        r"^\{loop_item\.([A-Za-z0-9_]+)\}$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("regex"))
    .collect()
});

/// Field names treated as template keys even without the uppercase cue.
const KNOWN_TEMPLATE_KEYS: &[&str] = &["TableName", "ColumnName", "DatabaseName", "SchemaName"];

/// Convert a single argument value to the canonical template form.
/// Values that are not templates pass through unchanged.
pub fn convert_to_canonical(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            // Already canonical.
            if Placeholder::from_value(value).is_some() {
                return value.clone();
            }
            // Legacy {"result_of_phase_1": "key"}.
            for (k, v) in obj {
                if parse_phase_ref(k).is_some() {
                    if let Some(key) = v.as_str() {
                        return Placeholder::new(k.clone(), Some(key.to_string())).to_value();
                    }
                }
            }
            value.clone()
        }
        Value::String(s) => {
            for pattern in PURE_LOOP_PATTERNS.iter() {
                if let Some(captures) = pattern.captures(s) {
                    let key = captures.get(1).map(|m| m.as_str().to_string());
                    return Placeholder::new("loop_item", key).to_value();
                }
            }
            if let Some(captures) = PURE_BARE.captures(s) {
                let key = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
                let looks_like_template = key
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_uppercase())
                    || KNOWN_TEMPLATE_KEYS.contains(&key);
                if looks_like_template {
                    return Placeholder::new("loop_item", Some(key.to_string())).to_value();
                }
            }
            // Embedded templates stay as strings for the resolver.
            value.clone()
        }
        _ => value.clone(),
    }
}

fn normalize_value(value: &Value) -> Value {
    match value {
        Value::Object(_) => {
            let converted = convert_to_canonical(value);
            // Converted placeholders are final; other objects recurse.
            if Placeholder::from_value(&converted).is_some() {
                converted
            } else if let Value::Object(obj) = value {
                Value::Object(normalize_arguments(obj))
            } else {
                converted
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
        _ => convert_to_canonical(value),
    }
}

/// Recursively normalise an argument map.
pub fn normalize_arguments(args: &Map<String, Value>) -> Map<String, Value> {
    args.iter()
        .map(|(k, v)| (k.clone(), normalize_value(v)))
        .collect()
}

/// Normalise every phase's arguments in place. Returns the number of
/// phases that changed.
pub fn normalize_plan(plan: &mut [Phase]) -> usize {
    let mut changed = 0;
    for phase in plan.iter_mut() {
        let normalized = normalize_arguments(&phase.arguments);
        if normalized != phase.arguments {
            tracing::debug!(phase = phase.phase, "arguments normalised to canonical form");
            phase.arguments = normalized;
            changed += 1;
        }
    }
    if changed > 0 {
        tracing::info!(phases = changed, "plan normalisation complete");
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canon(v: Value) -> Value {
        convert_to_canonical(&v)
    }

    #[test]
    fn double_brace_dot_form() {
        assert_eq!(
            canon(json!("{{loop_item.TableName}}")),
            json!({ "source": "loop_item", "key": "TableName" })
        );
    }

    #[test]
    fn double_brace_bracket_form() {
        assert_eq!(
            canon(json!("{{loop_item['ColumnName']}}")),
            json!({ "source": "loop_item", "key": "ColumnName" })
        );
    }

    #[test]
    fn single_brace_bracket_form() {
        assert_eq!(
            canon(json!("{loop_item[TableName]}")),
            json!({ "source": "loop_item", "key": "TableName" })
        );
    }

    #[test]
    fn bare_uppercase_field() {
        assert_eq!(
            canon(json!("{TableName}")),
            json!({ "source": "loop_item", "key": "TableName" })
        );
        // Lowercase bare fields are left alone — too likely to be literal.
        assert_eq!(canon(json!("{verbatim}")), json!("{verbatim}"));
    }

    #[test]
    fn legacy_dict_form() {
        assert_eq!(
            canon(json!({ "result_of_phase_1": "TableName" })),
            json!({ "source": "result_of_phase_1", "key": "TableName" })
        );
    }

    #[test]
    fn embedded_templates_stay_strings() {
        let v = json!("Describe table {TableName} in detail");
        assert_eq!(canon(v.clone()), v);
    }

    #[test]
    fn already_canonical_passes_through() {
        let v = json!({ "source": "loop_item", "key": "TableName" });
        assert_eq!(canon(v.clone()), v);
    }

    #[test]
    fn normalize_is_idempotent() {
        let mut plan = vec![Phase::new(1, "x")
            .with_tool("base_tableDescription")
            .with_arg("table_name", json!("{{loop_item.TableName}}"))
            .with_arg("database_name", json!("SALES"))];
        let changed = normalize_plan(&mut plan);
        assert_eq!(changed, 1);
        let snapshot = plan.clone();
        let changed_again = normalize_plan(&mut plan);
        assert_eq!(changed_again, 0);
        assert_eq!(plan, snapshot);
    }

    #[test]
    fn nested_lists_are_normalised() {
        let mut plan = vec![Phase::new(1, "x").with_arg(
            "columns",
            json!(["{ColumnName}", "literal", { "result_of_phase_2": "Rows" }]),
        )];
        normalize_plan(&mut plan);
        let cols = plan[0].arguments["columns"].as_array().unwrap();
        assert_eq!(cols[0], json!({ "source": "loop_item", "key": "ColumnName" }));
        assert_eq!(cols[1], json!("literal"));
        assert_eq!(cols[2], json!({ "source": "result_of_phase_2", "key": "Rows" }));
    }
}
