//! Placeholder resolution.
//!
//! Turns planner-supplied argument values — canonical `{source, key}`
//! dicts, bare phase-reference strings, `tool_<Name>` references, and
//! embedded `{KeyName}` templates — into concrete values drawn from
//! workflow state and the current loop item. Arguments whose source or
//! key cannot be found are omitted, never passed as null; the
//! argument-refinement pass downstream repairs or fails loudly.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use tess_domain::event::AgentEvent;
use tess_domain::plan::{
    is_placeholder_source, parse_phase_ref, result_key, Phase, Placeholder,
};

static EMBEDDED_PHASE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(result_of_phase_\d+)\[([A-Za-z0-9_]+)\]\}").expect("regex")
});
static EMBEDDED_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z][A-Za-z0-9_]*)\}").expect("regex"));

/// Resolve an argument map against workflow state and the current loop
/// item. Emits correction events for the repairs it performs.
pub fn resolve_arguments(
    args: &Map<String, Value>,
    workflow: &Map<String, Value>,
    loop_item: Option<&Value>,
    plan: &[Phase],
    events: &mut Vec<AgentEvent>,
) -> Map<String, Value> {
    let mut resolved = Map::new();
    for (name, value) in args {
        match resolve_value(value, workflow, loop_item, plan, events) {
            Some(Value::Null) | None => {
                tracing::warn!(argument = %name, "placeholder could not be resolved, omitting");
            }
            Some(concrete) => {
                resolved.insert(name.clone(), concrete);
            }
        }
    }
    resolved
}

fn resolve_value(
    value: &Value,
    workflow: &Map<String, Value>,
    loop_item: Option<&Value>,
    plan: &[Phase],
    events: &mut Vec<AgentEvent>,
) -> Option<Value> {
    match value {
        Value::Null => None,

        Value::Object(obj) => {
            // Canonical placeholder dict.
            if let Some(placeholder) = Placeholder::from_value(value) {
                return resolve_placeholder(&placeholder, workflow, loop_item, events);
            }
            // Legacy {"result_of_phase_N": "key"} — canonicalise and
            // resolve, with a normalisation event.
            for (k, v) in obj {
                if parse_phase_ref(k).is_some() {
                    if let Some(key) = v.as_str() {
                        events.push(AgentEvent::workaround(
                            "System Correction",
                            json!({
                                "summary": format!(
                                    "Legacy placeholder {{\"{k}\": \"{key}\"}} converted to the canonical form."
                                ),
                                "correction_type": "legacy_placeholder"
                            }),
                        ));
                        let placeholder = Placeholder::new(k.clone(), Some(key.to_string()));
                        return resolve_placeholder(&placeholder, workflow, loop_item, events);
                    }
                }
            }
            // Plain object: recurse, dropping null members.
            let mut out = Map::new();
            for (k, v) in obj {
                if let Some(resolved) = resolve_value(v, workflow, loop_item, plan, events) {
                    out.insert(k.clone(), resolved);
                }
            }
            Some(Value::Object(out))
        }

        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|v| resolve_value(v, workflow, loop_item, plan, events))
                .collect(),
        )),

        Value::String(s) => resolve_string(s, workflow, loop_item, plan, events),

        _ => Some(value.clone()),
    }
}

fn resolve_string(
    s: &str,
    workflow: &Map<String, Value>,
    loop_item: Option<&Value>,
    plan: &[Phase],
    events: &mut Vec<AgentEvent>,
) -> Option<Value> {
    // A bare placeholder source.
    if is_placeholder_source(s) {
        let placeholder = Placeholder::new(s.to_string(), None);
        return resolve_placeholder(&placeholder, workflow, loop_item, events);
    }

    // `tool_<Name>`: map back to the phase that ran that tool.
    if let Some(tool_name) = s.strip_prefix("tool_") {
        if let Some(phase) = plan.iter().find(|p| p.tool_name() == Some(tool_name)) {
            let placeholder = Placeholder::new(result_key(phase.phase), None);
            events.push(AgentEvent::workaround(
                "System Correction",
                json!({
                    "summary": format!(
                        "Reference '{s}' resolved to phase {} by tool name.",
                        phase.phase
                    ),
                    "correction_type": "tool_reference"
                }),
            ));
            return resolve_placeholder(&placeholder, workflow, loop_item, events);
        }
    }

    // Embedded templates inside a larger string.
    if s.contains('{') {
        return Some(Value::String(substitute_embedded(s, workflow, loop_item)));
    }

    Some(Value::String(s.to_string()))
}

fn resolve_placeholder(
    placeholder: &Placeholder,
    workflow: &Map<String, Value>,
    loop_item: Option<&Value>,
    events: &mut Vec<AgentEvent>,
) -> Option<Value> {
    let source_value = lookup_source(&placeholder.source, workflow, loop_item)?;

    match &placeholder.key {
        Some(key) => find_key_recursive(&source_value, key),
        None => {
            let unwrapped = unwrap_single(&source_value);
            if unwrapped != source_value {
                events.push(AgentEvent::workaround(
                    "System Correction",
                    json!({
                        "summary": format!(
                            "Placeholder '{}' omitted its key; the single value inside the result was unwrapped.",
                            placeholder.source
                        ),
                        "correction_type": "single_value_unwrap"
                    }),
                ));
            }
            Some(unwrapped)
        }
    }
}

fn lookup_source(
    source: &str,
    workflow: &Map<String, Value>,
    loop_item: Option<&Value>,
) -> Option<Value> {
    if source == "loop_item" {
        return loop_item.cloned();
    }
    workflow.get(source).cloned()
}

/// Case-insensitive recursive key search. Objects are checked before
/// their children; arrays are searched in order.
pub fn find_key_recursive(value: &Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(obj) => {
            if let Some((_, v)) = obj.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
                return Some(v.clone());
            }
            obj.values().find_map(|v| find_key_recursive(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key_recursive(v, key)),
        _ => None,
    }
}

/// The single-value convention: `[{"results": [{onlykey: v}]}]` (with or
/// without the outer list) yields `v`; anything else passes through.
pub fn unwrap_single(value: &Value) -> Value {
    let inner = match value {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    };
    if let Some(results) = inner.get("results").and_then(Value::as_array) {
        if results.len() == 1 {
            if let Some(row) = results[0].as_object() {
                if row.len() == 1 {
                    if let Some(v) = row.values().next() {
                        return v.clone();
                    }
                }
            }
        }
    }
    value.clone()
}

fn substitute_embedded(
    s: &str,
    workflow: &Map<String, Value>,
    loop_item: Option<&Value>,
) -> String {
    // `{result_of_phase_N[key]}` first — more specific.
    let pass_one = EMBEDDED_PHASE_REF.replace_all(s, |caps: &regex::Captures<'_>| {
        let source = &caps[1];
        let key = &caps[2];
        workflow
            .get(source)
            .and_then(|v| find_key_recursive(v, key))
            .map(value_as_text)
            .unwrap_or_else(|| caps[0].to_string())
    });

    // `{KeyName}`: loop item keys win, then workflow-wide search.
    EMBEDDED_KEY
        .replace_all(&pass_one, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            if let Some(item) = loop_item {
                if let Some(v) = find_key_recursive(item, key) {
                    return value_as_text(v);
                }
            }
            for value in workflow.values() {
                if let Some(v) = find_key_recursive(value, key) {
                    return value_as_text(v);
                }
            }
            caps[0].to_string()
        })
        .into_owned()
}

fn value_as_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow() -> Map<String, Value> {
        let mut w = Map::new();
        w.insert(
            "result_of_phase_1".into(),
            json!([{
                "status": "success",
                "metadata": { "tool_name": "base_tableList" },
                "results": [
                    { "TableName": "CUSTOMERS" },
                    { "TableName": "ORDERS" }
                ]
            }]),
        );
        w.insert(
            "result_of_phase_2".into(),
            json!([{
                "status": "success",
                "metadata": { "tool_name": "CurrentDate" },
                "results": [{ "date": "2025-11-03" }]
            }]),
        );
        w
    }

    fn resolve(args: Value) -> Map<String, Value> {
        let mut events = Vec::new();
        resolve_arguments(
            args.as_object().unwrap(),
            &workflow(),
            None,
            &[],
            &mut events,
        )
    }

    #[test]
    fn canonical_placeholder_with_key() {
        let out = resolve(json!({
            "table": { "source": "result_of_phase_1", "key": "TableName" }
        }));
        assert_eq!(out["table"], json!("CUSTOMERS"));
    }

    #[test]
    fn key_lookup_is_case_insensitive() {
        let out = resolve(json!({
            "table": { "source": "result_of_phase_1", "key": "tablename" }
        }));
        assert_eq!(out["table"], json!("CUSTOMERS"));
    }

    #[test]
    fn missing_source_omits_argument() {
        let out = resolve(json!({
            "x": { "source": "result_of_phase_9", "key": "Whatever" },
            "y": "keep me"
        }));
        assert!(!out.contains_key("x"));
        assert_eq!(out["y"], json!("keep me"));
    }

    #[test]
    fn missing_key_omits_argument() {
        let out = resolve(json!({
            "x": { "source": "result_of_phase_1", "key": "NoSuchColumn" }
        }));
        assert!(!out.contains_key("x"));
    }

    #[test]
    fn no_key_unwraps_single_value() {
        let out = resolve(json!({ "date": { "source": "result_of_phase_2" } }));
        assert_eq!(out["date"], json!("2025-11-03"));
    }

    #[test]
    fn unwrap_passes_multi_value_through() {
        let out = resolve(json!({ "rows": { "source": "result_of_phase_1" } }));
        // Two rows — the structure passes through unchanged.
        assert!(out["rows"].is_array());
    }

    #[test]
    fn bare_phase_string_is_a_placeholder() {
        let out = resolve(json!({ "date": "result_of_phase_2" }));
        assert_eq!(out["date"], json!("2025-11-03"));
    }

    #[test]
    fn legacy_dict_is_converted_and_resolved() {
        let mut events = Vec::new();
        let out = resolve_arguments(
            json!({ "table": { "result_of_phase_1": "TableName" } })
                .as_object()
                .unwrap(),
            &workflow(),
            None,
            &[],
            &mut events,
        );
        assert_eq!(out["table"], json!("CUSTOMERS"));
        assert!(events
            .iter()
            .any(|e| e.payload()["details"]["correction_type"] == "legacy_placeholder"));
    }

    #[test]
    fn loop_item_source_resolves_from_item() {
        let mut events = Vec::new();
        let item = json!({ "TableName": "ORDERS", "RowCount": 42 });
        let out = resolve_arguments(
            json!({ "table": { "source": "loop_item", "key": "TableName" } })
                .as_object()
                .unwrap(),
            &workflow(),
            Some(&item),
            &[],
            &mut events,
        );
        assert_eq!(out["table"], json!("ORDERS"));
    }

    #[test]
    fn tool_reference_maps_to_phase_result() {
        let plan = vec![
            Phase::new(1, "list").with_tool("base_tableList"),
            Phase::new(2, "date").with_tool("CurrentDate"),
        ];
        let mut events = Vec::new();
        let out = resolve_arguments(
            json!({ "date": "tool_CurrentDate" }).as_object().unwrap(),
            &workflow(),
            None,
            &plan,
            &mut events,
        );
        assert_eq!(out["date"], json!("2025-11-03"));
    }

    #[test]
    fn embedded_template_preserves_surrounding_text() {
        let mut events = Vec::new();
        let item = json!({ "TableName": "ORDERS" });
        let out = resolve_arguments(
            json!({ "goal": "Describe table {TableName} thoroughly" })
                .as_object()
                .unwrap(),
            &workflow(),
            Some(&item),
            &[],
            &mut events,
        );
        assert_eq!(out["goal"], json!("Describe table ORDERS thoroughly"));
    }

    #[test]
    fn embedded_phase_ref_with_key() {
        let out = resolve(json!({
            "note": "as of {result_of_phase_2[date]} the data is current"
        }));
        assert_eq!(out["note"], json!("as of 2025-11-03 the data is current"));
    }

    #[test]
    fn unresolvable_embedded_template_is_left_intact() {
        let out = resolve(json!({ "goal": "Describe {Mystery} now" }));
        assert_eq!(out["goal"], json!("Describe {Mystery} now"));
    }

    #[test]
    fn nulls_are_filtered() {
        let out = resolve(json!({ "a": null, "b": 1 }));
        assert!(!out.contains_key("a"));
        assert_eq!(out["b"], json!(1));
    }

    #[test]
    fn resolution_is_idempotent() {
        let args = json!({
            "table": { "source": "result_of_phase_1", "key": "TableName" },
            "text": "as of {result_of_phase_2[date]}",
            "literal": 7
        });
        let once = resolve(args);
        let mut events = Vec::new();
        let twice = resolve_arguments(&once, &workflow(), None, &[], &mut events);
        assert_eq!(once, twice);
        assert!(events.is_empty());
    }
}
