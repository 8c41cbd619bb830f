//! Turn-scoped mutable state: the workflow map and the action history.
//!
//! `PlanExecutor` owns one [`TurnState`] per turn and lends it (`&mut`)
//! down through phase execution; sub-executors borrow the same state, so
//! the parent re-adopts their writes without copying. No component holds
//! a back-pointer to another — everything flows through this arena.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use tess_domain::plan::result_key;
use tess_domain::tool::ToolOutput;

/// One `{action, result}` pair in the turn's execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Value,
    pub result: Value,
}

/// Mutable per-turn state: workflow map, action history, collected data.
#[derive(Default)]
pub struct TurnState {
    /// `result_of_phase_<N>` → list of tool outputs.
    pub workflow: Map<String, Value>,
    /// Append-only execution trace, ordered by execution time.
    pub history: Vec<ActionRecord>,
    /// Structured data collected for the final answer payload.
    pub collected: Vec<Value>,
    /// The most recent tool output.
    pub last_output: Option<ToolOutput>,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from seed values (previous-turn hydration writes here).
    pub fn with_seed(seed: Map<String, Value>) -> Self {
        Self {
            workflow: seed,
            ..Default::default()
        }
    }

    /// Append a tool output to a phase's result list.
    pub fn bind_result(&mut self, phase: u32, output: &ToolOutput) {
        let value = output.to_value();
        let entry = self
            .workflow
            .entry(result_key(phase))
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = entry {
            list.push(value.clone());
        }
        self.collected.push(value);
        self.last_output = Some(output.clone());
    }

    /// Bind an empty result list (skipped loop phases still bind).
    pub fn bind_empty(&mut self, phase: u32) {
        self.workflow
            .entry(result_key(phase))
            .or_insert_with(|| Value::Array(Vec::new()));
    }

    /// Re-expose an already-collected output under another phase's key
    /// (a sub-process result adopted by its parent phase). Does not
    /// duplicate the output into `collected`.
    pub fn alias_result(&mut self, phase: u32, output: &ToolOutput) {
        let entry = self
            .workflow
            .entry(result_key(phase))
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = entry {
            list.push(output.to_value());
        }
        self.last_output = Some(output.clone());
    }

    /// Append an action-history entry.
    pub fn record_action(
        &mut self,
        tool_name: &str,
        arguments: &Value,
        phase: u32,
        depth: u32,
        timestamp: DateTime<Utc>,
        result: Value,
    ) {
        self.history.push(ActionRecord {
            action: json!({
                "tool_name": tool_name,
                "arguments": arguments,
                "metadata": {
                    "phase_number": phase,
                    "execution_depth": depth,
                    "timestamp": timestamp.to_rfc3339(),
                },
            }),
            result,
        });
    }

    /// The execution trace as plain JSON for persistence.
    pub fn trace(&self) -> Vec<Value> {
        self.history
            .iter()
            .map(|r| json!({ "action": r.action, "result": r.result }))
            .collect()
    }

    /// A distilled view of workflow state safe for an LM context window:
    /// large `results` arrays are replaced by their shape.
    pub fn distilled(&self) -> Value {
        let mut out = Map::new();
        for (key, value) in &self.workflow {
            out.insert(key.clone(), distill_value(value));
        }
        Value::Object(out)
    }
}

/// Row-count threshold above which results are summarised instead of
/// inlined into LM context.
const DISTILL_THRESHOLD: usize = 5;

fn distill_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(distill_value).collect()),
        Value::Object(obj) => {
            let results = obj.get("results").and_then(Value::as_array);
            match results {
                Some(rows) if rows.len() > DISTILL_THRESHOLD => {
                    let columns: Vec<String> = rows
                        .first()
                        .and_then(Value::as_object)
                        .map(|row| row.keys().cloned().collect())
                        .unwrap_or_default();
                    json!({
                        "status": obj.get("status").cloned().unwrap_or(Value::Null),
                        "metadata": {
                            "tool_name": obj
                                .get("metadata")
                                .and_then(|m| m.get("tool_name"))
                                .cloned()
                                .unwrap_or(Value::Null),
                            "row_count": rows.len(),
                            "columns": columns,
                        },
                        "comment": "results summarised to protect the context window",
                    })
                }
                _ => value.clone(),
            }
        }
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_result_appends_to_list() {
        let mut state = TurnState::new();
        let a = ToolOutput::success("t", vec![json!({"n": 1})]);
        let b = ToolOutput::success("t", vec![json!({"n": 2})]);
        state.bind_result(1, &a);
        state.bind_result(1, &b);
        let list = state.workflow["result_of_phase_1"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(state.collected.len(), 2);
    }

    #[test]
    fn bind_empty_still_creates_the_key() {
        let mut state = TurnState::new();
        state.bind_empty(3);
        assert_eq!(state.workflow["result_of_phase_3"], json!([]));
    }

    #[test]
    fn history_is_ordered_and_carries_metadata() {
        let mut state = TurnState::new();
        let t0 = Utc::now();
        state.record_action("a", &json!({}), 1, 0, t0, json!("r1"));
        state.record_action("b", &json!({}), 2, 1, t0, json!("r2"));
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0].action["tool_name"], "a");
        assert_eq!(state.history[1].action["metadata"]["execution_depth"], 1);
        assert_eq!(state.trace()[1]["result"], json!("r2"));
    }

    #[test]
    fn distilled_replaces_large_result_sets() {
        let mut state = TurnState::new();
        let rows: Vec<Value> = (0..10).map(|i| json!({"Region": "r", "Total": i})).collect();
        state.bind_result(1, &ToolOutput::success("sales", rows));
        state.bind_result(2, &ToolOutput::success("small", vec![json!({"a": 1})]));

        let distilled = state.distilled();
        let big = &distilled["result_of_phase_1"][0];
        assert_eq!(big["metadata"]["row_count"], 10);
        assert_eq!(big["metadata"]["columns"], json!(["Region", "Total"]));
        assert!(big.get("results").is_none());
        // Small results are passed through intact.
        assert!(distilled["result_of_phase_2"][0].get("results").is_some());
    }

    #[test]
    fn seeded_state_exposes_injected_data() {
        let mut seed = Map::new();
        seed.insert("injected_previous_turn_data".into(), json!([{"x": 1}]));
        let state = TurnState::with_seed(seed);
        assert!(state.workflow.contains_key("injected_previous_turn_data"));
    }
}
