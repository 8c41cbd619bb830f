//! The meta-plan model: ordered phases, placeholder references, and the
//! helpers every pipeline stage shares.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tool::names;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One unit of work within a plan. Dispatches to exactly one tool
/// (`relevant_tools`) or one prompt (`executable_prompt`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    #[serde(default)]
    pub phase: u32,
    #[serde(default)]
    pub goal: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relevant_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_prompt: Option<String>,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// `"loop"` for iterating phases.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub phase_type: Option<String>,
    /// Reference to a previous phase's result, or a literal list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_over: Option<Value>,
    /// Set by validation when required arguments are missing after
    /// corrections; forces an argument-refinement call at execution.
    /// Recomputed from scratch after every argument-stripping pass.
    #[serde(skip)]
    pub needs_refinement: bool,
}

impl Phase {
    pub fn new(phase: u32, goal: impl Into<String>) -> Self {
        Self {
            phase,
            goal: goal.into(),
            relevant_tools: Vec::new(),
            executable_prompt: None,
            arguments: Map::new(),
            phase_type: None,
            loop_over: None,
            needs_refinement: false,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.relevant_tools = vec![tool.into()];
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), value);
        self
    }

    pub fn is_loop(&self) -> bool {
        self.phase_type.as_deref() == Some("loop")
    }

    /// The single tool this phase dispatches to, when it is a tool phase.
    pub fn tool_name(&self) -> Option<&str> {
        match self.relevant_tools.as_slice() {
            [single] => Some(single.as_str()),
            _ => None,
        }
    }

    /// The capability name used for dispatch: `relevant_tools[0]` or the
    /// executable prompt.
    pub fn capability(&self) -> Option<&str> {
        self.relevant_tools
            .first()
            .map(String::as_str)
            .or(self.executable_prompt.as_deref())
    }

    /// True when this phase ends the plan with a report to the user.
    pub fn is_reporting(&self) -> bool {
        self.capability().is_some_and(names::is_reporting)
    }
}

/// Renumber phases contiguously from 1, preserving order. Run after every
/// rewrite that inserts or removes phases.
pub fn renumber(plan: &mut [Phase]) {
    for (idx, phase) in plan.iter_mut().enumerate() {
        phase.phase = idx as u32 + 1;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Placeholders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Workflow-state key for carried-forward data from the previous turn.
pub const INJECTED_PREVIOUS_TURN_DATA: &str = "injected_previous_turn_data";
/// Placeholder source resolved against the current loop item.
pub const LOOP_ITEM: &str = "loop_item";

/// Workflow-state key for a phase result.
pub fn result_key(phase: u32) -> String {
    format!("result_of_phase_{phase}")
}

/// Parse `result_of_phase_<N>` or `phase_<N>` into the phase number.
pub fn parse_phase_ref(s: &str) -> Option<u32> {
    let digits = s
        .strip_prefix("result_of_phase_")
        .or_else(|| s.strip_prefix("phase_"))?;
    digits.parse().ok()
}

/// True for any string that names a placeholder source on its own.
pub fn is_placeholder_source(s: &str) -> bool {
    s == LOOP_ITEM || s == INJECTED_PREVIOUS_TURN_DATA || parse_phase_ref(s).is_some()
}

/// The canonical placeholder form after normalisation: `{source, key?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholder {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Placeholder {
    pub fn new(source: impl Into<String>, key: Option<String>) -> Self {
        Self {
            source: source.into(),
            key,
        }
    }

    /// Interpret a JSON value as a canonical placeholder dict. Returns
    /// `None` for anything that is not `{source, key?}` with a valid
    /// placeholder source.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let source = obj.get("source")?.as_str()?;
        if !is_placeholder_source(source) {
            return None;
        }
        // Only `source` and an optional `key` are allowed; anything else is
        // ordinary data that happens to carry a `source` field.
        if obj.keys().any(|k| k != "source" && k != "key") {
            return None;
        }
        let key = obj.get("key").and_then(Value::as_str).map(str::to_owned);
        Some(Self::new(source, key))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phase_deserialises_from_llm_shape() {
        let raw = json!({
            "phase": 1,
            "goal": "List tables",
            "relevant_tools": ["base_tableList"],
            "arguments": { "database_name": "SALES" }
        });
        let phase: Phase = serde_json::from_value(raw).unwrap();
        assert_eq!(phase.tool_name(), Some("base_tableList"));
        assert_eq!(phase.capability(), Some("base_tableList"));
        assert!(!phase.is_loop());
        assert!(!phase.needs_refinement);
    }

    #[test]
    fn loop_phase_detected() {
        let raw = json!({
            "phase": 2,
            "goal": "Describe each table",
            "relevant_tools": ["base_tableDescription"],
            "type": "loop",
            "loop_over": "result_of_phase_1",
            "arguments": {}
        });
        let phase: Phase = serde_json::from_value(raw).unwrap();
        assert!(phase.is_loop());
        assert_eq!(phase.loop_over, Some(json!("result_of_phase_1")));
    }

    #[test]
    fn renumber_makes_contiguous() {
        let mut plan = vec![Phase::new(3, "a"), Phase::new(7, "b"), Phase::new(9, "c")];
        renumber(&mut plan);
        let numbers: Vec<u32> = plan.iter().map(|p| p.phase).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn parse_phase_ref_variants() {
        assert_eq!(parse_phase_ref("result_of_phase_4"), Some(4));
        assert_eq!(parse_phase_ref("phase_12"), Some(12));
        assert_eq!(parse_phase_ref("result_of_phase_x"), None);
        assert_eq!(parse_phase_ref("tool_base_tableList"), None);
    }

    #[test]
    fn placeholder_from_canonical_dict() {
        let v = json!({ "source": "result_of_phase_2", "key": "TableName" });
        let ph = Placeholder::from_value(&v).unwrap();
        assert_eq!(ph.source, "result_of_phase_2");
        assert_eq!(ph.key.as_deref(), Some("TableName"));
    }

    #[test]
    fn placeholder_rejects_ordinary_objects() {
        assert!(Placeholder::from_value(&json!({ "source": "csv" })).is_none());
        assert!(Placeholder::from_value(&json!({
            "source": "loop_item", "key": "K", "other": 1
        }))
        .is_none());
        assert!(Placeholder::from_value(&json!("result_of_phase_1")).is_none());
    }

    #[test]
    fn placeholder_without_key_roundtrips() {
        let ph = Placeholder::new("loop_item", None);
        let v = ph.to_value();
        assert_eq!(v, json!({ "source": "loop_item" }));
        assert_eq!(Placeholder::from_value(&v), Some(ph));
    }

    #[test]
    fn reporting_phase_detection() {
        let phase = Phase::new(1, "report").with_tool("FinalReport");
        assert!(phase.is_reporting());
        let phase = Phase::new(1, "fetch").with_tool("base_readQuery");
        assert!(!phase.is_reporting());
    }
}
