//! JSON extraction and planner-output parsing.
//!
//! LMs wrap JSON in markdown fences, prepend prose, and sometimes return
//! a bare action object instead of a phase list. All of that is
//! tolerated here — and nowhere else.

use serde_json::Value;

use tess_domain::error::{Error, Result};
use tess_domain::plan::Phase;

/// Extract the first JSON document from an LM response: a ```json fence
/// if present, otherwise the first balanced object or array.
pub fn extract_json(raw: &str) -> Option<Value> {
    // Fenced block first.
    if let Some(start) = raw.find("```json") {
        let rest = &raw[start + 7..];
        if let Some(end) = rest.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(rest[..end].trim()) {
                return Some(v);
            }
        }
    }
    // Any fence.
    if let Some(start) = raw.find("```") {
        let rest = &raw[start + 3..];
        if let Some(end) = rest.find("```") {
            if let Ok(v) = serde_json::from_str::<Value>(rest[..end].trim()) {
                return Some(v);
            }
        }
    }
    // Balanced scan from the first opening bracket.
    for open in ['[', '{'] {
        if let Some(start) = raw.find(open) {
            if let Some(v) = scan_balanced(&raw[start..]) {
                return Some(v);
            }
        }
    }
    None
}

fn scan_balanced(raw: &str) -> Option<Value> {
    let bytes = raw.as_bytes();
    let (open, close) = match bytes.first()? {
        b'[' => (b'[', b']'),
        b'{' => (b'{', b'}'),
        _ => return None,
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&raw[..=idx]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// What the strategic LM produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutput {
    /// A multi-phase plan.
    Plan(Vec<Phase>),
    /// A conversational reply — no tools, no phases.
    Conversational(String),
}

/// Parse the strategic response. Accepts a phase list, a conversational
/// object (`{plan_type: "conversational", response}`), or a single direct
/// action object (wrapped as a one-phase plan).
pub fn parse_planner_output(raw: &str) -> Result<(PlannerOutput, Value)> {
    let value = extract_json(raw)
        .ok_or_else(|| Error::PlanParse("no JSON object found in planner response".into()))?;

    match &value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(Error::PlanParse("planner returned an empty plan".into()));
            }
            let phases: Vec<Phase> = serde_json::from_value(value.clone())
                .map_err(|e| Error::PlanParse(format!("malformed phase list: {e}")))?;
            Ok((PlannerOutput::Plan(phases), value))
        }
        Value::Object(obj) => {
            if obj.get("plan_type").and_then(Value::as_str) == Some("conversational") {
                let response = obj
                    .get("response")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Ok((PlannerOutput::Conversational(response), value));
            }
            // A single direct action: {tool_name | prompt_name, arguments}.
            if let Some(tool) = obj.get("tool_name").and_then(Value::as_str) {
                let mut phase = Phase::new(1, format!("Execute {tool}")).with_tool(tool);
                if let Some(args) = obj.get("arguments").and_then(Value::as_object) {
                    phase.arguments = args.clone();
                }
                return Ok((PlannerOutput::Plan(vec![phase]), value));
            }
            if let Some(prompt) = obj.get("prompt_name").and_then(Value::as_str) {
                let mut phase = Phase::new(1, format!("Run {prompt}"));
                phase.executable_prompt = Some(prompt.to_string());
                if let Some(args) = obj.get("arguments").and_then(Value::as_object) {
                    phase.arguments = args.clone();
                }
                return Ok((PlannerOutput::Plan(vec![phase]), value));
            }
            // A single phase object.
            if obj.contains_key("phase") || obj.contains_key("relevant_tools") {
                let phase: Phase = serde_json::from_value(value.clone())
                    .map_err(|e| Error::PlanParse(format!("malformed phase: {e}")))?;
                return Ok((PlannerOutput::Plan(vec![phase]), value));
            }
            Err(Error::PlanParse(
                "planner response is neither a plan, a conversational reply, nor an action".into(),
            ))
        }
        _ => Err(Error::PlanParse("planner response is not a JSON container".into())),
    }
}
