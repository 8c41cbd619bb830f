//! Deterministic plan validation.
//!
//! A fixed rule set catching the LM defects that show up in practice:
//! prompts filed as tools, tools filed as prompts, hallucinated
//! arguments, misspelled parameter names, and missing required
//! arguments. Each triggered rule rewrites the phase in place and emits
//! a correction event.

use serde_json::{json, Value};
use similar::TextDiff;

use tess_domain::event::AgentEvent;
use tess_domain::plan::Phase;
use tess_domain::tool::{canonical_arg_name, synonyms_of, PromptCatalog, ToolCatalog, ToolDescriptor};

/// Minimum similarity ratio for a fuzzy parameter-name rename.
const PARAM_MATCH_THRESHOLD: f64 = 0.7;

/// Values that count as "no prompt at all".
const NULLISH: &[&str] = &["None", "null", "", "undefined"];

/// Apply all validation rules to every phase, in order. Correction
/// events are pushed to `events`.
pub fn validate_plan(
    plan: &mut [Phase],
    tools: &ToolCatalog,
    prompts: &PromptCatalog,
    events: &mut Vec<AgentEvent>,
) {
    for phase in plan.iter_mut() {
        validate_phase(phase, tools, prompts, events);
    }
}

fn validate_phase(
    phase: &mut Phase,
    tools: &ToolCatalog,
    prompts: &PromptCatalog,
    events: &mut Vec<AgentEvent>,
) {
    let before = serde_json::to_value(&*phase).unwrap_or(Value::Null);
    let mut correction: Option<&'static str> = None;

    // Rule 1: null-ish executable_prompt.
    if let Some(prompt) = &phase.executable_prompt {
        if NULLISH.contains(&prompt.as_str()) {
            tracing::warn!(phase = phase.phase, "removing null-valued executable_prompt");
            phase.executable_prompt = None;
            correction = Some("invalid_prompt");
        }
    }

    // Rule 2: prompt declared as a tool.
    if let Some(first) = phase.relevant_tools.first() {
        if prompts.contains(first) {
            tracing::warn!(capability = %first, "prompt misclassified as tool, correcting");
            phase.executable_prompt = Some(first.clone());
            phase.relevant_tools.clear();
            correction = Some("prompt_as_tool");
        }
    }

    // Rule 3: tool declared as a prompt. Runs independently of rule 2 —
    // the LM sometimes emits both fields on one phase.
    if let Some(prompt) = &phase.executable_prompt {
        if tools.contains(prompt) {
            tracing::warn!(capability = %prompt, "tool misclassified as prompt, correcting");
            phase.relevant_tools = vec![prompt.clone()];
            phase.executable_prompt = None;
            correction = Some("tool_as_prompt");
        }
    }

    // Rules 4–6 only apply to tool phases with a known descriptor.
    if let Some(tool) = phase.tool_name().and_then(|name| tools.get(name)) {
        let tool = tool.clone();

        // Rules 4+5: classify every unmatched provided name. A fuzzy
        // rename onto a missing schema name (rule 5) is tried first so
        // the removal pass (rule 4) does not eat repairable misspellings.
        let valid = valid_arg_names(&tool);
        let unmatched: Vec<String> = phase
            .arguments
            .keys()
            .filter(|k| !valid.iter().any(|v| v.eq_ignore_ascii_case(k)))
            .cloned()
            .collect();
        for wrong in unmatched {
            let missing: Vec<String> = tool
                .args
                .iter()
                .map(|a| a.name.clone())
                .filter(|name| !phase.arguments.contains_key(name))
                .collect();
            if let Some(correct) = best_param_match(&wrong, &missing) {
                if let Some(value) = phase.arguments.remove(&wrong) {
                    tracing::info!(from = %wrong, to = %correct, tool = %tool.name, "parameter renamed");
                    phase.arguments.insert(correct, value);
                    correction = Some("parameter_name_mismatch");
                }
            } else {
                tracing::warn!(tool = %tool.name, arg = %wrong, "removing hallucinated argument");
                phase.arguments.remove(&wrong);
                correction = Some("extraneous_args");
            }
        }

        // Rule 6: the refinement flag is recomputed from scratch after
        // every pass above — never inherited.
        phase.needs_refinement = missing_required(phase, &tool);
        if phase.needs_refinement {
            tracing::warn!(tool = %tool.name, "required arguments missing, flagged for refinement");
        }
    }

    if let Some(kind) = correction {
        let summary = match kind {
            "invalid_prompt" => "Plan contained an invalid prompt reference. The system removed it to prevent execution errors.",
            "prompt_as_tool" => "Planner misclassified a prompt as a tool. The system corrected the plan.",
            "tool_as_prompt" => "Planner misclassified a tool as a prompt. The system corrected the plan.",
            "extraneous_args" => "Plan contained arguments the tool does not accept. The system removed them.",
            "parameter_name_mismatch" => "Plan contained parameter names that do not match the tool schema. The system renamed them.",
            _ => "Plan corrected by the system.",
        };
        events.push(AgentEvent::workaround(
            "Plan Optimization",
            json!({
                "summary": summary,
                "correction": {
                    "from": before,
                    "to": serde_json::to_value(&*phase).unwrap_or(Value::Null),
                }
            }),
        ));
    }
}

/// All argument spellings the tool accepts, synonym groups included.
fn valid_arg_names(tool: &ToolDescriptor) -> Vec<String> {
    let mut names = Vec::new();
    for arg in &tool.args {
        for synonym in synonyms_of(canonical_arg_name(&arg.name)) {
            names.push(synonym.to_string());
        }
        if !names.iter().any(|n| n == &arg.name) {
            names.push(arg.name.clone());
        }
    }
    names
}

/// Required canonical argument names still missing from the phase.
pub fn missing_required(phase: &Phase, tool: &ToolDescriptor) -> bool {
    let provided: Vec<&str> = phase
        .arguments
        .keys()
        .map(|k| canonical_arg_name(k))
        .collect();
    tool.required_args()
        .any(|arg| !provided.contains(&canonical_arg_name(&arg.name)))
}

/// The best fuzzy match for a misspelled parameter name: an exact synonym
/// wins outright, otherwise a difflib-style char ratio above the
/// threshold.
fn best_param_match(wrong: &str, candidates: &[String]) -> Option<String> {
    let wrong_canonical = canonical_arg_name(wrong);
    let mut best: Option<(String, f64)> = None;
    for candidate in candidates {
        if canonical_arg_name(candidate) == wrong_canonical {
            return Some(candidate.clone());
        }
        let ratio = TextDiff::from_chars(
            wrong.to_lowercase().as_str(),
            candidate.to_lowercase().as_str(),
        )
        .ratio() as f64;
        if ratio > PARAM_MATCH_THRESHOLD && best.as_ref().map_or(true, |(_, b)| ratio > *b) {
            best = Some((candidate.clone(), ratio));
        }
    }
    best.map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tess_domain::tool::{ArgSpec, PromptDescriptor};

    fn catalog() -> (ToolCatalog, PromptCatalog) {
        let tools = ToolCatalog::new(vec![ToolDescriptor {
            name: "base_tableList".into(),
            description: "List tables".into(),
            args: vec![ArgSpec {
                name: "database_name".into(),
                arg_type: "string".into(),
                required: true,
                description: String::new(),
            }],
            scope: None,
        }]);
        let prompts = PromptCatalog::new(vec![PromptDescriptor {
            name: "QuarterlyRevenueAudit".into(),
            description: String::new(),
            args: vec![],
        }]);
        (tools, prompts)
    }

    #[test]
    fn nullish_prompt_is_removed() {
        let (tools, prompts) = catalog();
        let mut phase = Phase::new(1, "x").with_tool("base_tableList");
        phase.executable_prompt = Some("None".into());
        phase.arguments.insert("database_name".into(), json!("SALES"));
        let mut events = Vec::new();
        validate_phase(&mut phase, &tools, &prompts, &mut events);
        assert!(phase.executable_prompt.is_none());
        assert!(!events.is_empty());
    }

    #[test]
    fn prompt_as_tool_is_moved() {
        let (tools, prompts) = catalog();
        let mut phase = Phase::new(1, "x").with_tool("QuarterlyRevenueAudit");
        let mut events = Vec::new();
        validate_phase(&mut phase, &tools, &prompts, &mut events);
        assert!(phase.relevant_tools.is_empty());
        assert_eq!(
            phase.executable_prompt.as_deref(),
            Some("QuarterlyRevenueAudit")
        );
    }

    #[test]
    fn tool_as_prompt_is_moved_back() {
        let (tools, prompts) = catalog();
        let mut phase = Phase::new(1, "x");
        phase.executable_prompt = Some("base_tableList".into());
        phase.arguments.insert("database_name".into(), json!("S"));
        let mut events = Vec::new();
        validate_phase(&mut phase, &tools, &prompts, &mut events);
        assert_eq!(phase.tool_name(), Some("base_tableList"));
        assert!(phase.executable_prompt.is_none());
    }

    #[test]
    fn extraneous_args_removed_and_refinement_flagged() {
        let (tools, prompts) = catalog();
        let mut phase = Phase::new(1, "x")
            .with_tool("base_tableList")
            .with_arg("made_up_parameter", json!(42));
        let mut events = Vec::new();
        validate_phase(&mut phase, &tools, &prompts, &mut events);
        assert!(phase.arguments.is_empty());
        // database_name (required) is missing, so refinement is forced.
        assert!(phase.needs_refinement);
    }

    #[test]
    fn synonym_arguments_survive() {
        let (tools, prompts) = catalog();
        let mut phase = Phase::new(1, "x")
            .with_tool("base_tableList")
            .with_arg("db_name", json!("SALES"));
        let mut events = Vec::new();
        validate_phase(&mut phase, &tools, &prompts, &mut events);
        assert!(phase.arguments.contains_key("db_name"));
        assert!(!phase.needs_refinement);
    }

    #[test]
    fn misspelled_parameter_is_renamed() {
        let (tools, prompts) = catalog();
        let mut phase = Phase::new(1, "x")
            .with_tool("base_tableList")
            .with_arg("databse_name", json!("SALES"));
        let mut events = Vec::new();
        validate_phase(&mut phase, &tools, &prompts, &mut events);
        assert_eq!(phase.arguments.get("database_name"), Some(&json!("SALES")));
        assert!(!phase.needs_refinement);
    }

    #[test]
    fn unrelated_parameter_is_not_renamed() {
        let (tools, prompts) = catalog();
        let mut phase = Phase::new(1, "x")
            .with_tool("base_tableList")
            .with_arg("zzzz", json!(1));
        let mut events = Vec::new();
        validate_phase(&mut phase, &tools, &prompts, &mut events);
        assert!(!phase.arguments.contains_key("zzzz"));
        assert!(phase.needs_refinement);
    }

    #[test]
    fn validation_is_idempotent() {
        let (tools, prompts) = catalog();
        let mut phase = Phase::new(1, "x")
            .with_tool("base_tableList")
            .with_arg("databse_name", json!("SALES"))
            .with_arg("bogus", json!(true));
        let mut events = Vec::new();
        validate_phase(&mut phase, &tools, &prompts, &mut events);
        let snapshot = phase.clone();
        let mut events2 = Vec::new();
        validate_phase(&mut phase, &tools, &prompts, &mut events2);
        assert_eq!(phase, snapshot);
        assert!(events2.is_empty());
    }
}
