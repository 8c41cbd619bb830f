//! Pre-flight orchestrators.
//!
//! Deterministic expanders that turn one declared phase into multiple
//! concrete executions: per-column iteration for column-scoped tools,
//! date-range expansion for temporal phrases, and repair of hallucinated
//! loops over literal string lists.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{Datelike, Duration, NaiveDate};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{json, Map, Value};

use tess_domain::error::Result;
use tess_domain::event::AgentEvent;
use tess_domain::tool::{get_by_canonical_name, synonyms_of, ToolOutput};

use crate::capabilities::TurnCapabilities;
use crate::events::EventBus;
use crate::llm::{LlmRunner, PlanningPhase};

/// Shared context for the orchestrators.
pub struct OrchestratorCtx<'a> {
    pub caps: &'a TurnCapabilities,
    pub bus: &'a EventBus,
    pub runner: &'a LlmRunner,
    pub user_query: &'a str,
    pub constraints: &'a ConstraintCache,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Low-level dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Invoke a protocol tool with intent/result events. Orchestrator
/// sub-calls do not run correction strategies — a failed sub-call is
/// recorded as an error output and iteration continues.
async fn invoke(ctx: &OrchestratorCtx<'_>, tool_name: &str, args: Value) -> ToolOutput {
    ctx.bus
        .emit(AgentEvent::tool_intent(
            "Orchestrated Tool Call",
            tool_name,
            args.clone(),
        ))
        .await;
    let output = match ctx.caps.host.invoke_tool(tool_name, args).await {
        Ok(output) => output,
        Err(e) => ToolOutput::error(tool_name, e.to_string()),
    };
    let event = if output.is_success() {
        AgentEvent::tool_result(tool_name, output.to_value())
    } else {
        AgentEvent::tool_error(tool_name, output.to_value())
    };
    ctx.bus.emit(event).await;
    output
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool constraints (cached LM classification)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Required column data type per tool, classified once per turn with a
/// short LM call and cached.
#[derive(Default)]
pub struct ConstraintCache {
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl ConstraintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `"numeric"`, `"character"`, or `None` (any).
    pub async fn required_type(
        &self,
        tool_name: &str,
        description: &str,
        runner: &LlmRunner,
    ) -> Option<String> {
        if let Some(cached) = self.cache.lock().get(tool_name) {
            return cached.clone();
        }
        let verdict = runner
            .complete(
                PlanningPhase::Tactical,
                "Classifying tool column constraints",
                "Respond with exactly one word: numeric, character, or any.",
                &format!("Tool '{tool_name}': {description}\nWhich column data type does it require?"),
                false,
            )
            .await
            .ok()
            .map(|r| r.trim().to_lowercase());
        let required = match verdict.as_deref() {
            Some(v) if v.contains("numeric") => Some("numeric".to_string()),
            Some(v) if v.contains("character") => Some("character".to_string()),
            _ => None,
        };
        self.cache
            .lock()
            .insert(tool_name.to_string(), required.clone());
        required
    }
}

fn column_type_matches(col_type: &str, required: &str) -> bool {
    let upper = col_type.to_uppercase();
    let is_numeric = ["INT", "NUMERIC", "DECIMAL", "FLOAT", "BYTEINT", "SMALLINT", "BIGINT"]
        .iter()
        .any(|t| upper.contains(t));
    let is_char = ["CHAR", "VARCHAR", "TEXT", "DATE", "TIMESTAMP"]
        .iter()
        .any(|t| upper.contains(t));
    match required {
        "numeric" => is_numeric,
        "character" => is_char,
        _ => true,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Column iteration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Expand table items into `(table, column)` items for a column-scoped
/// tool: fetch each table's columns, filter by the tool's required data
/// type, and merge `column_name` into the item.
pub async fn expand_column_items(
    ctx: &OrchestratorCtx<'_>,
    tool_name: &str,
    database_name: &str,
    tables: &[Value],
) -> Result<Vec<Value>> {
    let description = ctx
        .caps
        .tool(tool_name)
        .map(|t| t.description.clone())
        .unwrap_or_default();
    ctx.bus.emit(AgentEvent::llm_busy()).await;
    let required = ctx
        .constraints
        .required_type(tool_name, &description, ctx.runner)
        .await;
    ctx.bus.emit(AgentEvent::llm_idle()).await;

    let mut expanded = Vec::new();
    ctx.bus.emit(AgentEvent::db_busy()).await;
    for table in tables {
        let Some(table_name) = table
            .as_object()
            .and_then(|t| get_by_canonical_name(t, "object_name"))
            .and_then(Value::as_str)
        else {
            continue;
        };

        let mut args = Map::new();
        args.insert("database_name".into(), json!(database_name));
        for synonym in synonyms_of("object_name") {
            args.insert(synonym.to_string(), json!(table_name));
        }
        let cols = invoke(ctx, "base_columnDescription", Value::Object(args)).await;
        if !cols.is_success() {
            tracing::warn!(table = %table_name, "column discovery failed, skipping table");
            continue;
        }

        for col in &cols.results {
            let Some(col_name) = col.get("ColumnName").and_then(Value::as_str) else {
                continue;
            };
            let col_type = col
                .as_object()
                .and_then(|o| {
                    o.iter()
                        .find(|(k, _)| k.to_lowercase().contains("type"))
                        .and_then(|(_, v)| v.as_str())
                })
                .unwrap_or("UNKNOWN");
            if let Some(required) = &required {
                if col_type != "UNKNOWN" && !column_type_matches(col_type, required) {
                    ctx.bus
                        .emit(AgentEvent::system(
                            "Skipping Incompatible Column",
                            "plan_optimization",
                            json!(format!(
                                "Tool '{tool_name}' requires a {required} column, but '{col_name}' is '{col_type}'. Skipping."
                            )),
                        ))
                        .await;
                    continue;
                }
            }
            let mut item = table.as_object().cloned().unwrap_or_default();
            item.insert("column_name".into(), json!(col_name));
            expanded.push(Value::Object(item));
        }
    }
    ctx.bus.emit(AgentEvent::db_idle()).await;
    Ok(expanded)
}

/// Single-action column iteration: the table comes from the action's own
/// arguments; the tool runs once per compatible column.
pub async fn execute_column_iteration(
    ctx: &OrchestratorCtx<'_>,
    tool_name: &str,
    args: &Map<String, Value>,
) -> Result<Vec<ToolOutput>> {
    let table = get_by_canonical_name(args, "object_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let database = get_by_canonical_name(args, "database_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let table_item = json!({ "TableName": table });
    let items = expand_column_items(ctx, tool_name, &database, &[table_item]).await?;

    let mut outputs = Vec::new();
    for item in items {
        let mut call_args = args.clone();
        if let Some(col) = item.get("column_name") {
            call_args.insert("column_name".into(), col.clone());
        }
        outputs.push(invoke(ctx, tool_name, Value::Object(call_args)).await);
    }
    Ok(outputs)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Date range
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

static N_UNITS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:past|last)\s+(\d+)\s+(hours?|days?|weeks?|months?)").expect("regex")
});
static N_AGO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+(hours?|days?|weeks?|months?)\s+ago").expect("regex"));

/// Resolve a temporal phrase into an inclusive `(start, end)` date pair,
/// anchored at `today`.
pub fn resolve_phrase_range(phrase: &str, today: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    let lower = phrase.to_lowercase();

    if lower.contains("yesterday") {
        let d = today - Duration::days(1);
        return Some((d, d));
    }
    if lower.contains("today") {
        return Some((today, today));
    }
    if let Some(caps) = N_AGO.captures(&lower) {
        let n: i64 = caps[1].parse().ok()?;
        let d = today - Duration::days(unit_days(&caps[2]) * n);
        return Some((d, d));
    }
    if let Some(caps) = N_UNITS.captures(&lower) {
        let n: i64 = caps[1].parse().ok()?;
        let days = unit_days(&caps[2]) * n;
        let start = today - Duration::days((days - 1).max(0));
        return Some((start, today));
    }
    if lower.contains("this week") || lower.contains("current week") {
        let start = today - Duration::days(today.weekday().num_days_from_monday() as i64);
        return Some((start, today));
    }
    if lower.contains("this month") || lower.contains("current month") {
        let start = today.with_day(1)?;
        return Some((start, today));
    }
    if lower.contains("this year") || lower.contains("current year") {
        let start = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;
        return Some((start, today));
    }
    None
}

fn unit_days(unit: &str) -> i64 {
    if unit.starts_with("hour") {
        0
    } else if unit.starts_with("week") {
        7
    } else if unit.starts_with("month") {
        30
    } else {
        1
    }
}

/// Classify the user query as a single-date or range request with a
/// short LM call; heuristic fallback on garbage.
pub async fn classify_date_query(ctx: &OrchestratorCtx<'_>) -> &'static str {
    let verdict = ctx
        .runner
        .complete(
            PlanningPhase::Tactical,
            "Classifying date query",
            "Respond with exactly one word: single or range.",
            &format!(
                "Does this request concern a single date or a range of dates?\n{}",
                ctx.user_query
            ),
            false,
        )
        .await
        .map(|r| r.trim().to_lowercase());
    match verdict {
        Ok(v) if v.contains("single") => "single",
        Ok(v) if v.contains("range") => "range",
        _ => {
            let lower = ctx.user_query.to_lowercase();
            if lower.contains("ago") || lower.contains("yesterday") || lower.contains("today") {
                "single"
            } else {
                "range"
            }
        }
    }
}

/// Resolve and execute a date-driven action. Range-capable tools get the
/// paired parameters wired directly; single-date tools run once per day.
pub async fn execute_date_range(
    ctx: &OrchestratorCtx<'_>,
    tool_name: &str,
    args: &Map<String, Value>,
    date_param: &str,
    phrase: &str,
    tool_supports_range: bool,
) -> Result<Vec<ToolOutput>> {
    let today = ctx.caps.clock.now().date_naive();
    let Some((start, end)) = resolve_phrase_range(phrase, today) else {
        return Ok(vec![ToolOutput::error(
            tool_name,
            format!("could not resolve temporal phrase '{phrase}'"),
        )]);
    };

    let classification = classify_date_query(ctx).await;
    ctx.bus
        .emit(AgentEvent::system(
            "Date Range Orchestrator",
            "plan_optimization",
            json!(format!(
                "Resolved '{phrase}' to {start}..{end} ({classification})."
            )),
        ))
        .await;

    if classification == "single" {
        let mut call_args = args.clone();
        call_args.insert(date_param.into(), json!(end.format("%Y-%m-%d").to_string()));
        return Ok(vec![invoke(ctx, tool_name, Value::Object(call_args)).await]);
    }

    if tool_supports_range {
        let mut call_args = args.clone();
        call_args.remove(date_param);
        call_args.insert("start_date".into(), json!(start.format("%Y-%m-%d").to_string()));
        call_args.insert("end_date".into(), json!(end.format("%Y-%m-%d").to_string()));
        return Ok(vec![invoke(ctx, tool_name, Value::Object(call_args)).await]);
    }

    // Day-by-day iteration.
    let mut outputs = Vec::new();
    let mut current = start;
    while current <= end {
        let mut call_args = args.clone();
        call_args.insert(
            date_param.into(),
            json!(current.format("%Y-%m-%d").to_string()),
        );
        outputs.push(invoke(ctx, tool_name, Value::Object(call_args)).await);
        current += Duration::days(1);
    }
    Ok(outputs)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hallucinated loops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A loop over a literal list of strings: run the tool once per string,
/// merging each string into the best argument slot — the first required
/// parameter the phase left unfilled.
pub async fn execute_hallucinated_loop(
    ctx: &OrchestratorCtx<'_>,
    tool_name: &str,
    args: &Map<String, Value>,
    items: &[String],
) -> Result<Vec<ToolOutput>> {
    let slot = ctx
        .caps
        .tool(tool_name)
        .and_then(|tool| {
            tool.required_args()
                .map(|a| a.name.clone())
                .find(|name| get_by_canonical_name(args, tess_domain::tool::canonical_arg_name(name)).is_none())
        })
        .unwrap_or_else(|| "value".to_string());

    ctx.bus
        .emit(AgentEvent::workaround(
            "System Correction",
            json!({
                "summary": format!(
                    "The plan looped over a literal list of strings. Each item is passed as '{slot}' to '{tool_name}'."
                ),
                "correction_type": "hallucinated_loop"
            }),
        ))
        .await;

    let mut outputs = Vec::new();
    for item in items {
        let mut call_args = args.clone();
        call_args.insert(slot.clone(), json!(item));
        outputs.push(invoke(ctx, tool_name, Value::Object(call_args)).await);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn past_n_days_is_inclusive() {
        let (start, end) = resolve_phrase_range("past 5 days", date(2025, 11, 3)).unwrap();
        assert_eq!(start, date(2025, 10, 30));
        assert_eq!(end, date(2025, 11, 3));
    }

    #[test]
    fn yesterday_is_a_single_day() {
        let (start, end) = resolve_phrase_range("yesterday", date(2025, 11, 3)).unwrap();
        assert_eq!(start, date(2025, 11, 2));
        assert_eq!(start, end);
    }

    #[test]
    fn n_days_ago_is_a_single_day() {
        let (start, end) = resolve_phrase_range("3 days ago", date(2025, 11, 3)).unwrap();
        assert_eq!(start, date(2025, 10, 31));
        assert_eq!(start, end);
    }

    #[test]
    fn last_two_weeks_spans_fourteen_days() {
        let (start, end) = resolve_phrase_range("last 2 weeks", date(2025, 11, 3)).unwrap();
        assert_eq!((end - start).num_days(), 13);
    }

    #[test]
    fn this_month_starts_on_the_first() {
        let (start, end) = resolve_phrase_range("this month", date(2025, 11, 17)).unwrap();
        assert_eq!(start, date(2025, 11, 1));
        assert_eq!(end, date(2025, 11, 17));
    }

    #[test]
    fn hours_collapse_to_today() {
        let (start, end) = resolve_phrase_range("past 6 hours", date(2025, 11, 3)).unwrap();
        assert_eq!(start, date(2025, 11, 3));
        assert_eq!(end, date(2025, 11, 3));
    }

    #[test]
    fn unknown_phrase_is_none() {
        assert!(resolve_phrase_range("sometime soon", date(2025, 11, 3)).is_none());
    }

    #[test]
    fn column_type_matching() {
        assert!(column_type_matches("DECIMAL(10,2)", "numeric"));
        assert!(!column_type_matches("VARCHAR(100)", "numeric"));
        assert!(column_type_matches("VARCHAR(100)", "character"));
        assert!(column_type_matches("TIMESTAMP", "character"));
        assert!(column_type_matches("anything", "any"));
    }
}
