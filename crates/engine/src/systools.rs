//! Engine-side system tools.
//!
//! These capabilities never cross the protocol: date anchoring, date
//! ranges, chart assembly, and the LM-synthesis tools (task execution
//! and the reporting family) are executed here, deterministically where
//! possible. They still appear in the catalog so planning and validation
//! treat them like any other tool.

use chrono::{Duration, NaiveDate};
use serde_json::{json, Map, Value};

use tess_domain::clock::Clock;
use tess_domain::error::Result;
use tess_domain::tool::{names, ArgSpec, ToolDescriptor, ToolOutput};

use crate::llm::{LlmRunner, PlanningPhase};

/// Hard cap on day-by-day range expansion.
const MAX_RANGE_DAYS: i64 = 370;

pub fn is_system_tool(name: &str) -> bool {
    matches!(
        name,
        names::CURRENT_DATE
            | names::DATE_RANGE
            | names::CHARTING
            | names::LLM_TASK
            | names::FINAL_REPORT
            | names::COMPLEX_PROMPT_REPORT
            | names::CONTEXT_REPORT
    )
}

fn arg(name: &str, required: bool, description: &str) -> ArgSpec {
    ArgSpec {
        name: name.into(),
        arg_type: "string".into(),
        required,
        description: description.into(),
    }
}

/// Catalog descriptors for the system tools.
pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: names::CURRENT_DATE.into(),
            description: "Returns the current date, anchoring temporal calculations.".into(),
            args: vec![],
            scope: None,
        },
        ToolDescriptor {
            name: names::DATE_RANGE.into(),
            description: "Expands a start/end pair into the list of covered dates.".into(),
            args: vec![
                arg("start_date", true, "Inclusive range start (YYYY-MM-DD)"),
                arg("end_date", true, "Inclusive range end (YYYY-MM-DD)"),
            ],
            scope: None,
        },
        ToolDescriptor {
            name: names::CHARTING.into(),
            description: "Renders a chart component from tabular data.".into(),
            args: vec![
                arg("chart_type", true, "bar, line, pie, or scatter"),
                arg("title", false, "Chart title"),
                arg("data", false, "Row data; filled from workflow state"),
                arg("mapping", false, "Axis mapping; derived from the data columns"),
            ],
            scope: None,
        },
        ToolDescriptor {
            name: names::LLM_TASK.into(),
            description: "Runs a free-form language-model task over supplied data.".into(),
            args: vec![
                arg("task_description", true, "What to do"),
                arg("source_data", false, "Input data for the task"),
                arg("synthesized_answer", false, "Prior text to rework"),
            ],
            scope: None,
        },
        ToolDescriptor {
            name: names::FINAL_REPORT.into(),
            description: "Synthesizes the final answer from all collected data.".into(),
            args: vec![],
            scope: None,
        },
        ToolDescriptor {
            name: names::COMPLEX_PROMPT_REPORT.into(),
            description: "Synthesizes the final answer for a prompt-library workflow.".into(),
            args: vec![],
            scope: None,
        },
        ToolDescriptor {
            name: names::CONTEXT_REPORT.into(),
            description: "Reports an answer synthesised from retrieved knowledge.".into(),
            args: vec![arg(
                "answer_from_context",
                false,
                "The pre-synthesised answer",
            )],
            scope: None,
        },
    ]
}

/// Execute a system tool.
pub async fn execute(
    name: &str,
    args: &Map<String, Value>,
    runner: &LlmRunner,
    clock: &dyn Clock,
    user_query: &str,
    collected: &[Value],
) -> Result<ToolOutput> {
    match name {
        names::CURRENT_DATE => {
            let today = clock.now().date_naive();
            Ok(ToolOutput::success(
                name,
                vec![json!({ "date": today.format("%Y-%m-%d").to_string() })],
            ))
        }

        names::DATE_RANGE => {
            let start = parse_date_arg(args, "start_date");
            let end = parse_date_arg(args, "end_date");
            match (start, end) {
                (Some(start), Some(end)) if start <= end => {
                    if (end - start).num_days() > MAX_RANGE_DAYS {
                        return Ok(ToolOutput::error(
                            name,
                            format!("date range exceeds {MAX_RANGE_DAYS} days"),
                        ));
                    }
                    Ok(ToolOutput::success(name, expand_range(start, end)))
                }
                _ => Ok(ToolOutput::error(
                    name,
                    "DateRange requires valid start_date and end_date (YYYY-MM-DD)",
                )),
            }
        }

        names::CHARTING => {
            let data = args.get("data").and_then(Value::as_array);
            let mapping = args.get("mapping").and_then(Value::as_object);
            match (data, mapping) {
                (Some(rows), Some(mapping)) if !rows.is_empty() => Ok(ToolOutput::success(
                    name,
                    vec![json!({
                        "chart_type": args.get("chart_type").cloned().unwrap_or(json!("bar")),
                        "title": args.get("title").cloned().unwrap_or(json!("")),
                        "mapping": mapping,
                        "data": rows,
                    })],
                )),
                _ => Ok(ToolOutput::error(
                    name,
                    "Charting requires non-empty 'data' and a 'mapping'",
                )),
            }
        }

        names::LLM_TASK => {
            let task = args
                .get("task_description")
                .and_then(Value::as_str)
                .unwrap_or("Summarise the provided data.");
            let mut prompt = format!("Task: {task}\n");
            if let Some(source) = args.get("source_data") {
                prompt.push_str(&format!(
                    "\nSource data:\n{}",
                    serde_json::to_string_pretty(source)?
                ));
            }
            if let Some(prior) = args.get("synthesized_answer").and_then(Value::as_str) {
                prompt.push_str(&format!("\nText to rework:\n{prior}"));
            }
            let response = runner
                .complete(
                    PlanningPhase::Tactical,
                    "Executing LM task",
                    "You complete data-processing tasks precisely. Output only the result.",
                    &prompt,
                    false,
                )
                .await?;
            Ok(ToolOutput::response(name, response))
        }

        names::FINAL_REPORT | names::COMPLEX_PROMPT_REPORT => {
            let prompt = format!(
                "User request: {user_query}\n\nCollected data:\n{}\n\n\
                 Write the final answer in markdown. Ground every figure in the collected data.",
                serde_json::to_string_pretty(&Value::Array(collected.to_vec()))?
            );
            let response = runner
                .complete(
                    PlanningPhase::Tactical,
                    "Synthesizing final report",
                    "You write precise, well-structured reports from collected data.",
                    &prompt,
                    false,
                )
                .await?;
            Ok(ToolOutput::response(name, response))
        }

        names::CONTEXT_REPORT => {
            let answer = args
                .get("answer_from_context")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if answer.is_empty() {
                Ok(ToolOutput::error(
                    name,
                    "ContextReport has no answer_from_context",
                ))
            } else {
                Ok(ToolOutput::response(name, answer))
            }
        }

        other => Ok(ToolOutput::error(
            other,
            format!("unknown system tool '{other}'"),
        )),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Date helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

fn parse_date_arg(args: &Map<String, Value>, key: &str) -> Option<NaiveDate> {
    args.get(key).and_then(Value::as_str).and_then(parse_date)
}

fn expand_range(start: NaiveDate, end: NaiveDate) -> Vec<Value> {
    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(json!({ "date": current.format("%Y-%m-%d").to_string() }));
        current += Duration::days(1);
    }
    dates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_runner;
    use tess_domain::clock::FixedClock;

    #[tokio::test]
    async fn current_date_uses_the_clock() {
        let (runner, _bus) = test_runner(&[]);
        let clock = FixedClock::new(
            NaiveDate::from_ymd_opt(2025, 11, 3)
                .unwrap()
                .and_hms_opt(9, 30, 0)
                .unwrap()
                .and_utc(),
        );
        let out = execute(names::CURRENT_DATE, &Map::new(), &runner, &clock, "", &[])
            .await
            .unwrap();
        assert_eq!(out.results[0]["date"], "2025-11-03");
    }

    #[tokio::test]
    async fn date_range_expands_inclusive() {
        let (runner, _bus) = test_runner(&[]);
        let clock = FixedClock::epoch();
        let mut args = Map::new();
        args.insert("start_date".into(), json!("2025-01-30"));
        args.insert("end_date".into(), json!("2025-02-02"));
        let out = execute(names::DATE_RANGE, &args, &runner, &clock, "", &[])
            .await
            .unwrap();
        let dates: Vec<&str> = out
            .results
            .iter()
            .map(|r| r["date"].as_str().unwrap())
            .collect();
        assert_eq!(dates, vec!["2025-01-30", "2025-01-31", "2025-02-01", "2025-02-02"]);
    }

    #[tokio::test]
    async fn date_range_rejects_inverted_bounds() {
        let (runner, _bus) = test_runner(&[]);
        let clock = FixedClock::epoch();
        let mut args = Map::new();
        args.insert("start_date".into(), json!("2025-02-02"));
        args.insert("end_date".into(), json!("2025-01-30"));
        let out = execute(names::DATE_RANGE, &args, &runner, &clock, "", &[])
            .await
            .unwrap();
        assert!(!out.is_success());
    }

    #[tokio::test]
    async fn charting_requires_data_and_mapping() {
        let (runner, _bus) = test_runner(&[]);
        let clock = FixedClock::epoch();
        let mut args = Map::new();
        args.insert("chart_type".into(), json!("bar"));
        let out = execute(names::CHARTING, &args, &runner, &clock, "", &[])
            .await
            .unwrap();
        assert!(!out.is_success());

        args.insert("data".into(), json!([{ "name": "a", "revenue": 10 }]));
        args.insert("mapping".into(), json!({ "x_axis": "name", "y_axis": "revenue" }));
        let out = execute(names::CHARTING, &args, &runner, &clock, "", &[])
            .await
            .unwrap();
        assert!(out.is_success());
        assert_eq!(out.results[0]["mapping"]["x_axis"], "name");
    }

    #[tokio::test]
    async fn final_report_synthesises_from_collected_data() {
        let (runner, _bus) = test_runner(&["The database holds 3 tables."]);
        let clock = FixedClock::epoch();
        let collected = vec![json!({ "results": [{"TableName": "A"}] })];
        let out = execute(
            names::FINAL_REPORT,
            &Map::new(),
            &runner,
            &clock,
            "list tables",
            &collected,
        )
        .await
        .unwrap();
        assert_eq!(out.results[0]["response"], "The database holds 3 tables.");
    }

    #[tokio::test]
    async fn context_report_passes_answer_through() {
        let (runner, _bus) = test_runner(&[]);
        let clock = FixedClock::epoch();
        let mut args = Map::new();
        args.insert("answer_from_context".into(), json!("Retention is 90 days."));
        let out = execute(names::CONTEXT_REPORT, &args, &runner, &clock, "", &[])
            .await
            .unwrap();
        assert_eq!(out.results[0]["response"], "Retention is 90 days.");
    }
}
