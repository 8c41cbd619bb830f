//! Semantic plan rewrites.
//!
//! Eleven passes in fixed order, each idempotent. Passes that consult
//! the LM (consolidation, loop classification, chart-intent similarity,
//! context synthesis) do so through [`PlanLlm`], so the whole pipeline
//! is deterministic given fixed LM outputs. Phases are renumbered
//! contiguously after the final pass.

use serde_json::{json, Map, Value};

use tess_domain::error::Result;
use tess_domain::event::AgentEvent;
use tess_domain::plan::{
    parse_phase_ref, renumber, Phase, Placeholder, INJECTED_PREVIOUS_TURN_DATA,
};
use tess_domain::tool::{names, PromptCatalog, ToolCatalog};

use crate::parse::extract_json;
use crate::planner::PlanLlm;
use crate::temporal;
use crate::validate;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the rewriters need to know about the previous turn.
#[derive(Debug, Clone, Default)]
pub struct PreviousTurnContext {
    pub user_query: String,
    /// Tools used by the previous turn's data phases.
    pub data_tools: Vec<String>,
    /// SQL texts the previous turn executed, for the similarity fallback.
    pub sql_texts: Vec<String>,
    /// The most recent successful tool output of the previous turn.
    pub last_successful_result: Option<Value>,
}

/// Everything the rewrite pipeline consumes for one plan.
pub struct RewriteContext<'a> {
    pub user_query: &'a str,
    pub tools: &'a ToolCatalog,
    pub prompts: &'a PromptCatalog,
    pub knowledge_context: &'a str,
    pub previous_turn: Option<&'a PreviousTurnContext>,
    pub sql_optimization: bool,
    /// Sub-process plans skip the final-report guarantee.
    pub is_sub_process: bool,
    /// Active prompt-library flow, if any — switches the appended report
    /// to `ComplexPromptReport`.
    pub active_prompt: Option<&'a str>,
    pub llm: &'a dyn PlanLlm,
    /// Seed values injected into workflow state before execution
    /// (previous-turn hydration writes here).
    pub workflow_seed: &'a mut Map<String, Value>,
}

/// Run the full rewrite pipeline.
pub async fn rewrite_plan(
    mut plan: Vec<Phase>,
    ctx: &mut RewriteContext<'_>,
    events: &mut Vec<AgentEvent>,
) -> Result<Vec<Phase>> {
    inject_temporal_context(&mut plan, ctx, events);
    if ctx.sql_optimization {
        consolidate_sql(&mut plan, ctx, events).await?;
    }
    rewrite_multi_loop_synthesis(&mut plan, events);
    rewrite_llm_task_loops(&mut plan, ctx, events).await?;
    rewrite_date_range_loops(&mut plan, ctx, events);
    validate::validate_plan(&mut plan, ctx.tools, ctx.prompts, events);
    collapse_chart_data_refetch(&mut plan, ctx, events).await?;
    clean_charting_phases(&mut plan, events);
    hydrate_from_previous_turn(&mut plan, ctx, events);
    synthesize_empty_context_report(&mut plan, ctx, events).await?;
    ensure_final_report(&mut plan, ctx, events);
    renumber(&mut plan);
    Ok(plan)
}

fn optimization(events: &mut Vec<AgentEvent>, details: Value) {
    events.push(AgentEvent::system(
        "Plan Optimization",
        "plan_optimization",
        details,
    ));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 1: temporal data flow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inject a `CurrentDate` anchor phase for temporal queries, then wire
/// the user's temporal phrase into any later data phase whose tool has a
/// date-shaped parameter with no date argument provided. The phrase is a
/// marker the date-range orchestrator resolves at execution time.
fn inject_temporal_context(
    plan: &mut Vec<Phase>,
    ctx: &RewriteContext<'_>,
    events: &mut Vec<AgentEvent>,
) {
    if plan.is_empty() || !temporal::is_temporal_query(ctx.user_query) {
        return;
    }

    let has_current_date = plan
        .iter()
        .any(|p| p.tool_name() == Some(names::CURRENT_DATE));
    if !has_current_date {
        tracing::info!("temporal query detected, injecting current-date phase");
        let anchor = Phase::new(1, "Establish current date as temporal context")
            .with_tool(names::CURRENT_DATE);
        plan.insert(0, anchor);
        renumber(plan);
        optimization(
            events,
            json!({
                "summary": "Temporal query detected. A current-date phase was injected to anchor date calculations.",
                "correction_type": "temporal_context_injection"
            }),
        );
    }

    let Some(phrase) = temporal::extract_phrase(ctx.user_query) else {
        return;
    };

    for phase in plan.iter_mut() {
        let Some(tool) = phase.tool_name().and_then(|n| ctx.tools.get(n)) else {
            continue;
        };
        if tool.name == names::CURRENT_DATE || tool.name == names::DATE_RANGE {
            continue;
        }
        let Some(date_param) = tool.date_param().map(str::to_owned) else {
            continue;
        };
        let has_date_arg = phase
            .arguments
            .keys()
            .any(|k| k.to_lowercase().contains("date"));
        if has_date_arg {
            continue;
        }
        tracing::debug!(phase = phase.phase, param = %date_param, phrase = %phrase, "temporal phrase injected");
        phase
            .arguments
            .insert(date_param.clone(), Value::String(phrase.clone()));
        optimization(
            events,
            json!({
                "summary": format!(
                    "Injected the temporal phrase '{phrase}' into '{date_param}' so the date-range orchestrator can resolve it."
                ),
                "correction_type": "temporal_data_flow"
            }),
        );
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 2: SQL consolidation (opt-in)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn sql_text_of(phase: &Phase) -> Option<&str> {
    tess_domain::tool::get_by_canonical_name(&phase.arguments, "sql_text").and_then(Value::as_str)
}

/// Merge a contiguous run of SQL-reading phases into one query via a
/// short LM call. A failed or unparseable merge leaves the run intact.
async fn consolidate_sql(
    plan: &mut Vec<Phase>,
    ctx: &RewriteContext<'_>,
    events: &mut Vec<AgentEvent>,
) -> Result<()> {
    // Find the first contiguous run of >= 2 phases carrying SQL text.
    let mut run_start = None;
    let mut run_len = 0usize;
    for (idx, phase) in plan.iter().enumerate() {
        if !phase.is_loop() && sql_text_of(phase).is_some() {
            if run_start.is_none() {
                run_start = Some(idx);
            }
            run_len += 1;
        } else if run_len >= 2 {
            break;
        } else {
            run_start = None;
            run_len = 0;
        }
    }
    let Some(start) = run_start else { return Ok(()) };
    if run_len < 2 {
        return Ok(());
    }

    let run = &plan[start..start + run_len];
    let queries: Vec<&str> = run.iter().filter_map(sql_text_of).collect();
    let goals: Vec<&str> = run.iter().map(|p| p.goal.as_str()).collect();

    let prompt = format!(
        "The following SQL queries run back-to-back against the same database and their \
         results feed one analysis. Merge them into a single efficient query that returns \
         all required columns.\n\nGoals:\n{}\n\nQueries:\n{}\n\n\
         Respond with a JSON object: {{\"sql\": \"<merged query>\"}}",
        goals.join("\n"),
        queries.join(";\n")
    );
    let response = ctx
        .llm
        .complete(
            "Consolidating SQL phases",
            "strategic",
            "You are an expert SQL engineer. Merge queries without changing their meaning.",
            &prompt,
        )
        .await?;

    let Some(merged) = extract_json(&response)
        .and_then(|v| v.get("sql").and_then(Value::as_str).map(str::to_owned))
    else {
        tracing::warn!("SQL consolidation reply had no usable query, leaving plan unchanged");
        return Ok(());
    };

    let mut merged_phase = run[0].clone();
    merged_phase.goal = format!("Consolidated query: {}", goals.join("; "));
    let sql_key = merged_phase
        .arguments
        .keys()
        .find(|k| tess_domain::tool::canonical_arg_name(k) == "sql_text")
        .cloned()
        .unwrap_or_else(|| "sql_text".into());
    merged_phase.arguments.insert(sql_key, Value::String(merged));

    plan.splice(start..start + run_len, [merged_phase]);
    renumber(plan);
    optimization(
        events,
        json!({
            "summary": format!("Merged {run_len} consecutive SQL phases into one query."),
            "correction_type": "sql_consolidation"
        }),
    );
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 3: multi-loop synthesis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Two or more sibling loops over the same source feeding one
/// LM-synthesis phase drown the summary in raw rows. Insert a per-item
/// distillation loop and point the summary at the distilled result.
fn rewrite_multi_loop_synthesis(plan: &mut Vec<Phase>, events: &mut Vec<AgentEvent>) {
    // Group loop phases by their (string) loop source.
    let mut source: Option<String> = None;
    let mut loop_indices: Vec<usize> = Vec::new();
    for (idx, phase) in plan.iter().enumerate() {
        if !phase.is_loop() || phase.tool_name() == Some(names::LLM_TASK) {
            continue;
        }
        let Some(src) = phase.loop_over.as_ref().and_then(Value::as_str) else {
            continue;
        };
        match &source {
            None => {
                source = Some(src.to_string());
                loop_indices.push(idx);
            }
            Some(existing) if existing == src => loop_indices.push(idx),
            Some(_) => {}
        }
    }
    if loop_indices.len() < 2 {
        return;
    }
    let Some(source) = source else { return };

    // The synthesis phase must follow the loops.
    let last_loop = *loop_indices.last().unwrap_or(&0);
    let Some(synth_idx) = plan
        .iter()
        .position(|p| !p.is_loop() && p.tool_name() == Some(names::LLM_TASK))
        .filter(|idx| *idx > last_loop)
    else {
        return;
    };

    // Already rewritten: the synthesis phase points at a distillation loop.
    let loop_result_keys: Vec<String> = loop_indices
        .iter()
        .map(|idx| tess_domain::plan::result_key(plan[*idx].phase))
        .collect();
    let references_loops = plan[synth_idx].arguments.values().any(|v| {
        let raw = v.to_string();
        loop_result_keys.iter().any(|k| raw.contains(k.as_str()))
    });
    let already_distilled = plan[..synth_idx]
        .iter()
        .any(|p| p.is_loop() && p.tool_name() == Some(names::LLM_TASK));
    if already_distilled || !references_loops {
        return;
    }

    let mut distill = Phase::new(0, "Distill the gathered metrics for each item")
        .with_tool(names::LLM_TASK)
        .with_arg(
            "task_description",
            json!(
                "Produce a compact per-item summary of the collected results, keeping every figure needed for the final report."
            ),
        )
        .with_arg("source_data", json!(loop_result_keys));
    distill.phase_type = Some("loop".into());
    distill.loop_over = Some(Value::String(source));

    plan.insert(synth_idx, distill);
    renumber(plan);
    let distill_key = tess_domain::plan::result_key(plan[synth_idx].phase);

    // Point the synthesis phase at the distilled output.
    let synth = &mut plan[synth_idx + 1];
    synth.arguments.insert(
        "source_data".into(),
        Placeholder::new(distill_key, None).to_value(),
    );

    optimization(
        events,
        json!({
            "summary": "Multiple loops feed one synthesis phase. A per-item distillation phase was inserted so the final summary reads distilled results instead of raw rows.",
            "correction_type": "multi_loop_synthesis"
        }),
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 4: inefficient LM-task loops
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A loop that runs `LlmTask` once per item is wasteful when the task is
/// an aggregation — classify it with a short LM call and collapse
/// aggregations into a single phase over the whole source.
async fn rewrite_llm_task_loops(
    plan: &mut [Phase],
    ctx: &RewriteContext<'_>,
    events: &mut Vec<AgentEvent>,
) -> Result<()> {
    for phase in plan.iter_mut() {
        if !phase.is_loop() || phase.tool_name() != Some(names::LLM_TASK) {
            continue;
        }
        let Some(source) = phase.loop_over.clone() else { continue };
        let task = phase
            .arguments
            .get("task_description")
            .and_then(Value::as_str)
            .unwrap_or(&phase.goal)
            .to_string();

        let response = ctx
            .llm
            .complete(
                "Classifying LM-task loop",
                "strategic",
                "Classify the task. Respond with exactly one word: aggregation or synthesis.",
                &format!("Task description: {task}"),
            )
            .await?;
        let verdict = response.trim().to_lowercase();
        if !verdict.contains("aggregation") {
            continue;
        }

        tracing::info!(phase = phase.phase, "collapsing aggregation loop into a single task");
        phase.phase_type = None;
        phase.loop_over = None;
        let source_value = match source {
            Value::String(key) => Placeholder::new(key, None).to_value(),
            other => other,
        };
        phase.arguments.insert("source_data".into(), source_value);
        optimization(
            events,
            json!({
                "summary": "An LM task looping per item was classified as an aggregation and collapsed into a single call over the full source data.",
                "correction_type": "llm_task_loop_collapse"
            }),
        );
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 5: date-range loop repair
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn depends_on(phase: &Phase, key: &str) -> bool {
    if phase.loop_over.as_ref().and_then(Value::as_str) == Some(key) {
        return true;
    }
    phase.arguments.values().any(|v| match v {
        Value::String(s) => s == key,
        other => Placeholder::from_value(other).is_some_and(|p| p.source == key),
    })
}

/// A `DateRange` phase followed by a dependent data phase: wire paired
/// range parameters directly when the tool has them, otherwise convert
/// the dependent phase into a loop over the produced dates.
fn rewrite_date_range_loops(
    plan: &mut [Phase],
    ctx: &RewriteContext<'_>,
    events: &mut Vec<AgentEvent>,
) {
    let range_phases: Vec<(usize, u32)> = plan
        .iter()
        .enumerate()
        .filter(|(_, p)| p.tool_name() == Some(names::DATE_RANGE))
        .map(|(idx, p)| (idx, p.phase))
        .collect();

    for (range_idx, range_num) in range_phases {
        let key = tess_domain::plan::result_key(range_num);
        for idx in range_idx + 1..plan.len() {
            if !depends_on(&plan[idx], &key) {
                continue;
            }
            let supports_range = plan[idx]
                .tool_name()
                .and_then(|n| ctx.tools.get(n))
                .is_some_and(|t| t.supports_date_range());
            let phase = &mut plan[idx];
            if supports_range {
                if Placeholder::from_value(
                    phase.arguments.get("start_date").unwrap_or(&Value::Null),
                )
                .is_some()
                {
                    continue; // already wired
                }
                phase.arguments.insert(
                    "start_date".into(),
                    Placeholder::new(key.clone(), Some("start_date".into())).to_value(),
                );
                phase.arguments.insert(
                    "end_date".into(),
                    Placeholder::new(key.clone(), Some("end_date".into())).to_value(),
                );
                phase.phase_type = None;
                phase.loop_over = None;
                optimization(
                    events,
                    json!({
                        "summary": "A range-capable tool follows a date-range phase. Its start/end parameters were wired directly to the range result.",
                        "correction_type": "date_range_direct_wiring"
                    }),
                );
            } else if !phase.is_loop() {
                phase.phase_type = Some("loop".into());
                phase.loop_over = Some(Value::String(key.clone()));
                if let Some(date_param) = phase
                    .tool_name()
                    .and_then(|n| ctx.tools.get(n))
                    .and_then(|t| t.date_param())
                    .map(str::to_owned)
                {
                    phase.arguments.insert(
                        date_param,
                        Placeholder::new("loop_item", Some("date".into())).to_value(),
                    );
                }
                optimization(
                    events,
                    json!({
                        "summary": "A single-date tool depends on a date-range result. The phase was converted into a loop over the produced dates.",
                        "correction_type": "date_range_loop_conversion"
                    }),
                );
            }
            break;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 7: chart-data reuse collapse
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const CHART_WORDS: &[&str] = &["chart", "graph", "plot", "visuali"];

fn is_chart_only_query(query: &str) -> bool {
    let lower = query.to_lowercase();
    CHART_WORDS.iter().any(|w| lower.contains(w))
        && !lower.contains("fetch")
        && !lower.contains("recalculate")
        && !lower.contains("refresh")
}

/// Token-overlap fallback for the similarity check. Conservative: only
/// collapses on a strong overlap.
fn sql_overlap(current: &[String], previous: &[String]) -> f64 {
    let tokens = |texts: &[String]| -> std::collections::HashSet<String> {
        texts
            .iter()
            .flat_map(|t| {
                t.to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .collect()
    };
    let a = tokens(current);
    let b = tokens(previous);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count() as f64;
    shared / a.len().max(b.len()) as f64
}

/// When the current query is chart-only and the previous turn already
/// produced the same data from the same tools, drop the redundant
/// data-fetch phases — the charting bypass reads the prior turn's rows.
async fn collapse_chart_data_refetch(
    plan: &mut Vec<Phase>,
    ctx: &RewriteContext<'_>,
    events: &mut Vec<AgentEvent>,
) -> Result<()> {
    if ctx.is_sub_process || !is_chart_only_query(ctx.user_query) {
        return Ok(());
    }
    let Some(previous) = ctx.previous_turn else { return Ok(()) };
    if previous.last_successful_result.is_none() {
        return Ok(());
    }
    if !plan.iter().any(|p| p.tool_name() == Some(names::CHARTING)) {
        return Ok(());
    }

    let fetch_indices: Vec<usize> = plan
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            p.capability().is_some_and(|c| {
                !names::is_reporting(c) && c != names::CHARTING && c != names::CURRENT_DATE
            })
        })
        .map(|(idx, _)| idx)
        .collect();
    if fetch_indices.is_empty() {
        return Ok(());
    }

    // Same tools as the previous turn?
    let all_known = plan
        .iter()
        .enumerate()
        .filter(|(idx, _)| fetch_indices.contains(idx))
        .all(|(_, p)| {
            p.tool_name()
                .is_some_and(|t| previous.data_tools.iter().any(|d| d == t))
        });
    if !all_known {
        return Ok(());
    }

    // Intent similarity: LM verdict first, token overlap as the
    // conservative fallback.
    let response = ctx
        .llm
        .complete(
            "Comparing chart query intent",
            "strategic",
            "Answer with exactly one word: yes or no.",
            &format!(
                "Previous request: {}\nCurrent request: {}\n\
                 Does the current request visualise the same data the previous request produced?",
                previous.user_query, ctx.user_query
            ),
        )
        .await;
    let similar = match response {
        Ok(text) => text.trim().to_lowercase().starts_with("yes"),
        Err(_) => {
            let current_sql: Vec<String> = plan
                .iter()
                .filter_map(|p| sql_text_of(p).map(str::to_owned))
                .collect();
            sql_overlap(&current_sql, &previous.sql_texts) >= 0.6
        }
    };
    if !similar {
        return Ok(());
    }

    let removed = fetch_indices.len();
    let mut idx = 0usize;
    plan.retain(|_| {
        let keep = !fetch_indices.contains(&idx);
        idx += 1;
        keep
    });
    renumber(plan);
    optimization(
        events,
        json!({
            "summary": format!(
                "The previous turn already produced this data. {removed} redundant data-fetch phase(s) were removed; the chart reuses the prior results."
            ),
            "correction_type": "chart_data_reuse"
        }),
    );
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 8: charting cleanup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The strategic planner cannot know real column names — data phases have
/// not executed yet — so `mapping` and `data` on `Charting` phases are
/// hallucinated. Strip them; the executor's charting bypass rebuilds both
/// from actual rows.
fn clean_charting_phases(plan: &mut [Phase], events: &mut Vec<AgentEvent>) {
    for phase in plan.iter_mut() {
        if phase.tool_name() != Some(names::CHARTING) {
            continue;
        }
        let mut stripped = Vec::new();
        for arg in ["mapping", "data"] {
            if phase.arguments.remove(arg).is_some() {
                stripped.push(arg);
            }
        }
        if !stripped.is_empty() {
            optimization(
                events,
                json!({
                    "summary": format!(
                        "Removed planner-supplied {} from the charting phase; the executor derives them from actual result columns.",
                        stripped.join(" and ")
                    ),
                    "correction_type": "charting_cleanup"
                }),
            );
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 9: previous-turn hydration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A first phase that loops over a result no earlier phase produces is a
/// cross-turn continuation. Pull the previous turn's most recent
/// successful result into workflow state and rewrite the loop source.
fn hydrate_from_previous_turn(
    plan: &mut [Phase],
    ctx: &mut RewriteContext<'_>,
    events: &mut Vec<AgentEvent>,
) {
    let Some(first) = plan.first_mut() else { return };
    if !first.is_loop() {
        return;
    }
    let Some(source) = first.loop_over.as_ref().and_then(Value::as_str) else {
        return;
    };
    let Some(referenced) = parse_phase_ref(source) else {
        return;
    };
    if referenced < first.phase {
        return; // backward reference, legitimately bound by a prior phase
    }
    let Some(result) = ctx
        .previous_turn
        .and_then(|p| p.last_successful_result.clone())
    else {
        return;
    };

    tracing::info!(source = %source, "hydrating forward-referenced loop from previous turn");
    ctx.workflow_seed
        .insert(INJECTED_PREVIOUS_TURN_DATA.to_string(), result);
    first.loop_over = Some(Value::String(INJECTED_PREVIOUS_TURN_DATA.into()));
    optimization(
        events,
        json!({
            "summary": "The first phase looped over a result this turn never produces. The previous turn's data was carried forward and the loop re-pointed at it.",
            "correction_type": "previous_turn_hydration"
        }),
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 10: empty-context-report synthesis
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `ContextReport` with no `answer_from_context` would reach the executor
/// with nothing to say. Synthesise the answer from retrieved knowledge
/// now, so execution can bypass the tactical LM entirely.
async fn synthesize_empty_context_report(
    plan: &mut [Phase],
    ctx: &RewriteContext<'_>,
    events: &mut Vec<AgentEvent>,
) -> Result<()> {
    for phase in plan.iter_mut() {
        if phase.tool_name() != Some(names::CONTEXT_REPORT) {
            continue;
        }
        let empty = phase
            .arguments
            .get("answer_from_context")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty);
        if !empty || ctx.knowledge_context.is_empty() {
            continue;
        }

        let answer = ctx
            .llm
            .complete(
                "Synthesizing context report",
                "strategic",
                "Answer the user's question strictly from the provided context. Do not invent facts.",
                &format!(
                    "Context:\n{}\n\nQuestion: {}",
                    ctx.knowledge_context, ctx.user_query
                ),
            )
            .await?;
        phase
            .arguments
            .insert("answer_from_context".into(), Value::String(answer));
        optimization(
            events,
            json!({
                "summary": "The context-report phase had no answer. One was synthesised from the retrieved knowledge context.",
                "correction_type": "context_report_synthesis"
            }),
        );
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pass 11: final-report guarantee
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every top-level plan must end in a reporting phase; sub-process plans
/// are exempt (their output feeds the parent, not the user).
fn ensure_final_report(
    plan: &mut Vec<Phase>,
    ctx: &RewriteContext<'_>,
    events: &mut Vec<AgentEvent>,
) {
    if ctx.is_sub_process || plan.is_empty() {
        return;
    }
    if plan.last().is_some_and(Phase::is_reporting) {
        return;
    }
    let report_tool = if ctx.active_prompt.is_some() {
        names::COMPLEX_PROMPT_REPORT
    } else {
        names::FINAL_REPORT
    };
    let next = plan.last().map(|p| p.phase + 1).unwrap_or(1);
    plan.push(
        Phase::new(next, "Synthesize the final answer from all collected data")
            .with_tool(report_tool),
    );
    optimization(
        events,
        json!({
            "summary": format!("The plan did not end with a report. A {report_tool} phase was appended."),
            "correction_type": "final_report_guarantee"
        }),
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::test_support::QueuedLlm;
    use tess_domain::tool::{ArgSpec, ToolDescriptor};

    fn tool(name: &str, args: &[(&str, bool)]) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: String::new(),
            args: args
                .iter()
                .map(|(n, required)| ArgSpec {
                    name: (*n).into(),
                    arg_type: "string".into(),
                    required: *required,
                    description: String::new(),
                })
                .collect(),
            scope: None,
        }
    }

    fn catalog() -> ToolCatalog {
        ToolCatalog::new(vec![
            tool("base_tableList", &[("database_name", true)]),
            tool(
                "sales_byDay",
                &[("database_name", true), ("date", true)],
            ),
            tool(
                "sales_range",
                &[("database_name", true), ("start_date", true), ("end_date", true)],
            ),
            tool("base_readQuery", &[("sql_text", true)]),
            tool(names::CHARTING, &[("chart_type", false), ("data", false), ("mapping", false), ("title", false)]),
            tool(names::CURRENT_DATE, &[]),
            tool(names::DATE_RANGE, &[]),
            tool(names::LLM_TASK, &[("task_description", true), ("source_data", false)]),
            tool(names::FINAL_REPORT, &[]),
            tool(names::CONTEXT_REPORT, &[("answer_from_context", false)]),
        ])
    }

    async fn run(
        plan: Vec<Phase>,
        query: &str,
        llm: &QueuedLlm,
        previous: Option<&PreviousTurnContext>,
    ) -> (Vec<Phase>, Vec<AgentEvent>, Map<String, Value>) {
        let tools = catalog();
        let prompts = PromptCatalog::default();
        let mut seed = Map::new();
        let mut events = Vec::new();
        let mut ctx = RewriteContext {
            user_query: query,
            tools: &tools,
            prompts: &prompts,
            knowledge_context: "",
            previous_turn: previous,
            sql_optimization: false,
            is_sub_process: false,
            active_prompt: None,
            llm,
            workflow_seed: &mut seed,
        };
        let plan = rewrite_plan(plan, &mut ctx, &mut events).await.unwrap();
        (plan, events, seed)
    }

    #[tokio::test]
    async fn temporal_query_gets_current_date_anchor_and_phrase() {
        let plan = vec![Phase::new(1, "Fetch sales")
            .with_tool("sales_byDay")
            .with_arg("database_name", json!("SALES"))];
        let llm = QueuedLlm::default();
        let (plan, _, _) = run(plan, "sales in the past 5 days", &llm, None).await;

        assert_eq!(plan[0].tool_name(), Some(names::CURRENT_DATE));
        assert_eq!(plan[1].arguments["date"], json!("past 5 days"));
        // Final report appended, numbering contiguous.
        assert_eq!(plan.last().unwrap().tool_name(), Some(names::FINAL_REPORT));
        let numbers: Vec<u32> = plan.iter().map(|p| p.phase).collect();
        assert_eq!(numbers, (1..=plan.len() as u32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn final_report_not_duplicated() {
        let plan = vec![
            Phase::new(1, "List")
                .with_tool("base_tableList")
                .with_arg("database_name", json!("S")),
            Phase::new(2, "Report").with_tool(names::FINAL_REPORT),
        ];
        let llm = QueuedLlm::default();
        let (plan, _, _) = run(plan, "list tables", &llm, None).await;
        let reports = plan
            .iter()
            .filter(|p| p.tool_name() == Some(names::FINAL_REPORT))
            .count();
        assert_eq!(reports, 1);
    }

    #[tokio::test]
    async fn date_range_dependent_wired_directly_when_supported() {
        let plan = vec![
            Phase::new(1, "Range").with_tool(names::DATE_RANGE),
            Phase::new(2, "Fetch")
                .with_tool("sales_range")
                .with_arg("database_name", json!("S"))
                .with_arg("start_date", json!("result_of_phase_1")),
        ];
        let llm = QueuedLlm::default();
        let (plan, _, _) = run(plan, "list tables", &llm, None).await;
        assert_eq!(
            plan[1].arguments["start_date"],
            json!({ "source": "result_of_phase_1", "key": "start_date" })
        );
        assert_eq!(
            plan[1].arguments["end_date"],
            json!({ "source": "result_of_phase_1", "key": "end_date" })
        );
    }

    #[tokio::test]
    async fn date_range_dependent_becomes_loop_when_single_date() {
        let plan = vec![
            Phase::new(1, "Range").with_tool(names::DATE_RANGE),
            Phase::new(2, "Fetch")
                .with_tool("sales_byDay")
                .with_arg("database_name", json!("S"))
                .with_arg("date", json!("result_of_phase_1")),
        ];
        let llm = QueuedLlm::default();
        let (plan, _, _) = run(plan, "list tables", &llm, None).await;
        assert!(plan[1].is_loop());
        assert_eq!(plan[1].loop_over, Some(json!("result_of_phase_1")));
        assert_eq!(
            plan[1].arguments["date"],
            json!({ "source": "loop_item", "key": "date" })
        );
    }

    #[tokio::test]
    async fn charting_mapping_and_data_are_stripped() {
        let plan = vec![
            Phase::new(1, "Fetch")
                .with_tool("base_tableList")
                .with_arg("database_name", json!("S")),
            Phase::new(2, "Chart")
                .with_tool(names::CHARTING)
                .with_arg("chart_type", json!("bar"))
                .with_arg("mapping", json!({ "x": "guess" }))
                .with_arg("data", json!("result_of_phase_1")),
        ];
        let llm = QueuedLlm::default();
        let (plan, _, _) = run(plan, "list tables", &llm, None).await;
        assert!(!plan[1].arguments.contains_key("mapping"));
        assert!(!plan[1].arguments.contains_key("data"));
        assert!(plan[1].arguments.contains_key("chart_type"));
    }

    #[tokio::test]
    async fn chart_only_followup_drops_refetch() {
        let plan = vec![
            Phase::new(1, "Fetch top customers")
                .with_tool("base_readQuery")
                .with_arg("sql_text", json!("SELECT name, revenue FROM customers")),
            Phase::new(2, "Chart").with_tool(names::CHARTING).with_arg("chart_type", json!("bar")),
        ];
        let llm = QueuedLlm::default();
        llm.queue("yes");
        let previous = PreviousTurnContext {
            user_query: "top 5 customers by revenue".into(),
            data_tools: vec!["base_readQuery".into()],
            sql_texts: vec!["SELECT name, revenue FROM customers".into()],
            last_successful_result: Some(json!({ "status": "success", "results": [] })),
        };
        let (plan, _, _) = run(plan, "show me a bar chart", &llm, Some(&previous)).await;
        assert_eq!(plan[0].tool_name(), Some(names::CHARTING));
        assert_eq!(plan[0].phase, 1);
    }

    #[tokio::test]
    async fn chart_collapse_skipped_when_intent_differs() {
        let plan = vec![
            Phase::new(1, "Fetch products")
                .with_tool("base_readQuery")
                .with_arg("sql_text", json!("SELECT product, total FROM products")),
            Phase::new(2, "Chart").with_tool(names::CHARTING),
        ];
        let llm = QueuedLlm::default();
        llm.queue("no");
        let previous = PreviousTurnContext {
            user_query: "top 5 customers by revenue".into(),
            data_tools: vec!["base_readQuery".into()],
            sql_texts: vec!["SELECT name, revenue FROM customers".into()],
            last_successful_result: Some(json!({})),
        };
        let (plan, _, _) = run(plan, "chart the product totals", &llm, Some(&previous)).await;
        assert_eq!(plan[0].tool_name(), Some("base_readQuery"));
    }

    #[tokio::test]
    async fn aggregation_loop_collapses() {
        let mut looped = Phase::new(1, "Summarize rows")
            .with_tool(names::LLM_TASK)
            .with_arg("task_description", json!("Count the failures per table"));
        looped.phase_type = Some("loop".into());
        looped.loop_over = Some(json!("result_of_phase_1"));
        let llm = QueuedLlm::default();
        llm.queue("aggregation");
        let (plan, _, _) = run(vec![looped], "count failures", &llm, None).await;
        assert!(!plan[0].is_loop());
        assert_eq!(
            plan[0].arguments["source_data"],
            json!({ "source": "result_of_phase_1" })
        );
    }

    #[tokio::test]
    async fn synthesis_loop_left_alone() {
        let mut looped = Phase::new(1, "Narrate each incident")
            .with_tool(names::LLM_TASK)
            .with_arg("task_description", json!("Write a narrative per incident"));
        looped.phase_type = Some("loop".into());
        looped.loop_over = Some(json!("result_of_phase_1"));
        let llm = QueuedLlm::default();
        llm.queue("synthesis");
        let (plan, _, _) = run(vec![looped], "describe incidents", &llm, None).await;
        assert!(plan[0].is_loop());
    }

    #[tokio::test]
    async fn forward_referenced_first_loop_hydrates_from_previous_turn() {
        let mut first = Phase::new(1, "Re-examine the tables")
            .with_tool("base_tableList")
            .with_arg("database_name", json!("S"));
        first.phase_type = Some("loop".into());
        first.loop_over = Some(json!("result_of_phase_2"));
        let llm = QueuedLlm::default();
        let previous = PreviousTurnContext {
            user_query: "list tables".into(),
            data_tools: vec!["base_tableList".into()],
            sql_texts: vec![],
            last_successful_result: Some(json!({ "status": "success", "results": [{"TableName": "T1"}] })),
        };
        let (plan, _, seed) = run(vec![first], "list tables again", &llm, Some(&previous)).await;
        assert_eq!(
            plan[0].loop_over,
            Some(json!(INJECTED_PREVIOUS_TURN_DATA))
        );
        assert!(seed.contains_key(INJECTED_PREVIOUS_TURN_DATA));
    }

    #[tokio::test]
    async fn empty_context_report_is_synthesised() {
        let plan = vec![Phase::new(1, "Answer").with_tool(names::CONTEXT_REPORT)];
        let llm = QueuedLlm::default();
        llm.queue("The retention policy is 90 days.");
        let tools = catalog();
        let prompts = PromptCatalog::default();
        let mut seed = Map::new();
        let mut events = Vec::new();
        let mut ctx = RewriteContext {
            user_query: "what is the retention policy?",
            tools: &tools,
            prompts: &prompts,
            knowledge_context: "Documents say retention is 90 days.",
            previous_turn: None,
            sql_optimization: false,
            is_sub_process: false,
            active_prompt: None,
            llm: &llm,
            workflow_seed: &mut seed,
        };
        let plan = rewrite_plan(plan, &mut ctx, &mut events).await.unwrap();
        assert_eq!(
            plan[0].arguments["answer_from_context"],
            json!("The retention policy is 90 days.")
        );
    }

    #[tokio::test]
    async fn sql_consolidation_merges_contiguous_run() {
        let plan = vec![
            Phase::new(1, "Revenue")
                .with_tool("base_readQuery")
                .with_arg("sql_text", json!("SELECT SUM(revenue) FROM orders")),
            Phase::new(2, "Orders")
                .with_tool("base_readQuery")
                .with_arg("sql_text", json!("SELECT COUNT(*) FROM orders")),
        ];
        let llm = QueuedLlm::default();
        llm.queue(r#"{"sql": "SELECT SUM(revenue), COUNT(*) FROM orders"}"#);
        let tools = catalog();
        let prompts = PromptCatalog::default();
        let mut seed = Map::new();
        let mut events = Vec::new();
        let mut ctx = RewriteContext {
            user_query: "revenue and order count",
            tools: &tools,
            prompts: &prompts,
            knowledge_context: "",
            previous_turn: None,
            sql_optimization: true,
            is_sub_process: false,
            active_prompt: None,
            llm: &llm,
            workflow_seed: &mut seed,
        };
        let plan = rewrite_plan(plan, &mut ctx, &mut events).await.unwrap();
        let sql_phases = plan
            .iter()
            .filter(|p| p.tool_name() == Some("base_readQuery"))
            .count();
        assert_eq!(sql_phases, 1);
        assert!(plan[0].arguments["sql_text"]
            .as_str()
            .unwrap()
            .contains("SUM(revenue), COUNT(*)"));
    }

    #[tokio::test]
    async fn multi_loop_synthesis_inserts_distillation() {
        let mut loop_a = Phase::new(1, "Stats per table")
            .with_tool("base_tableList")
            .with_arg("database_name", json!("S"));
        loop_a.phase_type = Some("loop".into());
        loop_a.loop_over = Some(json!("result_of_phase_1"));
        let mut loop_b = loop_a.clone();
        loop_b.phase = 2;
        let synth = Phase::new(3, "Summarize everything")
            .with_tool(names::LLM_TASK)
            .with_arg("task_description", json!("Write the summary"))
            .with_arg("source_data", json!(["result_of_phase_1", "result_of_phase_2"]));
        let llm = QueuedLlm::default();
        // Pass 4 classifies the inserted distillation loop; keep it a loop.
        llm.queue("synthesis");
        let (plan, _, _) = run(vec![loop_a, loop_b, synth], "summarize the stats", &llm, None).await;

        let distill_idx = plan
            .iter()
            .position(|p| p.is_loop() && p.tool_name() == Some(names::LLM_TASK))
            .expect("distillation loop inserted");
        let synth_idx = plan
            .iter()
            .position(|p| !p.is_loop() && p.tool_name() == Some(names::LLM_TASK))
            .expect("synthesis phase kept");
        assert!(distill_idx < synth_idx);
        assert_eq!(
            plan[synth_idx].arguments["source_data"],
            json!({ "source": tess_domain::plan::result_key(plan[distill_idx].phase) })
        );
    }

    #[tokio::test]
    async fn pipeline_is_idempotent() {
        let plan = vec![Phase::new(1, "Fetch sales")
            .with_tool("sales_byDay")
            .with_arg("database_name", json!("SALES"))];
        let llm = QueuedLlm::default();
        let (once, _, _) = run(plan, "sales in the past 5 days", &llm, None).await;
        let llm2 = QueuedLlm::default();
        let (twice, _, _) = run(once.clone(), "sales in the past 5 days", &llm2, None).await;
        assert_eq!(once, twice);
    }
}
