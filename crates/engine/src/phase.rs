//! Single-phase execution.
//!
//! The dispatch table, in order: prompt phases recurse into a
//! sub-executor; loop phases iterate (fast path for a single simple
//! tool, slow path otherwise); `ContextReport` and `Charting` have
//! deterministic bypasses; single-tool phases whose arguments survive
//! the pre-flight gate run without a tactical LM call; everything else
//! goes through the tactical loop with duplicate-action detection,
//! per-action retry, and correction strategies.

use serde_json::{json, Map, Value};

use tess_domain::error::{Error, Result};
use tess_domain::event::{AgentEvent, PhaseDetails, PhaseMarker};
use tess_domain::plan::Phase;
use tess_domain::tool::{
    get_by_canonical_name, names, ToolDescriptor, ToolOutput, ToolScope,
};
use tess_planner::extract_json;
use tess_planner::temporal;

use crate::correction::{classify_error, CorrectionHandler, CorrectionOutcome};
use crate::executor::PlanExecutor;
use crate::llm::PlanningPhase;
use crate::orchestrate::{self, OrchestratorCtx};
use crate::resolver::resolve_arguments;
use crate::systools;
use crate::workflow::TurnState;

/// What one executed action produced.
pub(crate) enum ToolRun {
    Output(ToolOutput),
    /// A correction strategy concluded the task with a user-visible
    /// answer.
    Final(String),
}

/// How a phase ended, for the `phase_end` event.
enum PhaseStatus {
    Completed,
    Skipped,
}

/// The loop source once extracted from workflow state.
enum LoopSource {
    Items(Vec<Value>),
    /// A literal list of strings — a hallucinated loop.
    Strings(Vec<String>),
    Empty,
}

impl PlanExecutor {
    fn orchestrator_ctx(&self) -> OrchestratorCtx<'_> {
        OrchestratorCtx {
            caps: &self.caps,
            bus: &self.bus,
            runner: &self.runner,
            user_query: &self.user_query,
            constraints: &self.constraints,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Entry point
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub(crate) async fn execute_phase(
        &self,
        phase: &Phase,
        plan: &[Phase],
        state: &mut TurnState,
    ) -> Result<()> {
        self.cancel.check()?;
        self.emit_phase_marker(phase, plan.len(), true, None).await;

        let status = if let Some(prompt) = &phase.executable_prompt {
            // A prompt capability spawns a sub-executor at depth + 1.
            let mut events = Vec::new();
            let resolved =
                resolve_arguments(&phase.arguments, &state.workflow, None, plan, &mut events);
            self.flush(events).await;
            self.run_sub_process(prompt, resolved, state).await?;
            if let Some(output) = state.last_output.clone() {
                state.alias_result(phase.phase, &output);
            }
            PhaseStatus::Completed
        } else if phase.is_loop() {
            self.execute_looping_phase(phase, plan, state).await?
        } else {
            self.execute_standard_phase(phase, plan, state, None, false)
                .await?;
            PhaseStatus::Completed
        };

        self.emit_phase_marker(phase, plan.len(), false, Some(&status))
            .await;
        Ok(())
    }

    async fn emit_phase_marker(
        &self,
        phase: &Phase,
        total: usize,
        start: bool,
        status: Option<&PhaseStatus>,
    ) {
        let status_str = status.map(|s| {
            match s {
                PhaseStatus::Completed => "completed",
                PhaseStatus::Skipped => "skipped",
            }
            .to_string()
        });
        let marker = PhaseMarker {
            step: format!(
                "{} Plan Phase {}/{}",
                if start { "Starting" } else { "Ending" },
                phase.phase,
                total
            ),
            kind: if start { "phase_start" } else { "phase_end" }.into(),
            details: PhaseDetails {
                phase_num: phase.phase,
                total_phases: total,
                goal: start.then(|| phase.goal.clone()),
                phase_details: start
                    .then(|| serde_json::to_value(phase).ok())
                    .flatten(),
                execution_depth: self.depth,
                status: status_str,
            },
        };
        self.bus
            .emit(if start {
                AgentEvent::PhaseStart(marker)
            } else {
                AgentEvent::PhaseEnd(marker)
            })
            .await;
    }

    async fn flush(&self, events: Vec<AgentEvent>) {
        for event in events {
            self.bus.emit(event).await;
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Loop phases
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn execute_looping_phase(
        &self,
        phase: &Phase,
        plan: &[Phase],
        state: &mut TurnState,
    ) -> Result<PhaseStatus> {
        let loop_over = phase.loop_over.clone().unwrap_or(Value::Null);

        match extract_loop_items(&loop_over, &state.workflow) {
            LoopSource::Empty => {
                let source = loop_over.as_str().unwrap_or("<literal>");
                self.bus
                    .emit(AgentEvent::system(
                        "Skipping Empty Loop",
                        "system_message",
                        json!(format!("No items found from '{source}' to loop over.")),
                    ))
                    .await;
                state.bind_empty(phase.phase);
                Ok(PhaseStatus::Skipped)
            }

            LoopSource::Strings(items) => {
                // A hallucinated loop — repair by iterating the strings.
                let Some(tool_name) = phase.tool_name().map(str::to_owned) else {
                    return Err(Error::ArgumentMismatch(
                        "loop over literal strings with no single tool".into(),
                    ));
                };
                let mut events = Vec::new();
                let args =
                    resolve_arguments(&phase.arguments, &state.workflow, None, plan, &mut events);
                self.flush(events).await;
                let ctx = self.orchestrator_ctx();
                let outputs =
                    orchestrate::execute_hallucinated_loop(&ctx, &tool_name, &args, &items).await?;
                let now = self.caps.clock.now();
                for output in &outputs {
                    state.bind_result(phase.phase, output);
                }
                state.record_action(
                    names::SYSTEM_LOG,
                    &json!({ "message": format!("Hallucinated Loop: {}", phase.goal) }),
                    phase.phase,
                    self.depth,
                    now,
                    json!(outputs.iter().map(ToolOutput::to_value).collect::<Vec<_>>()),
                );
                Ok(PhaseStatus::Completed)
            }

            LoopSource::Items(mut items) => {
                let fast_candidate = phase
                    .tool_name()
                    .is_some_and(|name| !names::is_synthesis(name));

                if !fast_candidate {
                    for item in items {
                        self.cancel.check()?;
                        self.execute_standard_phase(phase, plan, state, Some(&item), true)
                            .await?;
                    }
                    return Ok(PhaseStatus::Completed);
                }

                let tool_name = phase.tool_name().unwrap_or_default().to_string();

                // Prune arguments that redundantly restate the loop source.
                let mut arguments = phase.arguments.clone();
                let loop_key = loop_over.as_str().unwrap_or_default();
                let redundant: Vec<String> = arguments
                    .iter()
                    .filter(|(_, v)| v.as_str() == Some(loop_key) && !loop_key.is_empty())
                    .map(|(k, _)| k.clone())
                    .collect();
                if !redundant.is_empty() {
                    for name in &redundant {
                        arguments.remove(name);
                    }
                    self.bus
                        .emit(AgentEvent::workaround(
                            "System Correction",
                            json!({
                                "summary": "The plan repeated the loop source as an argument. The redundant argument was removed.",
                                "correction_type": "redundant_argument_pruning",
                                "pruned_arguments": redundant,
                            }),
                        ))
                        .await;
                }

                // Column-scoped tool without a column: expand to
                // (table, column) items first.
                let column_scoped = self.caps.tools.scope_of(&tool_name) == Some(ToolScope::Column)
                    && get_by_canonical_name(&arguments, "column_name").is_none();
                if column_scoped {
                    let mut events = Vec::new();
                    let resolved = resolve_arguments(
                        &arguments,
                        &state.workflow,
                        None,
                        plan,
                        &mut events,
                    );
                    self.flush(events).await;
                    let Some(db) = get_by_canonical_name(&resolved, "database_name")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                    else {
                        return Err(Error::ArgumentMismatch(format!(
                            "column iteration for '{tool_name}' requires database_name"
                        )));
                    };
                    self.bus
                        .emit(AgentEvent::system(
                            "Plan Optimization",
                            "plan_optimization",
                            json!(format!(
                                "Preparing column-level iteration for '{tool_name}'."
                            )),
                        ))
                        .await;
                    let ctx = self.orchestrator_ctx();
                    items = orchestrate::expand_column_items(&ctx, &tool_name, &db, &items).await?;
                    if items.is_empty() {
                        self.bus
                            .emit(AgentEvent::system(
                                "Skipping Empty Loop",
                                "system_message",
                                json!(format!("No compatible columns found for '{tool_name}'.")),
                            ))
                            .await;
                        state.bind_empty(phase.phase);
                        return Ok(PhaseStatus::Skipped);
                    }
                }

                self.bus
                    .emit(AgentEvent::system(
                        "Plan Optimization",
                        "plan_optimization",
                        json!(format!("Deterministic iteration enabled for tool loop: '{tool_name}'")),
                    ))
                    .await;

                let tool = self.caps.tool(&tool_name).cloned();
                for item in &items {
                    self.cancel.check()?;
                    let mut events = Vec::new();
                    let mut call_args = resolve_arguments(
                        &arguments,
                        &state.workflow,
                        Some(item),
                        plan,
                        &mut events,
                    );
                    self.flush(events).await;
                    if let Some(tool) = &tool {
                        merge_item_args(&mut call_args, item, tool);
                    }
                    let action = json!({ "tool_name": tool_name, "arguments": call_args });
                    match self.execute_tool(action, phase.phase, state).await? {
                        ToolRun::Output(_) => {}
                        ToolRun::Final(text) => {
                            let output = ToolOutput::response(names::CONTEXT_REPORT, &text);
                            state.bind_result(phase.phase, &output);
                            return Ok(PhaseStatus::Completed);
                        }
                    }
                }
                Ok(PhaseStatus::Completed)
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Standard phases
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn execute_standard_phase(
        &self,
        phase: &Phase,
        plan: &[Phase],
        state: &mut TurnState,
        loop_item: Option<&Value>,
        is_loop_iteration: bool,
    ) -> Result<()> {
        let mut events = Vec::new();
        let strategic_args =
            resolve_arguments(&phase.arguments, &state.workflow, loop_item, plan, &mut events);
        self.flush(events).await;

        // Multi-tool phase: scope-aware dispatch per tool.
        if phase.relevant_tools.len() > 1 {
            return self
                .execute_multi_tool_phase(phase, &strategic_args, state)
                .await;
        }

        let tool_name = phase.tool_name().map(str::to_owned);

        // ContextReport bypass: a pre-populated answer skips the LM.
        if tool_name.as_deref() == Some(names::CONTEXT_REPORT) {
            if let Some(answer) = strategic_args
                .get("answer_from_context")
                .and_then(Value::as_str)
                .filter(|a| !a.is_empty())
            {
                tracing::info!("context-report bypass: answer pre-synthesised at plan time");
                let output = ToolOutput::response(names::CONTEXT_REPORT, answer);
                self.bus
                    .emit(AgentEvent::tool_result(names::CONTEXT_REPORT, output.to_value()))
                    .await;
                state.record_action(
                    names::CONTEXT_REPORT,
                    &Value::Object(strategic_args.clone()),
                    phase.phase,
                    self.depth,
                    self.caps.clock.now(),
                    output.to_value(),
                );
                state.bind_result(phase.phase, &output);
                return Ok(());
            }
        }

        // Charting bypass: deterministic data + mapping, zero LM calls.
        if tool_name.as_deref() == Some(names::CHARTING) {
            if let Some(rows) = self.resolve_charting_data(&strategic_args, state) {
                let chart_type = strategic_args
                    .get("chart_type")
                    .and_then(Value::as_str)
                    .unwrap_or("bar")
                    .to_string();
                if let Some(mapping) = generate_charting_mapping(&chart_type, &rows) {
                    self.bus
                        .emit(AgentEvent::system(
                            "Plan Optimization",
                            "plan_optimization",
                            json!({
                                "summary": format!(
                                    "Deterministic charting: resolved {} data rows and derived the axis mapping from column types.",
                                    rows.len()
                                ),
                                "correction_type": "deterministic_charting"
                            }),
                        ))
                        .await;
                    let action = json!({
                        "tool_name": names::CHARTING,
                        "arguments": {
                            "chart_type": chart_type,
                            "data": rows,
                            "title": phase.goal,
                            "mapping": mapping,
                        }
                    });
                    self.execute_tool(action, phase.phase, state).await?;
                    return Ok(());
                }
                tracing::warn!("charting bypass could not derive a mapping, using tactical path");
            } else {
                tracing::warn!("charting bypass could not resolve data, using tactical path");
            }
        }

        // Fast path: a single tool whose arguments survive pre-flight.
        if let Some(name) = &tool_name {
            if let Some(tool) = self.caps.tool(name) {
                if !phase.needs_refinement && preflight_ok(tool, &strategic_args) {
                    let action = json!({ "tool_name": name, "arguments": strategic_args });
                    match self.execute_action(action, phase, state).await? {
                        ToolRun::Output(_) => return Ok(()),
                        ToolRun::Final(text) => {
                            let output = ToolOutput::response(names::CONTEXT_REPORT, &text);
                            state.bind_result(phase.phase, &output);
                            return Ok(());
                        }
                    }
                }
            }
        }

        // Slow path: the tactical LM proposes one action per attempt.
        let mut last_action: Option<String> = None;
        let mut repetition_note: Option<String> = None;
        for attempt in 0..self.caps.limits.tactical_retries {
            self.cancel.check()?;
            let action = match self
                .tactical_action(phase, &strategic_args, state, repetition_note.take())
                .await
            {
                Ok(action) => action,
                Err(Error::PlanParse(e)) => {
                    tracing::warn!(attempt, error = %e, "tactical reply unparseable, retrying");
                    repetition_note =
                        Some("Your previous reply was not a valid JSON action.".into());
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Duplicate-action detection: a byte-identical repeat is not
            // executed; the next attempt is told to change course.
            let serialized = action.to_string();
            if last_action.as_deref() == Some(serialized.as_str()) {
                tracing::warn!(attempt, "tactical action repeated verbatim, forcing replan");
                repetition_note = Some(
                    "You proposed the exact same action again. It was not executed; propose a different approach.".into(),
                );
                continue;
            }
            last_action = Some(serialized);

            match self.execute_action(action, phase, state).await {
                Ok(ToolRun::Output(_)) => return Ok(()),
                Ok(ToolRun::Final(text)) => {
                    let output = ToolOutput::response(names::CONTEXT_REPORT, &text);
                    state.bind_result(phase.phase, &output);
                    return Ok(());
                }
                Err(e) if e.is_terminal() => return Err(e),
                Err(e @ Error::DefinitiveTool { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "action failed, tactical retry");
                    if is_loop_iteration {
                        // Loop iterations do not burn the phase budget on
                        // one bad item; record and continue.
                        return Err(e);
                    }
                }
            }
        }

        Err(Error::PhaseStall(format!(
            "phase {} exhausted {} tactical attempts",
            phase.phase, self.caps.limits.tactical_retries
        )))
    }

    async fn execute_multi_tool_phase(
        &self,
        phase: &Phase,
        strategic_args: &Map<String, Value>,
        state: &mut TurnState,
    ) -> Result<()> {
        self.bus
            .emit(AgentEvent::workaround(
                "Scope-Aware Dispatcher Active",
                json!(format!(
                    "Multi-tool phase detected. Dispatching {} tools based on scope.",
                    phase.relevant_tools.len()
                )),
            ))
            .await;

        let mut all_outputs: Vec<Value> = Vec::new();
        for tool_name in &phase.relevant_tools {
            self.cancel.check()?;
            let column_scoped = self.caps.tools.scope_of(tool_name) == Some(ToolScope::Column)
                && get_by_canonical_name(strategic_args, "column_name").is_none();
            if column_scoped {
                let ctx = self.orchestrator_ctx();
                let outputs =
                    orchestrate::execute_column_iteration(&ctx, tool_name, strategic_args).await?;
                for output in &outputs {
                    state.bind_result(phase.phase, output);
                    all_outputs.push(output.to_value());
                }
            } else {
                let action = json!({ "tool_name": tool_name, "arguments": strategic_args });
                match self.execute_action(action, phase, state).await {
                    Ok(ToolRun::Output(output)) => all_outputs.push(output.to_value()),
                    Ok(ToolRun::Final(text)) => {
                        let output = ToolOutput::response(names::CONTEXT_REPORT, &text);
                        state.bind_result(phase.phase, &output);
                        all_outputs.push(output.to_value());
                    }
                    Err(e) => {
                        tracing::warn!(tool = %tool_name, error = %e, "dispatcher tool failed");
                        let output = ToolOutput::error(tool_name.as_str(), e.to_string());
                        all_outputs.push(output.to_value());
                    }
                }
            }
        }

        state.record_action(
            names::SYSTEM_LOG,
            &json!({ "message": format!("Multi-Tool Phase: {}", phase.goal) }),
            phase.phase,
            self.depth,
            self.caps.clock.now(),
            json!(all_outputs),
        );
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Action execution (orchestrator pre-flight + tool run)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Run pre-flight orchestrator checks, then the tool itself.
    async fn execute_action(
        &self,
        mut action: Value,
        phase: &Phase,
        state: &mut TurnState,
    ) -> Result<ToolRun> {
        // Prompt delegation.
        if let Some(prompt_name) = action.get("prompt_name").and_then(Value::as_str) {
            let arguments = action
                .get("arguments")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            self.run_sub_process(prompt_name, arguments, state).await?;
            let output = state
                .last_output
                .clone()
                .unwrap_or_else(|| ToolOutput::success(prompt_name, vec![]));
            state.alias_result(phase.phase, &output);
            return Ok(ToolRun::Output(output));
        }

        let tool_name = action
            .get("tool_name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::PlanParse("action has neither tool_name nor prompt_name".into()))?
            .to_string();
        let args = action
            .get("arguments")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        // Charting: resolve placeholder data references before execution.
        if tool_name == names::CHARTING {
            let needs_data = !matches!(args.get("data"), Some(Value::Array(rows)) if !rows.is_empty());
            if needs_data {
                if let Some(rows) = self.resolve_charting_data(&args, state) {
                    self.bus
                        .emit(AgentEvent::workaround(
                            "System Correction",
                            json!({
                                "summary": format!(
                                    "Chart data referenced phase results by placeholder. Resolved to {} rows from workflow state.",
                                    rows.len()
                                ),
                                "correction_type": "charting_data_resolution"
                            }),
                        ))
                        .await;
                    action["arguments"]["data"] = Value::Array(rows);
                }
            }
        }

        // Column iteration: column-scoped tool with no column argument.
        let column_scoped = self.caps.tools.scope_of(&tool_name) == Some(ToolScope::Column)
            && get_by_canonical_name(&args, "column_name").is_none();
        if column_scoped {
            self.bus
                .emit(AgentEvent::system(
                    "Scope-Aware Dispatcher Action",
                    "plan_optimization",
                    json!(format!(
                        "Invoking column iteration for '{tool_name}' because 'column_name' was missing."
                    )),
                ))
                .await;
            let ctx = self.orchestrator_ctx();
            let outputs = orchestrate::execute_column_iteration(&ctx, &tool_name, &args).await?;
            let now = self.caps.clock.now();
            for output in &outputs {
                state.bind_result(phase.phase, output);
            }
            state.record_action(
                &tool_name,
                &Value::Object(args),
                phase.phase,
                self.depth,
                now,
                json!(outputs.iter().map(ToolOutput::to_value).collect::<Vec<_>>()),
            );
            let last = outputs
                .into_iter()
                .last()
                .unwrap_or_else(|| ToolOutput::success(tool_name.as_str(), vec![]));
            return Ok(ToolRun::Output(last));
        }

        // Date-range orchestration: a temporal phrase in the date
        // argument, or a range tool with both bounds missing.
        if tool_name != names::DATE_RANGE && tool_name != names::CURRENT_DATE {
            if let Some(tool) = self.caps.tool(&tool_name) {
                if let Some(date_param) = tool.date_param().map(str::to_owned) {
                    let date_value = args.get(&date_param).and_then(Value::as_str).unwrap_or("");
                    let supports_range = tool.supports_date_range();
                    let both_missing = supports_range
                        && args.get("start_date").and_then(Value::as_str).unwrap_or("").is_empty()
                        && args.get("end_date").and_then(Value::as_str).unwrap_or("").is_empty();
                    let has_phrase = temporal::is_temporal_phrase(date_value);

                    if has_phrase || both_missing {
                        let phrase = if has_phrase {
                            date_value.to_string()
                        } else {
                            temporal::extract_phrase(&self.user_query)
                                .unwrap_or_else(|| "today".to_string())
                        };
                        let ctx = self.orchestrator_ctx();
                        let outputs = orchestrate::execute_date_range(
                            &ctx,
                            &tool_name,
                            &args,
                            &date_param,
                            &phrase,
                            supports_range,
                        )
                        .await?;
                        let now = self.caps.clock.now();
                        for output in &outputs {
                            state.bind_result(phase.phase, output);
                        }
                        state.record_action(
                            &tool_name,
                            &Value::Object(args),
                            phase.phase,
                            self.depth,
                            now,
                            json!(outputs.iter().map(ToolOutput::to_value).collect::<Vec<_>>()),
                        );
                        let last = outputs
                            .into_iter()
                            .last()
                            .unwrap_or_else(|| ToolOutput::success(tool_name.as_str(), vec![]));
                        return Ok(ToolRun::Output(last));
                    }
                }
            }
        }

        self.execute_tool(action, phase.phase, state).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tool execution with retry + correction
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub(crate) async fn execute_tool(
        &self,
        mut action: Value,
        phase_num: u32,
        state: &mut TurnState,
    ) -> Result<ToolRun> {
        let corrector = CorrectionHandler::new(&self.runner, &self.caps, &self.user_query);
        let attempts = self.caps.limits.tool_attempts;

        for attempt in 0..attempts {
            self.cancel.check()?;

            // A correction may have redirected to a prompt.
            if let Some(prompt_name) = action.get("prompt_name").and_then(Value::as_str) {
                let arguments = action
                    .get("arguments")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.run_sub_process(prompt_name, arguments, state).await?;
                let output = state
                    .last_output
                    .clone()
                    .unwrap_or_else(|| ToolOutput::success(prompt_name, vec![]));
                state.alias_result(phase_num, &output);
                return Ok(ToolRun::Output(output));
            }

            let tool_name = action
                .get("tool_name")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::PlanParse("action is missing tool_name".into()))?
                .to_string();
            let mut args = action
                .get("arguments")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();

            // Proactive refinement: provided arguments that mismatch the
            // schema are remapped before the call.
            if let Some(tool) = self.caps.tool(&tool_name).cloned() {
                if needs_refinement(&tool, &args) {
                    args = self.refine_arguments(&tool, &args).await?;
                    action["arguments"] = Value::Object(args.clone());
                }
            }

            self.bus
                .emit(AgentEvent::tool_intent(
                    "Tool Execution",
                    &tool_name,
                    json!({ "arguments": args }),
                ))
                .await;

            let output = if systools::is_system_tool(&tool_name) {
                systools::execute(
                    &tool_name,
                    &args,
                    &self.runner,
                    self.caps.clock.as_ref(),
                    &self.user_query,
                    &state.collected,
                )
                .await?
            } else {
                self.bus.emit(AgentEvent::db_busy()).await;
                let result = self
                    .caps
                    .host
                    .invoke_tool(&tool_name, Value::Object(args.clone()))
                    .await;
                self.bus.emit(AgentEvent::db_idle()).await;
                match result {
                    Ok(output) => output,
                    Err(e) => ToolOutput::error(&tool_name, e.to_string()),
                }
            };

            state.record_action(
                &tool_name,
                &Value::Object(args),
                phase_num,
                self.depth,
                self.caps.clock.now(),
                output.to_value(),
            );

            if output.is_success() {
                self.bus
                    .emit(AgentEvent::tool_result(&tool_name, output.to_value()))
                    .await;
                state.bind_result(phase_num, &output);
                return Ok(ToolRun::Output(output));
            }

            self.bus
                .emit(AgentEvent::tool_error(&tool_name, output.to_value()))
                .await;
            // Definitive errors terminate the phase immediately.
            classify_error(&output)?;

            if attempt + 1 == attempts {
                break;
            }
            match corrector.attempt(&action, &output).await? {
                CorrectionOutcome::Corrected(corrected) => {
                    tracing::info!(attempt, "correction strategy proposed a new action");
                    action = corrected;
                }
                CorrectionOutcome::FinalAnswer(text) => return Ok(ToolRun::Final(text)),
                CorrectionOutcome::Unrecoverable => break,
            }
        }

        Err(Error::Other(format!(
            "tool call failed after {attempts} attempts"
        )))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tactical LM
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn tactical_action(
        &self,
        phase: &Phase,
        strategic_args: &Map<String, Value>,
        state: &TurnState,
        note: Option<String>,
    ) -> Result<Value> {
        let enriched = self.enrich_from_history(phase, strategic_args, state);
        let catalog: Vec<String> = phase
            .relevant_tools
            .iter()
            .filter_map(|name| self.caps.tool(name))
            .map(|tool| {
                format!(
                    "- {} ({})",
                    tool.name,
                    tool.args
                        .iter()
                        .map(|a| if a.required {
                            format!("{}*", a.name)
                        } else {
                            a.name.clone()
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
            .collect();

        let mut prompt = format!(
            "Phase goal: {}\n\nPermitted tools:\n{}\n\nArguments so far:\n{}\n\n\
             Workflow state (summarised):\n{}\n\n\
             Respond with exactly one JSON action: \
             {{\"tool_name\": ..., \"arguments\": {{...}}}} or \
             {{\"prompt_name\": ..., \"arguments\": {{...}}}}.",
            phase.goal,
            catalog.join("\n"),
            Value::Object(enriched),
            state.distilled(),
        );
        if let Some(note) = note {
            prompt.push_str(&format!("\n\nNote: {note}"));
        }

        let system = self.caps.system_prompt(
            "tactical",
            "You decide the single next action for a data agent. Output only the JSON action.",
        );
        let response = self
            .runner
            .complete(PlanningPhase::Tactical, "Tactical action", &system, &prompt, false)
            .await?;

        let action = extract_json(&response)
            .ok_or_else(|| Error::PlanParse("tactical reply contained no JSON action".into()))?;
        if action.get("tool_name").is_none() && action.get("prompt_name").is_none() {
            return Err(Error::PlanParse(
                "tactical action is missing tool_name/prompt_name".into(),
            ));
        }
        Ok(action)
    }

    /// Fill schema arguments the plan left empty from the most recent
    /// successful action that provided them.
    fn enrich_from_history(
        &self,
        phase: &Phase,
        args: &Map<String, Value>,
        state: &TurnState,
    ) -> Map<String, Value> {
        let mut enriched = args.clone();
        let Some(tool) = phase.tool_name().and_then(|n| self.caps.tool(n)) else {
            return enriched;
        };
        for spec in &tool.args {
            if enriched.contains_key(&spec.name) {
                continue;
            }
            for record in state.history.iter().rev() {
                if let Some(value) = record.action.pointer(&format!("/arguments/{}", spec.name)) {
                    if !value.is_null() {
                        enriched.insert(spec.name.clone(), value.clone());
                        break;
                    }
                }
            }
        }
        enriched
    }

    /// LM argument refinement: remap provided arguments onto the tool's
    /// actual schema.
    async fn refine_arguments(
        &self,
        tool: &ToolDescriptor,
        args: &Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let prompt = format!(
            "Tool schema:\n{}\n\nProvided arguments:\n{}\n\n\
             Remap the provided values onto the schema. Respond with a JSON object of \
             arguments only — no commentary. Omit arguments you cannot fill.",
            serde_json::to_string_pretty(tool)?,
            Value::Object(args.clone()),
        );
        let response = self
            .runner
            .complete(
                PlanningPhase::Tactical,
                "Refining tool arguments",
                "You map arguments onto tool schemas. Output only the JSON object.",
                &prompt,
                false,
            )
            .await?;
        let refined = extract_json(&response)
            .and_then(|v| v.as_object().cloned())
            .ok_or_else(|| Error::ArgumentMismatch("refiner returned no argument object".into()))?;
        self.bus
            .emit(AgentEvent::workaround(
                "Argument Refinement",
                json!({
                    "summary": format!("Arguments for '{}' were remapped onto the tool schema.", tool.name),
                    "refined": refined,
                }),
            ))
            .await;
        Ok(refined)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Charting helpers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Find chart data: the action's own rows if concrete, else the most
    /// recent data rows in workflow state (previous-turn injection
    /// included).
    fn resolve_charting_data(
        &self,
        args: &Map<String, Value>,
        state: &TurnState,
    ) -> Option<Vec<Value>> {
        if let Some(Value::Array(rows)) = args.get("data") {
            if !rows.is_empty() && rows.iter().all(|r| r.is_object()) {
                return Some(rows.clone());
            }
        }

        // Phase results, most recent first.
        let mut keys: Vec<(&String, u32)> = state
            .workflow
            .keys()
            .filter_map(|k| tess_domain::plan::parse_phase_ref(k).map(|n| (k, n)))
            .collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in keys {
            if let Some(rows) = data_rows(state.workflow.get(key)?) {
                return Some(rows);
            }
        }

        state
            .workflow
            .get(tess_domain::plan::INJECTED_PREVIOUS_TURN_DATA)
            .and_then(data_rows)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Free helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull concrete data rows (not LM-response rows) out of a workflow
/// value: a list of tool outputs, a single output, or raw rows.
fn data_rows(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => {
            // Raw rows already?
            if !items.is_empty()
                && items.iter().all(|i| {
                    i.as_object()
                        .is_some_and(|o| !o.contains_key("results") && !o.contains_key("response"))
                })
            {
                return Some(items.clone());
            }
            // A list of outputs: gather their result rows.
            let mut rows = Vec::new();
            for item in items {
                if let Some(results) = item.get("results").and_then(Value::as_array) {
                    for row in results {
                        let is_data_row = row
                            .as_object()
                            .is_some_and(|o| !o.contains_key("response"));
                        if is_data_row {
                            rows.push(row.clone());
                        }
                    }
                }
            }
            (!rows.is_empty()).then_some(rows)
        }
        Value::Object(_) => value
            .get("results")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.as_object().is_some_and(|o| !o.contains_key("response")))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|rows: &Vec<Value>| !rows.is_empty()),
        _ => None,
    }
}

fn looks_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

/// Derive the chart axis mapping from the data's column shapes: the
/// first non-numeric column labels the x axis, the first numeric column
/// feeds the y axis.
pub(crate) fn generate_charting_mapping(
    chart_type: &str,
    rows: &[Value],
) -> Option<Map<String, Value>> {
    let first = rows.first()?.as_object()?;
    let label_col = first
        .iter()
        .find(|(_, v)| !looks_numeric(v))
        .map(|(k, _)| k.clone())
        .or_else(|| first.keys().next().cloned())?;
    let value_col = first
        .iter()
        .find(|(k, v)| **k != label_col && looks_numeric(v))
        .map(|(k, _)| k.clone())?;

    let mut mapping = Map::new();
    if chart_type.eq_ignore_ascii_case("pie") {
        mapping.insert("labels".into(), json!(label_col));
        mapping.insert("values".into(), json!(value_col));
    } else {
        mapping.insert("x_axis".into(), json!(label_col));
        mapping.insert("y_axis".into(), json!(value_col));
    }
    Some(mapping)
}

/// Fast-path gate: every required argument must be present, non-empty,
/// concrete (no placeholder dicts anywhere), not a literal string list,
/// and not a temporal phrase.
pub(crate) fn preflight_ok(tool: &ToolDescriptor, args: &Map<String, Value>) -> bool {
    for spec in tool.required_args() {
        let canonical = tess_domain::tool::canonical_arg_name(&spec.name);
        let Some(value) = get_by_canonical_name(args, canonical) else {
            return false;
        };
        match value {
            Value::Null => return false,
            Value::String(s) => {
                if s.is_empty() || temporal::is_temporal_phrase(s) {
                    return false;
                }
            }
            Value::Array(items) => {
                if items.iter().all(Value::is_string) {
                    return false; // hallucinated loop material
                }
            }
            Value::Object(_) => {
                if tess_domain::plan::Placeholder::from_value(value).is_some() {
                    return false;
                }
            }
            _ => {}
        }
    }
    // Any unresolved placeholder anywhere rejects the fast path.
    !args
        .values()
        .any(|v| tess_domain::plan::Placeholder::from_value(v).is_some())
}

/// Does the provided argument set require LM refinement before the call?
pub(crate) fn needs_refinement(tool: &ToolDescriptor, args: &Map<String, Value>) -> bool {
    // Missing required argument?
    let provided: Vec<&str> = args
        .keys()
        .map(|k| tess_domain::tool::canonical_arg_name(k))
        .collect();
    let missing_required = tool
        .required_args()
        .any(|spec| !provided.contains(&tess_domain::tool::canonical_arg_name(&spec.name)));
    if missing_required {
        return true;
    }
    // Extraneous argument?
    args.keys().any(|k| {
        let canonical = tess_domain::tool::canonical_arg_name(k);
        !tool
            .args
            .iter()
            .any(|a| tess_domain::tool::canonical_arg_name(&a.name) == canonical)
    })
}

/// Merge loop-item fields into the call arguments wherever the tool's
/// schema (synonyms included) names them.
fn merge_item_args(args: &mut Map<String, Value>, item: &Value, tool: &ToolDescriptor) {
    let Some(item) = item.as_object() else { return };
    for spec in &tool.args {
        let canonical = tess_domain::tool::canonical_arg_name(&spec.name);
        let mut accepted = tess_domain::tool::synonyms_of(canonical);
        if !accepted.contains(&spec.name.as_str()) {
            accepted.push(spec.name.as_str());
        }
        let from_item = accepted.iter().find_map(|syn| {
            item.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(syn))
                .map(|(_, v)| v.clone())
        });
        if let Some(value) = from_item {
            args.insert(spec.name.clone(), value);
        }
    }
    // Column expansion attaches `column_name` directly.
    if let Some(col) = item.get("column_name") {
        args.insert("column_name".into(), col.clone());
    }
}

/// Extract loop items from the loop source.
fn extract_loop_items(loop_over: &Value, workflow: &Map<String, Value>) -> LoopSource {
    match loop_over {
        Value::Array(items) if !items.is_empty() => {
            if items.iter().all(Value::is_string) {
                LoopSource::Strings(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect(),
                )
            } else {
                LoopSource::Items(items.iter().filter(|i| i.is_object()).cloned().collect())
            }
        }
        Value::String(key) => match workflow.get(key) {
            Some(value) => {
                let rows = flatten_result_rows(value);
                if rows.is_empty() {
                    LoopSource::Empty
                } else {
                    LoopSource::Items(rows)
                }
            }
            None => {
                tracing::warn!(source = %key, "loop source not found in workflow state");
                LoopSource::Empty
            }
        },
        _ => LoopSource::Empty,
    }
}

/// Flatten a workflow value (possibly nested lists of tool outputs)
/// into its constituent result rows.
fn flatten_result_rows(value: &Value) -> Vec<Value> {
    let mut rows = Vec::new();
    collect_rows(value, &mut rows);
    rows
}

fn collect_rows(value: &Value, rows: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_rows(item, rows);
            }
        }
        Value::Object(obj) => {
            if let Some(results) = obj.get("results").and_then(Value::as_array) {
                for row in results {
                    if row.is_object() {
                        rows.push(row.clone());
                    }
                }
            } else if !obj.is_empty() && !obj.contains_key("status") {
                // A bare row object.
                rows.push(value.clone());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tess_domain::tool::ArgSpec;

    fn tool(args: &[(&str, bool)]) -> ToolDescriptor {
        ToolDescriptor {
            name: "t".into(),
            description: String::new(),
            args: args
                .iter()
                .map(|(n, r)| ArgSpec {
                    name: (*n).into(),
                    arg_type: "string".into(),
                    required: *r,
                    description: String::new(),
                })
                .collect(),
            scope: None,
        }
    }

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn preflight_rejects_missing_and_empty() {
        let t = tool(&[("database_name", true)]);
        assert!(!preflight_ok(&t, &args(&[])));
        assert!(!preflight_ok(&t, &args(&[("database_name", json!(""))])));
        assert!(preflight_ok(&t, &args(&[("database_name", json!("SALES"))])));
    }

    #[test]
    fn preflight_rejects_placeholders_and_phrases() {
        let t = tool(&[("date", true)]);
        assert!(!preflight_ok(
            &t,
            &args(&[("date", json!({ "source": "result_of_phase_1" }))])
        ));
        assert!(!preflight_ok(&t, &args(&[("date", json!("past 5 days"))])));
        assert!(preflight_ok(&t, &args(&[("date", json!("2025-11-03"))])));
    }

    #[test]
    fn preflight_rejects_string_lists() {
        let t = tool(&[("tables", true)]);
        assert!(!preflight_ok(&t, &args(&[("tables", json!(["a", "b"]))])));
    }

    #[test]
    fn preflight_accepts_synonym_spellings() {
        let t = tool(&[("object_name", true)]);
        assert!(preflight_ok(&t, &args(&[("table_name", json!("ORDERS"))])));
    }

    #[test]
    fn refinement_flags_extraneous_and_missing() {
        let t = tool(&[("database_name", true), ("limit", false)]);
        assert!(needs_refinement(&t, &args(&[("bogus", json!(1))])));
        assert!(needs_refinement(&t, &args(&[])));
        assert!(!needs_refinement(
            &t,
            &args(&[("database_name", json!("S")), ("limit", json!(5))])
        ));
    }

    #[test]
    fn mapping_picks_label_and_numeric_columns() {
        let rows = vec![
            json!({ "CustomerName": "Acme", "Revenue": 1200.5 }),
            json!({ "CustomerName": "Globex", "Revenue": 800 }),
        ];
        let mapping = generate_charting_mapping("bar", &rows).unwrap();
        assert_eq!(mapping["x_axis"], "CustomerName");
        assert_eq!(mapping["y_axis"], "Revenue");

        let pie = generate_charting_mapping("pie", &rows).unwrap();
        assert_eq!(pie["labels"], "CustomerName");
        assert_eq!(pie["values"], "Revenue");
    }

    #[test]
    fn mapping_handles_numeric_strings() {
        let rows = vec![json!({ "Region": "EMEA", "Total": "4200" })];
        let mapping = generate_charting_mapping("line", &rows).unwrap();
        assert_eq!(mapping["y_axis"], "Total");
    }

    #[test]
    fn mapping_fails_without_numeric_column() {
        let rows = vec![json!({ "a": "x", "b": "y" })];
        assert!(generate_charting_mapping("bar", &rows).is_none());
    }

    #[test]
    fn loop_items_flatten_nested_outputs() {
        let mut workflow = Map::new();
        workflow.insert(
            "result_of_phase_1".into(),
            json!([
                { "status": "success", "results": [{ "TableName": "A" }, { "TableName": "B" }] },
                { "status": "success", "results": [{ "TableName": "C" }] }
            ]),
        );
        match extract_loop_items(&json!("result_of_phase_1"), &workflow) {
            LoopSource::Items(items) => {
                let names: Vec<&str> =
                    items.iter().map(|i| i["TableName"].as_str().unwrap()).collect();
                assert_eq!(names, vec!["A", "B", "C"]);
            }
            _ => panic!("expected items"),
        }
    }

    #[test]
    fn loop_over_string_list_is_hallucinated() {
        let workflow = Map::new();
        match extract_loop_items(&json!(["alpha", "beta"]), &workflow) {
            LoopSource::Strings(items) => assert_eq!(items, vec!["alpha", "beta"]),
            _ => panic!("expected strings"),
        }
    }

    #[test]
    fn missing_loop_source_is_empty() {
        let workflow = Map::new();
        assert!(matches!(
            extract_loop_items(&json!("result_of_phase_7"), &workflow),
            LoopSource::Empty
        ));
    }

    #[test]
    fn data_rows_skip_response_rows() {
        let value = json!([
            { "status": "success", "results": [{ "response": "summary text" }] },
            { "status": "success", "results": [{ "Region": "EMEA", "Total": 5 }] }
        ]);
        let rows = data_rows(&value).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Region"], "EMEA");
    }

    #[test]
    fn merge_item_args_uses_schema_synonyms() {
        let t = tool(&[("object_name", true), ("database_name", true)]);
        let mut call_args = args(&[("database_name", json!("SALES"))]);
        let item = json!({ "table_name": "ORDERS", "column_name": "AMOUNT" });
        merge_item_args(&mut call_args, &item, &t);
        assert_eq!(call_args["object_name"], json!("ORDERS"));
        assert_eq!(call_args["column_name"], json!("AMOUNT"));
        assert_eq!(call_args["database_name"], json!("SALES"));
    }
}
