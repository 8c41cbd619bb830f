//! The top-level turn controller.
//!
//! `PlanExecutor` owns one turn: it checks quota, resolves the session,
//! picks the execution mode from the profile type, drives planning →
//! execution → summarisation, and persists the turn record on every
//! exit path — success, cancellation, or error. Sub-executors (prompt
//! phases) recurse through [`PlanExecutor::run_sub_process`] at
//! `depth + 1`, sharing the parent's workflow state and action history.

use std::sync::Arc;

use async_recursion::async_recursion;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use tess_domain::error::{Error, Result};
use tess_domain::event::{
    AgentEvent, ExecutionMarker, FinalAnswer, KnowledgeEvent, SessionNameUpdate, SystemMessage,
};
use tess_domain::plan::INJECTED_PREVIOUS_TURN_DATA;
use tess_domain::tool::names;
use tess_planner::{
    knowledge, PlanRequest, PlanResult, Planner, PlannerOutput, PreviousTurnContext,
};
use tess_providers::{ChatRequest, ContentPart, Message, MessageContent, ToolSpec};
use tess_sessions::{SessionKey, SessionStore, TurnRecord, TurnStatus};

use crate::attach::{build_attachment_context, Attachment};
use crate::cancel::{CancelMap, CancelToken};
use crate::capabilities::TurnCapabilities;
use crate::events::EventBus;
use crate::llm::{LlmRunner, PlanningPhase};
use crate::orchestrate::ConstraintCache;
use crate::quota::QuotaTracker;
use crate::workflow::TurnState;

/// Replans allowed after a phase-level failure.
const MAX_RECOVERY_REPLANS: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An active prompt-library flow selected by the user.
#[derive(Debug, Clone)]
pub struct ActivePrompt {
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Input to a single turn.
pub struct TurnInput {
    pub key: SessionKey,
    pub user_query: String,
    pub active_prompt: Option<ActivePrompt>,
    pub attachments: Vec<Attachment>,
    /// Where the turn came from (`"user"`, `"primer"`, …).
    pub source: String,
    pub is_session_primer: bool,
}

/// Shared services a turn runs against.
#[derive(Clone)]
pub struct TurnDeps {
    pub caps: Arc<TurnCapabilities>,
    pub sessions: Arc<SessionStore>,
    pub cancel_map: Arc<CancelMap>,
    pub quota: Arc<QuotaTracker>,
}

/// Run one turn. Returns a channel of events; the turn task runs in the
/// background and reaches exactly one terminal event (`final_answer` +
/// `execution_complete`, `execution_cancelled`, or `execution_error`).
pub fn run_turn(deps: TurnDeps, input: TurnInput) -> mpsc::Receiver<AgentEvent> {
    let (tx, rx) = mpsc::channel::<AgentEvent>(64);
    tokio::spawn(async move {
        let bus = Arc::new(EventBus::new(tx));
        let cancel = deps.cancel_map.register(&input.key);
        run_turn_inner(&deps, bus, cancel, input).await;
    });
    rx
}

async fn run_turn_inner(deps: &TurnDeps, bus: Arc<EventBus>, cancel: CancelToken, input: TurnInput) {
    let cleanup_key = input.key.clone();
    let started = deps.caps.clock.now();
    let (session, _) = deps.sessions.resolve_or_create(&input.key);
    let turn = session.next_turn_number();

    let runner = Arc::new(LlmRunner::new(
        bus.clone(),
        deps.caps.llm.clone(),
        deps.caps.registry.clone(),
        deps.sessions.clone(),
        input.key.clone(),
    ));

    let executor = PlanExecutor {
        caps: deps.caps.clone(),
        bus: bus.clone(),
        runner: runner.clone(),
        sessions: deps.sessions.clone(),
        key: input.key.clone(),
        cancel,
        depth: 0,
        turn,
        user_query: input.user_query.clone(),
        constraints: ConstraintCache::new(),
    };

    bus.emit(AgentEvent::ExecutionStart(ExecutionMarker {
        profile_type: Some(deps.caps.profile.profile_type.as_str().into()),
        profile_tag: Some(deps.caps.profile.tag.clone()),
        turn_id: Some(turn),
        session_id: Some(input.key.session_id.clone()),
        ..Default::default()
    }))
    .await;

    let mut state = TurnState::new();
    let mut draft = TurnDraft::default();

    // Rate/quota limits reject the turn before any LM call runs.
    let result = match deps.quota.check(&input.key.user_id, deps.caps.clock.as_ref()) {
        Err(e) => Err(e),
        Ok(()) => executor.drive(&input, &mut state, &mut draft).await,
    };

    // Record this turn's usage against the daily quota window.
    {
        let (turn_input, turn_output, turn_cost) = runner.turn_totals();
        deps.quota.record(
            &input.key.user_id,
            turn_input + turn_output,
            turn_cost,
            deps.caps.clock.as_ref(),
        );
    }

    let (turn_input, turn_output, turn_cost) = runner.turn_totals();
    let duration_ms = (deps.caps.clock.now() - started).num_milliseconds().max(0) as u64;

    let (status, is_partial) = match &result {
        Ok(()) => (TurnStatus::Success, false),
        Err(Error::Cancelled) => (TurnStatus::Cancelled, true),
        Err(_) => (TurnStatus::Error, true),
    };

    match &result {
        Ok(()) => {
            bus.emit(AgentEvent::ExecutionComplete(ExecutionMarker {
                profile_type: Some(deps.caps.profile.profile_type.as_str().into()),
                profile_tag: Some(deps.caps.profile.tag.clone()),
                turn_id: Some(turn),
                session_id: Some(input.key.session_id.clone()),
                total_input_tokens: Some(turn_input),
                total_output_tokens: Some(turn_output),
                duration_ms: Some(duration_ms),
                cost_usd: Some(turn_cost),
                success: Some(true),
                ..Default::default()
            }))
            .await;
        }
        Err(Error::Cancelled) => {
            bus.emit(AgentEvent::ExecutionCancelled(ExecutionMarker {
                turn_id: Some(turn),
                session_id: Some(input.key.session_id.clone()),
                total_input_tokens: Some(turn_input),
                total_output_tokens: Some(turn_output),
                duration_ms: Some(duration_ms),
                success: Some(false),
                ..Default::default()
            }))
            .await;
        }
        Err(e) => {
            tracing::error!(error = %e, "turn failed");
            bus.emit(AgentEvent::ExecutionError(ExecutionMarker {
                turn_id: Some(turn),
                session_id: Some(input.key.session_id.clone()),
                total_input_tokens: Some(turn_input),
                total_output_tokens: Some(turn_output),
                duration_ms: Some(duration_ms),
                success: Some(false),
                error: Some(e.to_string()),
                ..Default::default()
            }))
            .await;
        }
    }

    // Persist the turn — partial turns included.
    let (_, _, session_cost) = deps.sessions.totals(&input.key);
    let (strategic_model, _) = runner.models();
    let record = TurnRecord {
        turn,
        user_query: input.user_query.clone(),
        final_summary_text: draft.final_text.clone(),
        final_summary_html: None,
        execution_trace: state.trace(),
        raw_llm_plan: draft.raw_plan.clone(),
        original_plan: draft.original_plan.clone(),
        system_events: bus.system_events(),
        knowledge_events: bus.knowledge_events(),
        knowledge_retrieval_event: draft.knowledge_retrieval_event.clone(),
        timestamp: deps.caps.clock.now(),
        provider: runner.provider_id().to_string(),
        model: strategic_model.to_string(),
        profile_tag: deps.caps.profile.tag.clone(),
        profile_type: deps.caps.profile.profile_type.as_str().to_string(),
        turn_input_tokens: turn_input,
        turn_output_tokens: turn_output,
        turn_cost,
        session_cost_usd: session_cost,
        session_id: input.key.session_id.clone(),
        status,
        is_partial,
        skills_applied: Vec::new(),
        duration_ms,
    };
    deps.sessions.append_turn(&input.key, record);
    if let Err(e) = deps.sessions.flush() {
        tracing::warn!(error = %e, "session flush failed");
    }

    deps.cancel_map.remove(&cleanup_key);
}

/// Turn-level artifacts accumulated for persistence.
#[derive(Default)]
pub(crate) struct TurnDraft {
    pub raw_plan: Option<Value>,
    pub original_plan: Option<Value>,
    pub final_text: String,
    pub knowledge_retrieval_event: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PlanExecutor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PlanExecutor {
    pub(crate) caps: Arc<TurnCapabilities>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) runner: Arc<LlmRunner>,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) key: SessionKey,
    pub(crate) cancel: CancelToken,
    pub(crate) depth: u32,
    pub(crate) turn: u32,
    pub(crate) user_query: String,
    pub(crate) constraints: ConstraintCache,
}

impl PlanExecutor {
    /// Drive one turn through its profile's execution mode.
    async fn drive(
        &self,
        input: &TurnInput,
        state: &mut TurnState,
        draft: &mut TurnDraft,
    ) -> Result<()> {
        self.cancel.check()?;
        self.sessions
            .append_message(&self.key, "user", &input.user_query, None);

        use tess_domain::config::ProfileType::*;
        match self.caps.profile.profile_type {
            LlmOnly => self.mode_llm_only(input, draft).await,
            ConversationWithTools => self.mode_agent_loop(input, state, draft).await,
            RagFocused => self.mode_rag(input, draft).await,
            ToolEnabled => self.mode_tool_enabled(input, state, draft).await,
        }
    }

    // ── Mode 1: llm-only ────────────────────────────────────────────

    async fn mode_llm_only(&self, input: &TurnInput, draft: &mut TurnDraft) -> Result<()> {
        let mut events = Vec::new();
        let mut parts = build_attachment_context(
            &input.attachments,
            &self.caps.limits,
            true,
            &mut events,
        );
        for event in events {
            self.bus.emit(event).await;
        }

        // Retrieved knowledge rides along when collections are configured.
        let (_docs, knowledge_context, retrieval_event) =
            self.retrieve_knowledge(&input.user_query).await?;
        draft.knowledge_retrieval_event = retrieval_event;
        if !knowledge_context.is_empty() {
            parts.push(ContentPart::Text {
                text: format!("Relevant knowledge:\n{knowledge_context}"),
            });
        }

        let session = self
            .sessions
            .get(&self.key)
            .ok_or_else(|| Error::Session("session disappeared mid-turn".into()))?;
        let history: Vec<Message> = session
            .messages
            .iter()
            .rev()
            .skip(1) // the user message we just appended
            .take(self.caps.limits.history_messages)
            .rev()
            .map(|m| match m.role.as_str() {
                "assistant" => Message::assistant(&m.text),
                _ => Message::user(&m.text),
            })
            .collect();

        let mut messages = vec![Message::system(self.caps.system_prompt(
            "chat",
            "You are a helpful assistant. Answer directly and concisely.",
        ))];
        messages.extend(history);
        let mut user_parts = vec![ContentPart::Text {
            text: input.user_query.clone(),
        }];
        user_parts.splice(0..0, parts);
        messages.push(Message {
            role: tess_providers::Role::User,
            content: MessageContent::Parts(user_parts),
        });

        self.cancel.check()?;
        let resp = self
            .runner
            .chat(
                PlanningPhase::Strategic,
                "Direct response",
                ChatRequest {
                    messages,
                    ..Default::default()
                },
            )
            .await?;

        self.finish_with_answer(draft, resp.content, "llm_only", input).await
    }

    // ── Mode 2: conversation-with-tools ─────────────────────────────

    async fn mode_agent_loop(
        &self,
        input: &TurnInput,
        state: &mut TurnState,
        draft: &mut TurnDraft,
    ) -> Result<()> {
        let tool_specs: Vec<ToolSpec> = self
            .caps
            .tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: json!({
                    "type": "object",
                    "properties": t.args.iter().map(|a| {
                        (a.name.clone(), json!({ "type": a.arg_type, "description": a.description }))
                    }).collect::<Map<String, Value>>(),
                    "required": t.args.iter().filter(|a| a.required).map(|a| a.name.clone()).collect::<Vec<_>>(),
                }),
            })
            .collect();

        let mut messages = vec![
            Message::system(self.caps.system_prompt(
                "chat",
                "You are a helpful assistant with tools. Use them when they help.",
            )),
            Message::user(&input.user_query),
        ];

        for iteration in 0..self.caps.profile.agent_loop_max_iterations {
            self.cancel.check()?;
            let resp = self
                .runner
                .chat(
                    PlanningPhase::Tactical,
                    "Agent loop step",
                    ChatRequest {
                        messages: messages.clone(),
                        tools: tool_specs.clone(),
                        ..Default::default()
                    },
                )
                .await?;

            if resp.tool_calls.is_empty() {
                return self
                    .finish_with_answer(draft, resp.content, "agent_loop", input)
                    .await;
            }

            messages.push(Message::assistant(&resp.content));
            for call in resp.tool_calls {
                self.cancel.check()?;
                self.bus
                    .emit(AgentEvent::tool_intent(
                        "Agent Tool Call",
                        &call.tool_name,
                        call.arguments.clone(),
                    ))
                    .await;
                let output = self
                    .invoke_capability(&call.tool_name, &call.arguments, state)
                    .await;
                let event = if output.is_success() {
                    AgentEvent::tool_result(&call.tool_name, output.to_value())
                } else {
                    AgentEvent::tool_error(&call.tool_name, output.to_value())
                };
                self.bus.emit(event).await;
                state.record_action(
                    &call.tool_name,
                    &call.arguments,
                    iteration + 1,
                    self.depth,
                    self.caps.clock.now(),
                    output.to_value(),
                );
                messages.push(Message::tool_result(
                    &call.call_id,
                    serde_json::to_string(&output.to_value())?,
                ));
            }
        }

        Err(Error::PhaseStall(format!(
            "agent loop limit reached ({} iterations)",
            self.caps.profile.agent_loop_max_iterations
        )))
    }

    /// Dispatch a capability in agent-loop mode: system tools run in the
    /// engine, everything else crosses the protocol.
    async fn invoke_capability(
        &self,
        tool_name: &str,
        arguments: &Value,
        state: &TurnState,
    ) -> tess_domain::tool::ToolOutput {
        let args = arguments.as_object().cloned().unwrap_or_default();
        if crate::systools::is_system_tool(tool_name) {
            match crate::systools::execute(
                tool_name,
                &args,
                &self.runner,
                self.caps.clock.as_ref(),
                &self.user_query,
                &state.collected,
            )
            .await
            {
                Ok(output) => output,
                Err(e) => tess_domain::tool::ToolOutput::error(tool_name, e.to_string()),
            }
        } else {
            match self
                .caps
                .host
                .invoke_tool(tool_name, Value::Object(args))
                .await
            {
                Ok(output) => output,
                Err(e) => tess_domain::tool::ToolOutput::error(tool_name, e.to_string()),
            }
        }
    }

    // ── Mode 3: rag-focused ─────────────────────────────────────────

    async fn mode_rag(&self, input: &TurnInput, draft: &mut TurnDraft) -> Result<()> {
        let (docs, context, retrieval_event) = self.retrieve_knowledge(&input.user_query).await?;
        draft.knowledge_retrieval_event = retrieval_event;

        if docs.is_empty() {
            // An explicit, successful "nothing found" answer — not an error.
            return self
                .finish_with_answer(
                    draft,
                    "No knowledge documents matched your question in the configured collections."
                        .to_string(),
                    "rag",
                    input,
                )
                .await;
        }

        self.bus
            .emit(AgentEvent::RagLlmStep(SystemMessage {
                step: "Synthesizing from retrieved knowledge".into(),
                kind: "rag_llm_step".into(),
                details: json!({ "document_count": docs.len() }),
            }))
            .await;

        self.cancel.check()?;
        let answer = self
            .runner
            .complete(
                PlanningPhase::Strategic,
                "Knowledge synthesis",
                "Answer strictly from the provided context. Cite nothing the context does not support.",
                &format!("Context:\n{context}\n\nQuestion: {}", input.user_query),
                false,
            )
            .await?;

        let output = tess_domain::tool::ToolOutput::response(names::CONTEXT_REPORT, &answer);
        self.bus
            .emit(AgentEvent::tool_result(names::CONTEXT_REPORT, output.to_value()))
            .await;

        let sources: Vec<String> = docs.iter().map(|d| format!("- {}", d.title)).collect();
        let text = format!("{answer}\n\nSources:\n{}", sources.join("\n"));
        self.finish_with_answer(draft, text, "rag", input).await
    }

    /// Shared retrieval path: events, diversity balancing, reranking,
    /// token-budgeted formatting.
    pub(crate) async fn retrieve_knowledge(
        &self,
        query: &str,
    ) -> Result<(Vec<knowledge::RetrievedDocument>, String, Option<Value>)> {
        let collections: Vec<String> = if self.caps.profile.collections.is_empty() {
            self.caps
                .knowledge
                .collections
                .iter()
                .map(|c| c.id.clone())
                .collect()
        } else {
            self.caps.profile.collections.clone()
        };
        let Some(retriever) = &self.caps.retriever else {
            return Ok((Vec::new(), String::new(), None));
        };
        if collections.is_empty() {
            return Ok((Vec::new(), String::new(), None));
        }

        let started = self.caps.clock.now();
        self.bus
            .emit(AgentEvent::KnowledgeRetrievalStart(KnowledgeEvent {
                collections: collections.clone(),
                ..Default::default()
            }))
            .await;

        self.cancel.check()?;
        let raw = retriever
            .retrieve(query, &collections, self.caps.knowledge.max_documents * 2)
            .await?;
        let chunks: usize = raw.iter().map(|d| d.chunk_count).sum();
        let balanced =
            knowledge::balance_collection_diversity(raw, self.caps.knowledge.max_documents * 2);

        let docs = if self.caps.knowledge.rerank && balanced.len() > 1 {
            self.bus
                .emit(AgentEvent::KnowledgeRerankingStart(KnowledgeEvent {
                    document_count: Some(balanced.len()),
                    ..Default::default()
                }))
                .await;
            let reranked = knowledge::rerank_with_llm(
                self.runner.as_ref(),
                query,
                balanced,
                self.caps.knowledge.max_documents,
            )
            .await;
            self.bus
                .emit(AgentEvent::KnowledgeRerankingComplete(KnowledgeEvent {
                    document_count: Some(reranked.len()),
                    ..Default::default()
                }))
                .await;
            reranked
        } else {
            balanced
                .into_iter()
                .take(self.caps.knowledge.max_documents)
                .collect()
        };

        let duration_ms = (self.caps.clock.now() - started).num_milliseconds().max(0) as u64;
        let complete = KnowledgeEvent {
            collections: collections.clone(),
            document_count: Some(docs.len()),
            duration_ms: Some(duration_ms),
            chunks: Some(chunks),
        };
        let retrieval_event = serde_json::to_value(&complete).ok();
        self.bus
            .emit(AgentEvent::KnowledgeRetrievalComplete(complete))
            .await;

        let context =
            knowledge::format_with_token_budget(&docs, self.caps.knowledge.max_context_tokens);
        Ok((docs, context, retrieval_event))
    }

    // ── Mode 4: tool-enabled ────────────────────────────────────────

    async fn mode_tool_enabled(
        &self,
        input: &TurnInput,
        state: &mut TurnState,
        draft: &mut TurnDraft,
    ) -> Result<()> {
        // Knowledge context for planning (optional).
        let (_docs, knowledge_context, retrieval_event) =
            self.retrieve_knowledge(&input.user_query).await?;
        draft.knowledge_retrieval_event = retrieval_event;

        // Active prompt body, when a prompt-library flow is selected.
        let active_body = match &input.active_prompt {
            Some(active) => Some(
                self.caps
                    .host
                    .prompt_body(&active.name, Value::Object(active.arguments.clone()))
                    .await?,
            ),
            None => None,
        };

        let previous = self.previous_turn_context();
        let previous_summary = previous.as_ref().map(|p| {
            format!(
                "Previous request: {}\nTools used: {}",
                p.user_query,
                p.data_tools.join(", ")
            )
        });
        let few_shot = self.few_shot_examples();

        self.cancel.check()?;
        let mut events = Vec::new();
        let result = self
            .generate_plan(
                input,
                active_body.as_deref(),
                previous.as_ref(),
                previous_summary.as_deref(),
                &knowledge_context,
                &few_shot,
                None,
                &mut events,
            )
            .await?;
        for event in events.drain(..) {
            self.bus.emit(event).await;
        }

        let mut plan = match result.output {
            PlannerOutput::Conversational(text) => {
                return self
                    .finish_with_answer(draft, text, "conversational", input)
                    .await;
            }
            PlannerOutput::Plan(phases) => phases,
        };
        draft.raw_plan = Some(result.raw_plan);
        draft.original_plan = Some(serde_json::to_value(&plan)?);

        // Seed workflow state: rewriter hydration first, then the
        // previous turn's data for chart-only follow-ups.
        let mut seed = result.workflow_seed;
        if let Some(prev_result) = previous.as_ref().and_then(|p| p.last_successful_result.clone())
        {
            seed.entry(INJECTED_PREVIOUS_TURN_DATA.to_string())
                .or_insert(prev_result);
        }
        *state = TurnState::with_seed(seed);

        // EXECUTING: drive phases, with one recovery replan on stall.
        let mut replans_left = MAX_RECOVERY_REPLANS;
        let mut idx = 0usize;
        while idx < plan.len() {
            self.cancel.check()?;
            let phase = plan[idx].clone();
            match self.execute_phase(&phase, &plan, state).await {
                Ok(()) => idx += 1,
                Err(e) if e.is_terminal() => return Err(e),
                Err(Error::DefinitiveTool { friendly, raw }) => {
                    tracing::warn!(%raw, "definitive tool error, reporting to user");
                    return self
                        .finish_with_answer(draft, friendly, "definitive_error", input)
                        .await;
                }
                Err(e) if replans_left > 0 => {
                    replans_left -= 1;
                    tracing::warn!(error = %e, "phase failed, invoking planner recovery");
                    let replan_context = format!(
                        "The phase \"{}\" failed: {e}.\nWorkflow state so far:\n{}",
                        phase.goal,
                        state.distilled()
                    );
                    let mut events = Vec::new();
                    let recovery = self
                        .generate_plan(
                            input,
                            active_body.as_deref(),
                            previous.as_ref(),
                            previous_summary.as_deref(),
                            &knowledge_context,
                            &few_shot,
                            Some(&replan_context),
                            &mut events,
                        )
                        .await?;
                    for event in events.drain(..) {
                        self.bus.emit(event).await;
                    }
                    match recovery.output {
                        PlannerOutput::Plan(new_plan) => {
                            plan = new_plan;
                            idx = 0;
                        }
                        PlannerOutput::Conversational(text) => {
                            return self
                                .finish_with_answer(draft, text, "recovery", input)
                                .await;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // SUMMARIZING: the final phase's response is the answer.
        let final_text = state
            .last_output
            .as_ref()
            .and_then(|output| {
                output
                    .results
                    .first()
                    .and_then(|row| row.get("response"))
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| "The request completed but produced no report.".to_string());

        self.finish_with_answer_traced(draft, final_text, "planner", input, state)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn generate_plan(
        &self,
        input: &TurnInput,
        active_body: Option<&str>,
        previous: Option<&PreviousTurnContext>,
        previous_summary: Option<&str>,
        knowledge_context: &str,
        few_shot: &[String],
        replan_context: Option<&str>,
        events: &mut Vec<AgentEvent>,
    ) -> Result<PlanResult> {
        let system_prompt = self.caps.system_prompt(
            "planning",
            "You are the strategic planner of a data agent. Produce a minimal, correct phase plan.",
        );
        let active = input
            .active_prompt
            .as_ref()
            .zip(active_body)
            .map(|(a, body)| (a.name.as_str(), &a.arguments, body));
        let request = PlanRequest {
            user_query: &input.user_query,
            active_prompt: active,
            previous_turn_summary: previous_summary,
            previous_turn: previous,
            knowledge_context,
            few_shot_examples: few_shot,
            tools: &self.caps.tools,
            prompts: &self.caps.prompts,
            system_prompt: &system_prompt,
            sql_optimization: self.caps.profile.sql_optimization,
            is_sub_process: self.depth > 0,
            execution_depth: self.depth,
            replan_context,
        };
        Planner::generate(&request, self.runner.as_ref(), events).await
    }

    /// Context about the previous turn for the rewriters.
    fn previous_turn_context(&self) -> Option<PreviousTurnContext> {
        let session = self.sessions.get(&self.key)?;
        let last = session.last_successful_turn()?;

        let mut data_tools = Vec::new();
        let mut sql_texts = Vec::new();
        let mut last_successful_result = None;
        for entry in &last.execution_trace {
            let tool = entry
                .pointer("/action/tool_name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !tool.is_empty() && !names::is_reporting(tool) && tool != names::SYSTEM_LOG {
                if !data_tools.iter().any(|t| t == tool) {
                    data_tools.push(tool.to_string());
                }
            }
            if let Some(sql) = entry
                .pointer("/action/arguments/sql_text")
                .and_then(Value::as_str)
            {
                sql_texts.push(sql.to_string());
            }
            if entry.pointer("/result/status").and_then(Value::as_str) == Some("success") {
                let has_rows = entry
                    .pointer("/result/results")
                    .and_then(Value::as_array)
                    .is_some_and(|rows| {
                        !rows.is_empty()
                            && rows.first().and_then(|r| r.get("response")).is_none()
                    });
                if has_rows {
                    last_successful_result = entry.get("result").cloned();
                }
            }
        }

        Some(PreviousTurnContext {
            user_query: last.user_query.clone(),
            data_tools,
            sql_texts,
            last_successful_result,
        })
    }

    /// Few-shot examples: the final plans of this session's recent
    /// successful turns.
    fn few_shot_examples(&self) -> Vec<String> {
        let Some(session) = self.sessions.get(&self.key) else {
            return Vec::new();
        };
        session
            .turns
            .iter()
            .rev()
            .filter(|t| t.status == TurnStatus::Success)
            .filter_map(|t| t.original_plan.as_ref())
            .take(2)
            .map(|plan| plan.to_string())
            .collect()
    }

    // ── Sub-processes ───────────────────────────────────────────────

    /// Execute a prompt capability as a nested plan at `depth + 1`. The
    /// sub-executor shares this turn's workflow state and action history
    /// (the same `&mut TurnState`), so the parent re-adopts its writes.
    #[async_recursion]
    pub(crate) async fn run_sub_process(
        &self,
        prompt_name: &str,
        arguments: Map<String, Value>,
        state: &mut TurnState,
    ) -> Result<()> {
        self.cancel.check()?;
        self.bus
            .emit(AgentEvent::workaround(
                "Prompt Execution Granted",
                json!(format!("Executing prompt '{prompt_name}' as a sub-task.")),
            ))
            .await;

        let body = self
            .caps
            .host
            .prompt_body(prompt_name, Value::Object(arguments.clone()))
            .await?;

        let sub = PlanExecutor {
            caps: self.caps.clone(),
            bus: self.bus.clone(),
            runner: self.runner.clone(),
            sessions: self.sessions.clone(),
            key: self.key.clone(),
            cancel: self.cancel.clone(),
            depth: self.depth + 1,
            turn: self.turn,
            user_query: self.user_query.clone(),
            constraints: ConstraintCache::new(),
        };

        let mut events = Vec::new();
        let system_prompt = sub.caps.system_prompt(
            "planning",
            "You are the strategic planner of a data agent. Produce a minimal, correct phase plan.",
        );
        let request = PlanRequest {
            user_query: &sub.user_query,
            active_prompt: Some((prompt_name, &arguments, body.as_str())),
            previous_turn_summary: None,
            previous_turn: None,
            knowledge_context: "",
            few_shot_examples: &[],
            tools: &sub.caps.tools,
            prompts: &sub.caps.prompts,
            system_prompt: &system_prompt,
            sql_optimization: sub.caps.profile.sql_optimization,
            is_sub_process: true,
            execution_depth: sub.depth,
            replan_context: None,
        };
        let result = Planner::generate(&request, sub.runner.as_ref(), &mut events).await?;
        for event in events {
            sub.bus.emit(event).await;
        }

        match result.output {
            PlannerOutput::Conversational(text) => {
                // A conversational sub-plan contributes its text as data.
                let output =
                    tess_domain::tool::ToolOutput::response(names::CONTEXT_REPORT, &text);
                state.last_output = Some(output);
                Ok(())
            }
            PlannerOutput::Plan(plan) => {
                for (key, value) in result.workflow_seed {
                    state.workflow.entry(key).or_insert(value);
                }
                for phase in &plan {
                    sub.cancel.check()?;
                    sub.execute_phase(phase, &plan, state).await?;
                }
                Ok(())
            }
        }
    }

    // ── Finalisation ────────────────────────────────────────────────

    async fn finish_with_answer(
        &self,
        draft: &mut TurnDraft,
        text: String,
        source: &str,
        input: &TurnInput,
    ) -> Result<()> {
        let empty = TurnState::new();
        self.finish_with_answer_traced(draft, text, source, input, &empty)
            .await
    }

    async fn finish_with_answer_traced(
        &self,
        draft: &mut TurnDraft,
        text: String,
        source: &str,
        input: &TurnInput,
        state: &TurnState,
    ) -> Result<()> {
        draft.final_text = text.clone();
        let rich = json!({ "markdown": text });
        let (turn_input, turn_output, _) = self.runner.turn_totals();

        self.sessions
            .append_message(&self.key, "assistant", &text, Some(rich.clone()));

        self.bus
            .emit(AgentEvent::FinalAnswer(FinalAnswer {
                final_answer: rich,
                final_answer_text: text,
                turn_id: self.turn,
                session_id: self.key.session_id.clone(),
                tts_payload: None,
                source: source.to_string(),
                is_session_primer: input.is_session_primer,
                execution_trace: if state.history.is_empty() {
                    None
                } else {
                    Some(Value::Array(state.trace()))
                },
                collected_data: if state.collected.is_empty() {
                    None
                } else {
                    Some(Value::Array(state.collected.clone()))
                },
                turn_input_tokens: Some(turn_input),
                turn_output_tokens: Some(turn_output),
            }))
            .await;

        self.maybe_name_session().await;
        Ok(())
    }

    /// Name the session after its first completed turn.
    async fn maybe_name_session(&self) {
        if self.depth > 0 {
            return;
        }
        let Some(session) = self.sessions.get(&self.key) else {
            return;
        };
        if !session.name.is_empty() {
            return;
        }
        let name = match self
            .runner
            .complete(
                PlanningPhase::Tactical,
                "Generating session name",
                "Produce a 3-6 word title for this conversation. Respond with the title only.",
                &self.user_query,
                false,
            )
            .await
        {
            Ok(name) => name.trim().trim_matches('"').to_string(),
            Err(e) => {
                tracing::debug!(error = %e, "session naming failed, keeping empty name");
                return;
            }
        };
        if name.is_empty() {
            return;
        }
        self.sessions.update_name(&self.key, &name);
        self.bus
            .emit(AgentEvent::SessionNameUpdate(SessionNameUpdate {
                session_id: self.key.session_id.clone(),
                new_name: name,
            }))
            .await;
    }
}
