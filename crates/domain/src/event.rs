//! Canonical event model for the live stream and the per-turn audit trail.
//!
//! Every event maps to one SSE frame `{event: <name>, data: <payload>}`.
//! The payload key sets are part of the external contract — UIs pin
//! badges to them — so each variant carries a typed payload struct and
//! serialisation must stay byte-stable.

use serde::Serialize;
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload structs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `system_message` — progress, corrections, and workarounds.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMessage {
    pub step: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub details: Value,
}

/// Structured `details` body for LM-call system messages.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CallDetails {
    pub summary: String,
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planning_phase: Option<String>,
}

/// `plan_generated`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanGenerated {
    pub step: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// The phase list itself.
    pub details: Value,
    pub metadata: PlanMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanMetadata {
    pub execution_depth: u32,
}

/// `phase_start` / `phase_end`.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseMarker {
    pub step: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub details: PhaseDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseDetails {
    pub phase_num: u32,
    pub total_phases: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_details: Option<Value>,
    pub execution_depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// `tool_intent` / `tool_result` / `tool_error`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEvent {
    pub step: String,
    pub details: Value,
    pub tool_name: String,
}

/// `token_update` — emitted after every LM call.
#[derive(Debug, Clone, Serialize)]
pub struct TokenUpdate {
    pub statement_input: u64,
    pub statement_output: u64,
    pub turn_input: u64,
    pub turn_output: u64,
    pub total_input: u64,
    pub total_output: u64,
    pub call_id: String,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planning_phase: Option<String>,
}

/// `status_indicator_update`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusIndicator {
    pub target: StatusTarget,
    pub state: StatusState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusTarget {
    Llm,
    Db,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusState {
    Busy,
    Idle,
    ProcessingComplete,
}

/// `knowledge_retrieval_start` / `knowledge_reranking_*` /
/// `knowledge_retrieval_complete`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct KnowledgeEvent {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
}

/// `notification` — out-of-band UI signals.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

/// `final_answer` — exactly one per successful turn.
#[derive(Debug, Clone, Serialize)]
pub struct FinalAnswer {
    /// Rich (rendered) form for the UI.
    pub final_answer: Value,
    pub final_answer_text: String,
    pub turn_id: u32,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts_payload: Option<Value>,
    pub source: String,
    pub is_session_primer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_trace: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collected_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_output_tokens: Option<u64>,
}

/// `execution_start` / `execution_complete` / `execution_error` /
/// `execution_cancelled` — turn lifecycle markers.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ExecutionMarker {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `session_name_update`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionNameUpdate {
    pub session_id: String,
    #[serde(rename = "newName")]
    pub new_name: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every event the engine can emit. Serialises to the payload alone;
/// [`AgentEvent::name`] supplies the SSE event name.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AgentEvent {
    SystemMessage(SystemMessage),
    PlanGenerated(PlanGenerated),
    PhaseStart(PhaseMarker),
    PhaseEnd(PhaseMarker),
    ToolIntent(ToolEvent),
    ToolResult(ToolEvent),
    ToolError(ToolEvent),
    TokenUpdate(TokenUpdate),
    StatusIndicator(StatusIndicator),
    KnowledgeRetrievalStart(KnowledgeEvent),
    KnowledgeRerankingStart(KnowledgeEvent),
    KnowledgeRerankingComplete(KnowledgeEvent),
    KnowledgeRetrievalComplete(KnowledgeEvent),
    Notification(Notification),
    /// The synthesis step of a rag-focused turn.
    RagLlmStep(SystemMessage),
    FinalAnswer(FinalAnswer),
    ExecutionStart(ExecutionMarker),
    ExecutionComplete(ExecutionMarker),
    ExecutionError(ExecutionMarker),
    ExecutionCancelled(ExecutionMarker),
    SessionNameUpdate(SessionNameUpdate),
}

impl AgentEvent {
    /// The SSE event name for this payload.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::SystemMessage(_) => "system_message",
            AgentEvent::PlanGenerated(_) => "plan_generated",
            AgentEvent::PhaseStart(_) => "phase_start",
            AgentEvent::PhaseEnd(_) => "phase_end",
            AgentEvent::ToolIntent(_) => "tool_intent",
            AgentEvent::ToolResult(_) => "tool_result",
            AgentEvent::ToolError(_) => "tool_error",
            AgentEvent::TokenUpdate(_) => "token_update",
            AgentEvent::StatusIndicator(_) => "status_indicator_update",
            AgentEvent::KnowledgeRetrievalStart(_) => "knowledge_retrieval_start",
            AgentEvent::KnowledgeRerankingStart(_) => "knowledge_reranking_start",
            AgentEvent::KnowledgeRerankingComplete(_) => "knowledge_reranking_complete",
            AgentEvent::KnowledgeRetrievalComplete(_) => "knowledge_retrieval_complete",
            AgentEvent::Notification(_) => "notification",
            AgentEvent::RagLlmStep(_) => "rag_llm_step",
            AgentEvent::FinalAnswer(_) => "final_answer",
            AgentEvent::ExecutionStart(_) => "execution_start",
            AgentEvent::ExecutionComplete(_) => "execution_complete",
            AgentEvent::ExecutionError(_) => "execution_error",
            AgentEvent::ExecutionCancelled(_) => "execution_cancelled",
            AgentEvent::SessionNameUpdate(_) => "session_name_update",
        }
    }

    /// The serialised payload.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    // ── Constructors for the common shapes ──────────────────────────

    pub fn system(step: impl Into<String>, kind: impl Into<String>, details: Value) -> Self {
        AgentEvent::SystemMessage(SystemMessage {
            step: step.into(),
            kind: kind.into(),
            details,
        })
    }

    /// A `system_message` with `type: "workaround"` — a deterministic
    /// correction the engine applied on the plan's behalf.
    pub fn workaround(step: impl Into<String>, details: Value) -> Self {
        Self::system(step, "workaround", details)
    }

    pub fn status(target: StatusTarget, state: StatusState) -> Self {
        AgentEvent::StatusIndicator(StatusIndicator { target, state })
    }

    pub fn llm_busy() -> Self {
        Self::status(StatusTarget::Llm, StatusState::Busy)
    }

    pub fn llm_idle() -> Self {
        Self::status(StatusTarget::Llm, StatusState::Idle)
    }

    pub fn db_busy() -> Self {
        Self::status(StatusTarget::Db, StatusState::Busy)
    }

    pub fn db_idle() -> Self {
        Self::status(StatusTarget::Db, StatusState::Idle)
    }

    pub fn tool_intent(step: impl Into<String>, tool_name: impl Into<String>, details: Value) -> Self {
        AgentEvent::ToolIntent(ToolEvent {
            step: step.into(),
            details,
            tool_name: tool_name.into(),
        })
    }

    pub fn tool_result(tool_name: impl Into<String>, details: Value) -> Self {
        AgentEvent::ToolResult(ToolEvent {
            step: "Tool Execution Result".into(),
            details,
            tool_name: tool_name.into(),
        })
    }

    pub fn tool_error(tool_name: impl Into<String>, details: Value) -> Self {
        AgentEvent::ToolError(ToolEvent {
            step: "Tool Execution Error".into(),
            details,
            tool_name: tool_name.into(),
        })
    }
}
