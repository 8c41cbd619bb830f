use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session key
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide session identity: `(user_id, session_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Flat form used for map keys and log fields.
    pub fn flat(&self) -> String {
        format!("{}/{}", self.user_id, self.session_id)
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.flat())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One entry in the conversation history. The assistant text used for LM
/// context and the rich rendered form for the UI are separately
/// addressable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rich: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Success,
    Cancelled,
    Error,
}

/// Persisted summary of one completed (or partial) turn. Turns are
/// immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u32,
    pub user_query: String,
    pub final_summary_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_summary_html: Option<String>,
    /// Ordered `{action, result}` pairs.
    #[serde(default)]
    pub execution_trace: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_llm_plan: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_plan: Option<Value>,
    #[serde(default)]
    pub system_events: Vec<Value>,
    #[serde(default)]
    pub knowledge_events: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_retrieval_event: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub profile_tag: String,
    pub profile_type: String,
    pub turn_input_tokens: u64,
    pub turn_output_tokens: u64,
    pub turn_cost: f64,
    pub session_cost_usd: f64,
    pub session_id: String,
    pub status: TurnStatus,
    #[serde(default)]
    pub is_partial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills_applied: Vec<String>,
    pub duration_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// All state for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub session_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    /// Ordered workflow history of completed turns.
    #[serde(default)]
    pub turns: Vec<TurnRecord>,
    #[serde(default)]
    pub profile_tags_used: Vec<String>,
    #[serde(default)]
    pub models_used: Vec<String>,
}

impl SessionRecord {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.user_id, &self.session_id)
    }

    /// The number the next turn will carry (monotonic within a session).
    pub fn next_turn_number(&self) -> u32 {
        self.turns.last().map(|t| t.turn + 1).unwrap_or(1)
    }

    /// The most recent turn that completed successfully.
    pub fn last_successful_turn(&self) -> Option<&TurnRecord> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.status == TurnStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(n: u32, status: TurnStatus) -> TurnRecord {
        TurnRecord {
            turn: n,
            user_query: "q".into(),
            final_summary_text: String::new(),
            final_summary_html: None,
            execution_trace: vec![],
            raw_llm_plan: None,
            original_plan: None,
            system_events: vec![],
            knowledge_events: vec![],
            knowledge_retrieval_event: None,
            timestamp: Utc::now(),
            provider: "p".into(),
            model: "m".into(),
            profile_tag: "t".into(),
            profile_type: "tool_enabled".into(),
            turn_input_tokens: 0,
            turn_output_tokens: 0,
            turn_cost: 0.0,
            session_cost_usd: 0.0,
            session_id: "s".into(),
            status,
            is_partial: false,
            skills_applied: vec![],
            duration_ms: 0,
        }
    }

    fn session() -> SessionRecord {
        SessionRecord {
            user_id: "u".into(),
            session_id: "s".into(),
            name: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            messages: vec![],
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            turns: vec![],
            profile_tags_used: vec![],
            models_used: vec![],
        }
    }

    #[test]
    fn turn_numbers_are_monotonic() {
        let mut s = session();
        assert_eq!(s.next_turn_number(), 1);
        s.turns.push(turn(1, TurnStatus::Success));
        s.turns.push(turn(2, TurnStatus::Cancelled));
        assert_eq!(s.next_turn_number(), 3);
    }

    #[test]
    fn last_successful_turn_skips_failures() {
        let mut s = session();
        s.turns.push(turn(1, TurnStatus::Success));
        s.turns.push(turn(2, TurnStatus::Error));
        assert_eq!(s.last_successful_turn().unwrap().turn, 1);
    }

    #[test]
    fn session_key_flat_form() {
        let key = SessionKey::new("alice", "s-42");
        assert_eq!(key.flat(), "alice/s-42");
    }

    #[test]
    fn turn_record_serde_keys() {
        let t = turn(1, TurnStatus::Cancelled);
        let raw = serde_json::to_value(&t).unwrap();
        assert_eq!(raw["status"], "cancelled");
        assert_eq!(raw["turn"], 1);
        assert!(raw.get("final_summary_html").is_none());
    }
}
