use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution profiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a turn under this profile executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    /// Plain chat: one LM call over composed context, no tools.
    LlmOnly,
    /// Chat with a tool-calling agent loop (MCP or component tools active).
    ConversationWithTools,
    /// Mandatory knowledge retrieval + synthesis.
    RagFocused,
    /// The full planner / phase-executor path.
    #[default]
    ToolEnabled,
}

impl ProfileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::LlmOnly => "llm_only",
            ProfileType::ConversationWithTools => "conversation_with_tools",
            ProfileType::RagFocused => "rag_focused",
            ProfileType::ToolEnabled => "tool_enabled",
        }
    }
}

/// A profile bundles: which models (with an optional strategic/tactical
/// split), which tool/prompt subset, which system prompts, and which
/// knowledge collections are active for a turn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileConfig {
    pub tag: String,
    #[serde(default)]
    pub profile_type: ProfileType,
    /// Provider id for both channels (single-provider deployments).
    #[serde(default)]
    pub provider: String,
    /// Model for the strategic (meta-planning) channel.
    #[serde(default)]
    pub strategic_model: String,
    /// Model for the tactical (per-phase) channel. `None` = same as
    /// strategic.
    #[serde(default)]
    pub tactical_model: Option<String>,
    /// Named system prompts (planning, tactical, correction, …).
    #[serde(default)]
    pub system_prompts: HashMap<String, String>,
    /// When set, restricts the tool catalog for turns under this profile.
    #[serde(default)]
    pub tool_filter: Option<Vec<String>>,
    /// When set, restricts the prompt catalog.
    #[serde(default)]
    pub prompt_filter: Option<Vec<String>>,
    /// Knowledge collection ids searched during planning / rag turns.
    #[serde(default)]
    pub collections: Vec<String>,
    /// Opt-in for the SQL-consolidation rewrite.
    #[serde(default)]
    pub sql_optimization: bool,
    /// Iteration cap for the conversation-with-tools agent loop.
    #[serde(default = "d_agent_loop")]
    pub agent_loop_max_iterations: u32,
}

fn d_agent_loop() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_type_serde_names() {
        for (ty, name) in [
            (ProfileType::LlmOnly, "llm_only"),
            (ProfileType::ConversationWithTools, "conversation_with_tools"),
            (ProfileType::RagFocused, "rag_focused"),
            (ProfileType::ToolEnabled, "tool_enabled"),
        ] {
            let json = format!("\"{name}\"");
            let parsed: ProfileType = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, ty);
            assert_eq!(ty.as_str(), name);
        }
    }

    #[test]
    fn profile_defaults() {
        let profile: ProfileConfig = serde_json::from_str(r#"{ "tag": "analyst" }"#).unwrap();
        assert_eq!(profile.profile_type, ProfileType::ToolEnabled);
        assert!(profile.tactical_model.is_none());
        assert_eq!(profile.agent_loop_max_iterations, 10);
        assert!(!profile.sql_optimization);
    }
}
