use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits: attachments, history, retries, quota
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-file attachment cap in bytes; larger files are truncated with a
    /// context-optimization event.
    #[serde(default = "d_file_cap")]
    pub attachment_max_file_bytes: usize,
    /// Per-turn total attachment cap; files over it are dropped.
    #[serde(default = "d_total_cap")]
    pub attachment_max_total_bytes: usize,
    /// History messages included in llm-only context assembly.
    #[serde(default = "d_history")]
    pub history_messages: usize,
    /// Attempts per tool action before the phase fails.
    #[serde(default = "d_tool_attempts")]
    pub tool_attempts: u32,
    /// Tactical retries per phase before planner-level recovery.
    #[serde(default = "d_tactical_retries")]
    pub tactical_retries: u32,
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            attachment_max_file_bytes: d_file_cap(),
            attachment_max_total_bytes: d_total_cap(),
            history_messages: d_history(),
            tool_attempts: d_tool_attempts(),
            tactical_retries: d_tactical_retries(),
            quota: QuotaConfig::default(),
        }
    }
}

/// Daily per-user quota limits, checked at turn entry before any LM call.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuotaConfig {
    #[serde(default)]
    pub default_daily_tokens: Option<u64>,
    #[serde(default)]
    pub default_daily_cost_usd: Option<f64>,
    #[serde(default)]
    pub per_user: HashMap<String, UserQuota>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserQuota {
    #[serde(default)]
    pub daily_tokens: Option<u64>,
    #[serde(default)]
    pub daily_cost_usd: Option<f64>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_file_cap() -> usize {
    256 * 1024
}
fn d_total_cap() -> usize {
    1024 * 1024
}
fn d_history() -> usize {
    10
}
fn d_tool_attempts() -> u32 {
    3
}
fn d_tactical_retries() -> u32 {
    5
}
