//! Self-correction strategies for tool-execution failures.
//!
//! A failed tool call is matched against a fixed strategy order:
//! table-not-found, column-not-found, then the generic fallback. Each
//! strategy asks the LM for a corrected action (new arguments, a tool
//! switch, or a prompt delegation); any strategy may instead conclude
//! the task with `FINAL_ANSWER:`. Definitive errors bypass correction
//! entirely.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

use tess_domain::error::{Error, Result};
use tess_domain::tool::{names, ToolOutput};
use tess_planner::extract_json;

use crate::capabilities::TurnCapabilities;
use crate::llm::{LlmRunner, PlanningPhase};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Unrecoverable tool errors, mapped to the user-facing message.
pub const DEFINITIVE_TOOL_ERRORS: &[(&str, &str)] = &[
    (
        "Invalid query",
        "The generated query was invalid and could not be run against the database.",
    ),
    (
        "3523",
        "The user does not have the necessary permissions for the requested object.",
    ),
];

static TABLE_NOT_FOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Object '([\w\.]+)' does not exist").expect("regex"));
static COLUMN_NOT_FOUND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Column '(\w+)' does not exist").expect("regex"));

/// The friendly message for a definitive error, if the text matches one.
pub fn match_definitive(error_text: &str) -> Option<&'static str> {
    DEFINITIVE_TOOL_ERRORS
        .iter()
        .find(|(pattern, _)| error_text.contains(pattern))
        .map(|(_, friendly)| *friendly)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Strategies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The recovery procedures, checked in declaration order. Flat tagged
/// values — variation lives in the match arms, not a class hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    TableNotFound,
    ColumnNotFound,
    Generic,
}

const STRATEGY_ORDER: &[Strategy] = &[
    Strategy::TableNotFound,
    Strategy::ColumnNotFound,
    Strategy::Generic,
];

impl Strategy {
    fn can_handle(&self, error_text: &str) -> bool {
        match self {
            Strategy::TableNotFound => TABLE_NOT_FOUND.is_match(error_text),
            Strategy::ColumnNotFound => COLUMN_NOT_FOUND.is_match(error_text),
            Strategy::Generic => true,
        }
    }
}

/// What a correction attempt produced.
#[derive(Debug, Clone)]
pub enum CorrectionOutcome {
    /// A corrected action to try next: `{tool_name | prompt_name, arguments}`.
    Corrected(Value),
    /// The strategy concluded the task with a user-visible answer.
    FinalAnswer(String),
    /// No usable correction.
    Unrecoverable,
}

/// Strategy dispatcher for one turn.
pub struct CorrectionHandler<'a> {
    runner: &'a LlmRunner,
    caps: &'a TurnCapabilities,
    user_query: &'a str,
}

impl<'a> CorrectionHandler<'a> {
    pub fn new(runner: &'a LlmRunner, caps: &'a TurnCapabilities, user_query: &'a str) -> Self {
        Self {
            runner,
            caps,
            user_query,
        }
    }

    /// Pick the first strategy whose `can_handle` matches and run it.
    pub async fn attempt(
        &self,
        failed_action: &Value,
        error: &ToolOutput,
    ) -> Result<CorrectionOutcome> {
        let error_text = error.error_context();
        let strategy = STRATEGY_ORDER
            .iter()
            .copied()
            .find(|s| s.can_handle(&error_text))
            .unwrap_or(Strategy::Generic);
        tracing::info!(?strategy, "attempting self-correction");

        match strategy {
            Strategy::TableNotFound => {
                let invalid = TABLE_NOT_FOUND
                    .captures(&error_text)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str())
                    .unwrap_or("unknown");
                let table_only = invalid.rsplit('.').next().unwrap_or(invalid);
                let db = failed_action
                    .pointer("/arguments/database_name")
                    .and_then(Value::as_str)
                    .unwrap_or("the specified database");
                let prompt = format!(
                    "A tool call failed because table '{table_only}' does not exist in {db}.\n\
                     User question: {}\nFailed action: {failed_action}\n\n\
                     Either re-issue the call with a table that plausibly exists (respond with \
                     {{\"tool_name\": ..., \"arguments\": ...}}), delegate to a prompt \
                     ({{\"prompt_name\": ..., \"arguments\": ...}}), or — if the request cannot be \
                     satisfied — respond with FINAL_ANSWER: followed by an explanation.\n\n\
                     Available tools: {}",
                    self.user_query,
                    self.caps.tools.names().join(", ")
                );
                self.call_correction_llm(
                    &prompt,
                    &format!("Fact-based recovery for non-existent table '{table_only}'"),
                    failed_action,
                )
                .await
            }

            Strategy::ColumnNotFound => {
                let invalid = COLUMN_NOT_FOUND
                    .captures(&error_text)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str())
                    .unwrap_or("unknown");
                let prompt = format!(
                    "A tool call failed because column '{invalid}' does not exist.\n\
                     User question: {}\nFailed action: {failed_action}\n\n\
                     Either re-issue the call with a valid column (respond with \
                     {{\"tool_name\": ..., \"arguments\": ...}}), delegate to a prompt \
                     ({{\"prompt_name\": ..., \"arguments\": ...}}), or respond with \
                     FINAL_ANSWER: followed by an explanation.\n\n\
                     Available tools: {}",
                    self.user_query,
                    self.caps.tools.names().join(", ")
                );
                self.call_correction_llm(
                    &prompt,
                    &format!("Fact-based recovery for non-existent column '{invalid}'"),
                    failed_action,
                )
                .await
            }

            Strategy::Generic => self.generic(failed_action, error, &error_text).await,
        }
    }

    async fn generic(
        &self,
        failed_action: &Value,
        error: &ToolOutput,
        error_text: &str,
    ) -> Result<CorrectionOutcome> {
        let tool_name = failed_action
            .get("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default();

        // A report tool that failed on JSON parsing gets a deterministic
        // text-sanitisation sub-task built from the problematic raw text.
        let is_json_error =
            error_text.contains("JSON") || error_text.contains("Invalid control character");
        let is_report_tool =
            matches!(tool_name, names::FINAL_REPORT | names::COMPLEX_PROMPT_REPORT);
        if is_json_error && is_report_tool {
            if let Some(problematic) = error.data.as_ref().and_then(Value::as_str) {
                tracing::warn!(tool = %tool_name, "report JSON error, injecting sanitisation task");
                return Ok(CorrectionOutcome::Corrected(json!({
                    "tool_name": names::LLM_TASK,
                    "arguments": {
                        "task_description": (
                            "The previous attempt to generate a report failed because its output \
                             was not valid JSON. Clean the text below: remove invalid control \
                             characters, stray markdown, and conversational filler, preserving the \
                             content. Output the cleaned report only."
                        ),
                        "synthesized_answer": problematic,
                        "source_data": [],
                    }
                })));
            }
        }

        let tool_def = self
            .caps
            .tool(tool_name)
            .map(|t| serde_json::to_string(t).unwrap_or_default())
            .unwrap_or_else(|| format!("{{\"name\": \"{tool_name}\"}}"));
        let prompt = format!(
            "A tool call failed.\nTool definition: {tool_def}\nFailed action: {failed_action}\n\
             Error: {error_text}\nUser question: {}\n\n\
             Propose a fix: corrected arguments ({{\"arguments\": ...}}), a different tool \
             ({{\"tool_name\": ..., \"arguments\": ...}}), a prompt delegation \
             ({{\"prompt_name\": ..., \"arguments\": ...}}), or conclude with FINAL_ANSWER: \
             followed by a user-facing explanation.\n\nAvailable tools: {}",
            self.user_query,
            self.caps.tools.names().join(", ")
        );
        self.call_correction_llm(
            &prompt,
            &format!("Generic self-correction for failed tool call: {tool_name}"),
            failed_action,
        )
        .await
    }

    /// Shared LM call + response interpretation for all strategies.
    async fn call_correction_llm(
        &self,
        prompt: &str,
        reason: &str,
        failed_action: &Value,
    ) -> Result<CorrectionOutcome> {
        let response = self
            .runner
            .complete(
                PlanningPhase::Tactical,
                reason,
                "You are an expert troubleshooter. Follow the recovery directives precisely.",
                prompt,
                false,
            )
            .await?;

        if let Some(answer) = response.split_once("FINAL_ANSWER:").map(|(_, rest)| rest) {
            tracing::info!("self-correction concluded with a final answer");
            return Ok(CorrectionOutcome::FinalAnswer(answer.trim().to_string()));
        }

        let Some(corrected) = extract_json(&response) else {
            tracing::warn!("correction reply contained no JSON");
            return Ok(CorrectionOutcome::Unrecoverable);
        };

        let has_target = corrected.get("tool_name").is_some() || corrected.get("prompt_name").is_some();
        if has_target && corrected.get("arguments").is_some() {
            return Ok(CorrectionOutcome::Corrected(corrected));
        }

        // A bare arguments object patches the failed action.
        let new_args = corrected.get("arguments").unwrap_or(&corrected);
        if new_args.is_object() {
            let mut patched = failed_action.clone();
            patched["arguments"] = new_args.clone();
            return Ok(CorrectionOutcome::Corrected(patched));
        }

        Ok(CorrectionOutcome::Unrecoverable)
    }
}

/// Is this error recoverable at all? (Used to decide whether the
/// strategies should run; definitive errors terminate the phase.)
pub fn classify_error(error: &ToolOutput) -> Result<()> {
    let text = error.error_context();
    if let Some(friendly) = match_definitive(&text) {
        return Err(Error::DefinitiveTool {
            friendly: friendly.to_string(),
            raw: text,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{scripted_channels, temp_sessions, StaticToolHost};
    use crate::EventBus;
    use std::sync::Arc;
    use tess_domain::clock::FixedClock;
    use tess_domain::config::{KnowledgeConfig, LimitsConfig, ProfileConfig};
    use tess_domain::tool::{PromptCatalog, ToolCatalog};
    use tess_providers::registry::ProviderRegistry;
    use tess_providers::ScriptedLlm;

    fn fixture(replies: &[&str]) -> (LlmRunner, TurnCapabilities) {
        let llm = Arc::new(ScriptedLlm::new("s", "m"));
        for reply in replies {
            llm.push_text(*reply);
        }
        let (sessions, key) = temp_sessions();
        let runner = LlmRunner::new(
            Arc::new(EventBus::sink()),
            scripted_channels(llm),
            Arc::new(ProviderRegistry::empty()),
            sessions,
            key,
        );
        let caps = TurnCapabilities::assemble(
            ProfileConfig::default(),
            &ToolCatalog::default(),
            &PromptCatalog::default(),
            Arc::new(StaticToolHost::new()),
            runner_channels(&runner),
            Arc::new(ProviderRegistry::empty()),
            Arc::new(FixedClock::epoch()),
            None,
            LimitsConfig::default(),
            KnowledgeConfig::default(),
        );
        (runner, caps)
    }

    fn runner_channels(runner: &LlmRunner) -> tess_providers::registry::LlmChannels {
        // The caps' channels are unused by correction tests; reuse the
        // runner's models for consistency.
        let llm = Arc::new(ScriptedLlm::new("unused", runner.models().0));
        scripted_channels(llm)
    }

    fn table_error() -> ToolOutput {
        let mut out = ToolOutput::error("base_columnStats", "execution failed");
        out.data = Some(json!("Object 'SALES.MISSING' does not exist"));
        out
    }

    #[test]
    fn definitive_errors_match_table() {
        assert!(match_definitive("Invalid query: bad syntax").is_some());
        assert!(match_definitive("error 3523 permission denied").is_some());
        assert!(match_definitive("Object 'X' does not exist").is_none());
    }

    #[test]
    fn classify_definitive_raises() {
        let mut out = ToolOutput::error("base_readQuery", "Invalid query near SELECT");
        out.data = None;
        assert!(matches!(
            classify_error(&out),
            Err(Error::DefinitiveTool { .. })
        ));
        assert!(classify_error(&table_error()).is_ok());
    }

    #[tokio::test]
    async fn table_strategy_proposes_corrected_action() {
        let (runner, caps) = fixture(&[
            r#"{"tool_name": "base_columnStats", "arguments": {"database_name": "SALES", "table_name": "CUSTOMERS"}}"#,
        ]);
        let handler = CorrectionHandler::new(&runner, &caps, "describe column X in table Y");
        let failed = json!({
            "tool_name": "base_columnStats",
            "arguments": { "database_name": "SALES", "table_name": "MISSING" }
        });
        let outcome = handler.attempt(&failed, &table_error()).await.unwrap();
        match outcome {
            CorrectionOutcome::Corrected(action) => {
                assert_eq!(action["arguments"]["table_name"], "CUSTOMERS");
            }
            other => panic!("expected corrected action, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn final_answer_short_circuits() {
        let (runner, caps) = fixture(&[
            "FINAL_ANSWER: The table you asked about does not exist in this database.",
        ]);
        let handler = CorrectionHandler::new(&runner, &caps, "q");
        let outcome = handler
            .attempt(&json!({"tool_name": "t", "arguments": {}}), &table_error())
            .await
            .unwrap();
        assert!(matches!(outcome, CorrectionOutcome::FinalAnswer(text)
            if text.starts_with("The table")));
    }

    #[tokio::test]
    async fn bare_arguments_patch_the_failed_action() {
        let (runner, caps) = fixture(&[r#"{"arguments": {"database_name": "SALES_PROD"}}"#]);
        let handler = CorrectionHandler::new(&runner, &caps, "q");
        let failed = json!({"tool_name": "base_tableList", "arguments": {"database_name": "SALES"}});
        let mut err = ToolOutput::error("base_tableList", "weird transient failure");
        err.data = Some(json!("weird transient failure"));
        let outcome = handler.attempt(&failed, &err).await.unwrap();
        match outcome {
            CorrectionOutcome::Corrected(action) => {
                assert_eq!(action["tool_name"], "base_tableList");
                assert_eq!(action["arguments"]["database_name"], "SALES_PROD");
            }
            other => panic!("expected corrected action, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn report_json_error_injects_sanitisation_task() {
        let (runner, caps) = fixture(&[]); // deterministic path, no LM call
        let handler = CorrectionHandler::new(&runner, &caps, "q");
        let failed = json!({"tool_name": "FinalReport", "arguments": {}});
        let mut err = ToolOutput::error("FinalReport", "JSON decode failed");
        err.data = Some(json!("{\"broken\u{0007}report\": tru"));
        let outcome = handler.attempt(&failed, &err).await.unwrap();
        match outcome {
            CorrectionOutcome::Corrected(action) => {
                assert_eq!(action["tool_name"], names::LLM_TASK);
                assert!(action["arguments"]["synthesized_answer"]
                    .as_str()
                    .unwrap()
                    .contains("broken"));
            }
            other => panic!("expected sanitisation action, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_reply_is_unrecoverable() {
        let (runner, caps) = fixture(&["I really cannot fix this one, sorry."]);
        let handler = CorrectionHandler::new(&runner, &caps, "q");
        let mut err = ToolOutput::error("t", "some failure");
        err.data = Some(json!("some failure"));
        let outcome = handler
            .attempt(&json!({"tool_name": "t", "arguments": {}}), &err)
            .await
            .unwrap();
        assert!(matches!(outcome, CorrectionOutcome::Unrecoverable));
    }
}
