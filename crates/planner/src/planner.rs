//! The Planner: prompt assembly, the strategic LM call, and the
//! normalise → rewrite pipeline.

use serde_json::{Map, Value};

use tess_domain::error::Result;
use tess_domain::event::{AgentEvent, PlanGenerated, PlanMetadata};
use tess_domain::plan::Phase;
use tess_domain::tool::{PromptCatalog, ToolCatalog};

use crate::normalize;
use crate::parse::{parse_planner_output, PlannerOutput};
use crate::rewrite::{rewrite_plan, PreviousTurnContext, RewriteContext};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LM capability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The LM handle the planning pipeline calls through. The engine's
/// accounting runner implements this; the implementation decides which
/// channel (strategic/tactical) serves each `planning_phase` and owns
/// token bookkeeping and event emission.
#[async_trait::async_trait]
pub trait PlanLlm: Send + Sync {
    async fn complete(
        &self,
        reason: &str,
        planning_phase: &str,
        system: &str,
        prompt: &str,
    ) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything plan generation consumes for one turn.
pub struct PlanRequest<'a> {
    pub user_query: &'a str,
    /// Active prompt-library flow: `(name, parameters, body)`.
    pub active_prompt: Option<(&'a str, &'a Map<String, Value>, &'a str)>,
    pub previous_turn_summary: Option<&'a str>,
    pub previous_turn: Option<&'a PreviousTurnContext>,
    pub knowledge_context: &'a str,
    /// Retrieved few-shot examples from past successful turns.
    pub few_shot_examples: &'a [String],
    pub tools: &'a ToolCatalog,
    pub prompts: &'a PromptCatalog,
    /// Profile-resolved planning system prompt.
    pub system_prompt: &'a str,
    pub sql_optimization: bool,
    pub is_sub_process: bool,
    pub execution_depth: u32,
    /// Extra context when this is a recovery replan.
    pub replan_context: Option<&'a str>,
}

/// The planner's output for one turn.
#[derive(Debug)]
pub struct PlanResult {
    pub output: PlannerOutput,
    /// The raw pre-rewrite LM plan, kept for the audit record.
    pub raw_plan: Value,
    /// Workflow-state seed values produced by the rewriters
    /// (previous-turn hydration).
    pub workflow_seed: Map<String, Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Planner;

impl Planner {
    /// Generate, normalise, and rewrite a meta-plan. Events (corrections
    /// and the final `plan_generated`) are pushed to `events`.
    pub async fn generate(
        req: &PlanRequest<'_>,
        llm: &dyn PlanLlm,
        events: &mut Vec<AgentEvent>,
    ) -> Result<PlanResult> {
        let prompt = build_planning_prompt(req);
        let response = llm
            .complete(
                if req.replan_context.is_some() {
                    "Recovery planning"
                } else {
                    "Strategic planning"
                },
                "strategic",
                req.system_prompt,
                &prompt,
            )
            .await?;

        let (output, raw_plan) = parse_planner_output(&response)?;

        let mut workflow_seed = Map::new();
        let output = match output {
            PlannerOutput::Conversational(text) => PlannerOutput::Conversational(text),
            PlannerOutput::Plan(mut phases) => {
                normalize::normalize_plan(&mut phases);
                let mut ctx = RewriteContext {
                    user_query: req.user_query,
                    tools: req.tools,
                    prompts: req.prompts,
                    knowledge_context: req.knowledge_context,
                    previous_turn: req.previous_turn,
                    sql_optimization: req.sql_optimization,
                    is_sub_process: req.is_sub_process,
                    active_prompt: req.active_prompt.map(|(name, _, _)| name),
                    llm,
                    workflow_seed: &mut workflow_seed,
                };
                let phases = rewrite_plan(phases, &mut ctx, events).await?;
                events.push(AgentEvent::PlanGenerated(PlanGenerated {
                    step: "Meta-plan generated".into(),
                    kind: "plan_generated".into(),
                    details: serde_json::to_value(&phases)?,
                    metadata: PlanMetadata {
                        execution_depth: req.execution_depth,
                    },
                }));
                PlannerOutput::Plan(phases)
            }
        };

        Ok(PlanResult {
            output,
            raw_plan,
            workflow_seed,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt assembly
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_planning_prompt(req: &PlanRequest<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();

    // Workflow goal: the active prompt body wins over the bare query.
    match req.active_prompt {
        Some((name, params, body)) => {
            sections.push(format!("# Workflow goal (from prompt '{name}')\n{body}"));
            if !params.is_empty() {
                sections.push(format!(
                    "# Prompt parameters\n{}",
                    serde_json::to_string_pretty(params).unwrap_or_default()
                ));
            }
        }
        None => sections.push(format!("# Workflow goal\n{}", req.user_query)),
    }

    if let Some(summary) = req.previous_turn_summary {
        sections.push(format!("# Previous turn\n{summary}"));
    }

    if !req.knowledge_context.is_empty() {
        sections.push(format!("# Retrieved knowledge\n{}", req.knowledge_context));
    }

    if !req.few_shot_examples.is_empty() {
        sections.push(format!(
            "# Examples from similar past requests — adapt the structure, do not copy values\n{}",
            req.few_shot_examples.join("\n---\n")
        ));
    }

    if let Some(replan) = req.replan_context {
        sections.push(format!("# Recovery context\n{replan}"));
    }

    sections.push(constraints_block(req.sql_optimization).to_string());
    sections.push(format!("# Available tools\n{}", catalog_listing(req.tools)));
    if !req.prompts.names().is_empty() {
        sections.push(format!(
            "# Available prompts\n{}",
            prompt_listing(req.prompts)
        ));
    }

    sections.join("\n\n")
}

fn constraints_block(sql_optimization: bool) -> &'static str {
    if sql_optimization {
        "# Constraints\n\
         Respond with a JSON array of phases. Each phase has: phase (number), goal, \
         exactly one of relevant_tools (list) or executable_prompt (string), and arguments. \
         Use {\"source\": \"result_of_phase_N\", \"key\": \"Field\"} to reference earlier results. \
         For purely conversational requests respond with \
         {\"plan_type\": \"conversational\", \"response\": \"...\"}.\n\
         Consecutive SQL queries against the same database should be expressed as a single \
         consolidated query where possible."
    } else {
        "# Constraints\n\
         Respond with a JSON array of phases. Each phase has: phase (number), goal, \
         exactly one of relevant_tools (list) or executable_prompt (string), and arguments. \
         Use {\"source\": \"result_of_phase_N\", \"key\": \"Field\"} to reference earlier results. \
         For purely conversational requests respond with \
         {\"plan_type\": \"conversational\", \"response\": \"...\"}."
    }
}

fn catalog_listing(tools: &ToolCatalog) -> String {
    let mut lines = Vec::new();
    for name in tools.names() {
        if let Some(tool) = tools.get(name) {
            let args: Vec<String> = tool
                .args
                .iter()
                .map(|a| {
                    if a.required {
                        format!("{}*", a.name)
                    } else {
                        a.name.clone()
                    }
                })
                .collect();
            lines.push(format!("- {} ({}): {}", name, args.join(", "), tool.description));
        }
    }
    lines.join("\n")
}

fn prompt_listing(prompts: &PromptCatalog) -> String {
    let mut lines = Vec::new();
    for name in prompts.names() {
        if let Some(prompt) = prompts.get(name) {
            lines.push(format!("- {}: {}", name, prompt.description));
        }
    }
    lines.join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test support
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) mod test_support {
    use super::PlanLlm;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tess_domain::error::{Error, Result};

    /// Queue-driven [`PlanLlm`] for pipeline tests.
    #[derive(Default)]
    pub struct QueuedLlm {
        replies: Mutex<VecDeque<String>>,
        pub prompts_seen: Mutex<Vec<String>>,
    }

    impl QueuedLlm {
        pub fn queue(&self, reply: &str) {
            self.replies.lock().unwrap().push_back(reply.to_string());
        }
    }

    #[async_trait::async_trait]
    impl PlanLlm for QueuedLlm {
        async fn complete(
            &self,
            _reason: &str,
            _planning_phase: &str,
            _system: &str,
            prompt: &str,
        ) -> Result<String> {
            self.prompts_seen.lock().unwrap().push(prompt.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::Provider {
                    provider: "queued".into(),
                    message: "no scripted reply queued".into(),
                })
        }
    }
}
