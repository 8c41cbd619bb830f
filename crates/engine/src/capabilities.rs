//! The per-turn capability bundle.
//!
//! There is no process-global catalog: everything a turn may touch —
//! tool and prompt catalogs (already profile-filtered), the tool host,
//! the LM channels, the clock, the knowledge retriever — is assembled
//! once at turn start and passed by reference. Profile overrides are
//! plain construction, so nothing needs restoring on exit.

use std::sync::Arc;

use serde_json::Value;

use tess_domain::clock::Clock;
use tess_domain::config::{KnowledgeConfig, LimitsConfig, ProfileConfig};
use tess_domain::error::Result;
use tess_domain::tool::{PromptCatalog, ToolCatalog, ToolDescriptor, ToolOutput};
use tess_planner::KnowledgeRetriever;
use tess_providers::registry::{LlmChannels, ProviderRegistry};

use crate::systools;

/// Dispatch surface for protocol-backed capabilities.
#[async_trait::async_trait]
pub trait ToolHost: Send + Sync {
    /// Invoke a tool over the protocol.
    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput>;

    /// Load a prompt body, with arguments substituted.
    async fn prompt_body(&self, name: &str, arguments: Value) -> Result<String>;
}

/// Everything one turn is allowed to use.
pub struct TurnCapabilities {
    pub profile: ProfileConfig,
    pub tools: ToolCatalog,
    pub prompts: PromptCatalog,
    pub host: Arc<dyn ToolHost>,
    pub llm: LlmChannels,
    pub registry: Arc<ProviderRegistry>,
    pub clock: Arc<dyn Clock>,
    pub retriever: Option<Arc<dyn KnowledgeRetriever>>,
    pub limits: LimitsConfig,
    pub knowledge: KnowledgeConfig,
}

impl TurnCapabilities {
    /// Assemble the bundle for a profile: apply catalog filters and merge
    /// the engine's system tools (always available) into the tool set.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        profile: ProfileConfig,
        base_tools: &ToolCatalog,
        base_prompts: &PromptCatalog,
        host: Arc<dyn ToolHost>,
        llm: LlmChannels,
        registry: Arc<ProviderRegistry>,
        clock: Arc<dyn Clock>,
        retriever: Option<Arc<dyn KnowledgeRetriever>>,
        limits: LimitsConfig,
        knowledge: KnowledgeConfig,
    ) -> Self {
        let filtered_tools = match &profile.tool_filter {
            Some(keep) => base_tools.filtered(keep),
            None => base_tools.clone(),
        };
        let mut all_tools: Vec<ToolDescriptor> = filtered_tools.iter().cloned().collect();
        for descriptor in systools::descriptors() {
            if !filtered_tools.contains(&descriptor.name) {
                all_tools.push(descriptor);
            }
        }
        let tools = ToolCatalog::new(all_tools);

        let prompts = match &profile.prompt_filter {
            Some(keep) => base_prompts.filtered(keep),
            None => base_prompts.clone(),
        };

        Self {
            profile,
            tools,
            prompts,
            host,
            llm,
            registry,
            clock,
            retriever,
            limits,
            knowledge,
        }
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// The profile-resolved system prompt for a named role, with a
    /// built-in default.
    pub fn system_prompt(&self, role: &str, default: &'static str) -> String {
        self.profile
            .system_prompts
            .get(role)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticToolHost;
    use std::sync::Arc;
    use tess_domain::clock::FixedClock;
    use tess_domain::tool::ArgSpec;
    use tess_providers::ScriptedLlm;

    fn channels() -> LlmChannels {
        let client = Arc::new(ScriptedLlm::new("scripted", "m"));
        LlmChannels {
            strategic: client.clone(),
            strategic_model: "m".into(),
            tactical: client,
            tactical_model: "m".into(),
        }
    }

    #[test]
    fn assemble_merges_system_tools_and_applies_filter() {
        let base = ToolCatalog::new(vec![
            ToolDescriptor {
                name: "base_tableList".into(),
                description: String::new(),
                args: vec![ArgSpec {
                    name: "database_name".into(),
                    arg_type: "string".into(),
                    required: true,
                    description: String::new(),
                }],
                scope: None,
            },
            ToolDescriptor {
                name: "base_secret".into(),
                description: String::new(),
                args: vec![],
                scope: None,
            },
        ]);
        let profile = ProfileConfig {
            tag: "t".into(),
            tool_filter: Some(vec!["base_tableList".into()]),
            ..Default::default()
        };
        let caps = TurnCapabilities::assemble(
            profile,
            &base,
            &PromptCatalog::default(),
            Arc::new(StaticToolHost::new()),
            channels(),
            Arc::new(ProviderRegistry::empty()),
            Arc::new(FixedClock::epoch()),
            None,
            LimitsConfig::default(),
            KnowledgeConfig::default(),
        );

        assert!(caps.tools.contains("base_tableList"));
        assert!(!caps.tools.contains("base_secret"));
        // System tools are always present.
        assert!(caps.tools.contains("FinalReport"));
        assert!(caps.tools.contains("CurrentDate"));
    }

    #[test]
    fn system_prompt_falls_back_to_default() {
        let mut profile = ProfileConfig::default();
        profile
            .system_prompts
            .insert("planning".into(), "custom".into());
        let caps = TurnCapabilities::assemble(
            profile,
            &ToolCatalog::default(),
            &PromptCatalog::default(),
            Arc::new(StaticToolHost::new()),
            channels(),
            Arc::new(ProviderRegistry::empty()),
            Arc::new(FixedClock::epoch()),
            None,
            LimitsConfig::default(),
            KnowledgeConfig::default(),
        );
        assert_eq!(caps.system_prompt("planning", "default"), "custom");
        assert_eq!(caps.system_prompt("tactical", "default"), "default");
    }
}
