//! Provider registry: builds clients from config and resolves the
//! strategic / tactical model split per profile.

use std::collections::HashMap;
use std::sync::Arc;

use tess_domain::config::{LlmConfig, ModelPricing, ProfileConfig};
use tess_domain::error::{Error, Result};

use crate::openai_compat::OpenAiCompatClient;
use crate::traits::LlmClient;

/// The two LM channels a turn uses. `tactical` falls back to the
/// strategic client when the profile declares no split.
#[derive(Clone)]
pub struct LlmChannels {
    pub strategic: Arc<dyn LlmClient>,
    pub strategic_model: String,
    pub tactical: Arc<dyn LlmClient>,
    pub tactical_model: String,
}

/// Registry of configured provider clients, keyed by provider id.
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn LlmClient>>,
    pricing: HashMap<String, ModelPricing>,
    default_strategic: Option<String>,
    default_tactical: Option<String>,
}

impl ProviderRegistry {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let mut clients: HashMap<String, Arc<dyn LlmClient>> = HashMap::new();
        for provider in &config.providers {
            match OpenAiCompatClient::from_config(provider, config.default_timeout_ms) {
                Ok(client) => {
                    clients.insert(provider.id.clone(), Arc::new(client));
                }
                Err(e) => {
                    tracing::warn!(provider = %provider.id, error = %e, "provider init failed, skipping");
                }
            }
        }
        Ok(Self {
            clients,
            pricing: config.pricing.clone(),
            default_strategic: config.default_strategic_model.clone(),
            default_tactical: config.default_tactical_model.clone(),
        })
    }

    /// An empty registry (tests wire their own clients).
    pub fn empty() -> Self {
        Self {
            clients: HashMap::new(),
            pricing: HashMap::new(),
            default_strategic: None,
            default_tactical: None,
        }
    }

    /// Register a pre-built client (used by tests and embedders).
    pub fn insert(&mut self, id: impl Into<String>, client: Arc<dyn LlmClient>) {
        self.clients.insert(id.into(), client);
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients.get(provider_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Cost estimate for a model, 0 when no pricing row exists.
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.pricing
            .get(model)
            .map(|p| p.estimate_cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }

    /// Resolve the strategic and tactical channels for a profile. Both
    /// clients are constructed at turn start; the LM-call helper selects
    /// by the call's declared planning phase.
    pub fn channels_for(&self, profile: &ProfileConfig) -> Result<LlmChannels> {
        // Single-provider deployments may leave `provider` unset.
        let client = if !profile.provider.is_empty() {
            self.clients.get(&profile.provider).cloned()
        } else if self.clients.len() == 1 {
            self.clients.values().next().cloned()
        } else {
            None
        };
        let client = client
            .ok_or_else(|| {
                Error::Config(format!(
                    "profile '{}' names unknown provider '{}'",
                    profile.tag, profile.provider
                ))
            })?;

        let strategic_model = if profile.strategic_model.is_empty() {
            self.default_strategic
                .clone()
                .unwrap_or_else(|| client.model().to_string())
        } else {
            profile.strategic_model.clone()
        };
        let tactical_model = profile
            .tactical_model
            .clone()
            .or_else(|| self.default_tactical.clone())
            .unwrap_or_else(|| strategic_model.clone());

        Ok(LlmChannels {
            strategic: client.clone(),
            strategic_model,
            tactical: client,
            tactical_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedLlm;

    fn profile(provider: &str, strategic: &str, tactical: Option<&str>) -> ProfileConfig {
        ProfileConfig {
            tag: "t".into(),
            provider: provider.into(),
            strategic_model: strategic.into(),
            tactical_model: tactical.map(str::to_owned),
            ..Default::default()
        }
    }

    #[test]
    fn channels_fall_back_to_strategic_model() {
        let mut registry = ProviderRegistry::empty();
        registry.insert("main", Arc::new(ScriptedLlm::new("main", "big-model")));
        let channels = registry
            .channels_for(&profile("main", "big-model", None))
            .unwrap();
        assert_eq!(channels.strategic_model, "big-model");
        assert_eq!(channels.tactical_model, "big-model");
    }

    #[test]
    fn dual_model_split_resolves_both() {
        let mut registry = ProviderRegistry::empty();
        registry.insert("main", Arc::new(ScriptedLlm::new("main", "big-model")));
        let channels = registry
            .channels_for(&profile("main", "big-model", Some("small-model")))
            .unwrap();
        assert_eq!(channels.tactical_model, "small-model");
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let registry = ProviderRegistry::empty();
        assert!(registry.channels_for(&profile("ghost", "m", None)).is_err());
    }

    #[test]
    fn single_provider_deployments_may_omit_provider_id() {
        let mut registry = ProviderRegistry::empty();
        registry.insert("only", Arc::new(ScriptedLlm::new("only", "m")));
        let channels = registry.channels_for(&profile("", "m", None)).unwrap();
        assert_eq!(channels.strategic.provider_id(), "only");
    }

    #[test]
    fn cost_estimate_uses_pricing_table() {
        let mut config = LlmConfig::default();
        config.pricing.insert(
            "m".into(),
            ModelPricing {
                input_per_1m: 1.0,
                output_per_1m: 2.0,
            },
        );
        let registry = ProviderRegistry::from_config(&config).unwrap();
        let cost = registry.estimate_cost("m", 1_000_000, 500_000);
        assert!((cost - 2.0).abs() < 1e-10);
        assert_eq!(registry.estimate_cost("unknown", 1_000_000, 0), 0.0);
    }
}
