use std::sync::Arc;

use tess_domain::clock::SystemClock;
use tess_domain::config::{Config, ProfileConfig};
use tess_domain::tool::{PromptCatalog, ToolCatalog};
use tess_engine::{CancelMap, QuotaTracker, TurnCapabilities};
use tess_providers::registry::ProviderRegistry;
use tess_sessions::SessionStore;

use crate::host::McpHost;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ProviderRegistry>,
    pub sessions: Arc<SessionStore>,
    pub cancel_map: Arc<CancelMap>,
    pub quota: Arc<QuotaTracker>,
    pub host: Arc<McpHost>,
    /// The full protocol catalogs; per-turn bundles filter these.
    pub base_tools: ToolCatalog,
    pub base_prompts: PromptCatalog,
}

impl AppState {
    /// Resolve the profile for a request: an explicit tag, else the
    /// first configured profile, else the built-in default.
    pub fn resolve_profile(&self, tag: Option<&str>) -> ProfileConfig {
        match tag {
            Some(tag) => self
                .config
                .profile(tag)
                .cloned()
                .unwrap_or_else(|| ProfileConfig {
                    tag: tag.to_string(),
                    ..Default::default()
                }),
            None => self
                .config
                .profiles
                .first()
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Assemble the per-turn capability bundle for a profile.
    pub fn capabilities_for(&self, profile: ProfileConfig) -> anyhow::Result<Arc<TurnCapabilities>> {
        let channels = self.registry.channels_for(&profile)?;
        Ok(Arc::new(TurnCapabilities::assemble(
            profile,
            &self.base_tools,
            &self.base_prompts,
            self.host.clone(),
            channels,
            self.registry.clone(),
            Arc::new(SystemClock),
            None,
            self.config.limits.clone(),
            self.config.knowledge.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tess_engine::QuotaTracker;

    fn state() -> AppState {
        let dir = std::env::temp_dir().join(format!("tessera-gw-{}", uuid()));
        let mut config = Config::default();
        config.profiles = vec![
            ProfileConfig {
                tag: "analyst".into(),
                ..Default::default()
            },
            ProfileConfig {
                tag: "librarian".into(),
                ..Default::default()
            },
        ];
        AppState {
            config: Arc::new(config),
            registry: Arc::new(ProviderRegistry::empty()),
            sessions: Arc::new(SessionStore::new(&dir).unwrap()),
            cancel_map: Arc::new(CancelMap::new()),
            quota: Arc::new(QuotaTracker::new(Default::default())),
            host: Arc::new(McpHost::empty()),
            base_tools: ToolCatalog::default(),
            base_prompts: PromptCatalog::default(),
        }
    }

    fn uuid() -> u128 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    }

    #[test]
    fn explicit_profile_tag_wins() {
        let state = state();
        assert_eq!(state.resolve_profile(Some("librarian")).tag, "librarian");
    }

    #[test]
    fn missing_tag_falls_back_to_first_profile() {
        let state = state();
        assert_eq!(state.resolve_profile(None).tag, "analyst");
    }

    #[test]
    fn unknown_tag_builds_a_default_profile() {
        let state = state();
        let profile = state.resolve_profile(Some("ghost"));
        assert_eq!(profile.tag, "ghost");
    }
}
