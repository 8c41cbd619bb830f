mod knowledge;
mod limits;
mod llm;
mod mcp;
mod profile;
mod server;

pub use knowledge::*;
pub use limits::*;
pub use llm::*;
pub use mcp::*;
pub use profile::*;
pub use server::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Values only ever read from the environment (never from the file).
    #[serde(skip)]
    pub env: EnvConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for persisted state (sessions, turn records).
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
        }
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}

/// Environment-driven configuration. Everything else is file- or
/// store-persisted; these three are deployment facts.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub database_url: Option<String>,
    pub sql_echo: bool,
    pub production: bool,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("TESSERA_DATABASE_URL").ok(),
            sql_echo: std::env::var("TESSERA_SQL_ECHO")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            production: std::env::var("TESSERA_PRODUCTION")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

impl Config {
    /// Look up a profile by tag.
    pub fn profile(&self, tag: &str) -> Option<&ProfileConfig> {
        self.profiles.iter().find(|p| p.tag == tag)
    }

    /// Validate and return issues (the caller decides what is fatal).
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port must be non-zero"));
        }
        if self.llm.providers.is_empty() {
            issues.push(ConfigIssue::warning(
                "no LLM providers configured — planning calls will fail",
            ));
        }
        for profile in &self.profiles {
            if profile.tag.is_empty() {
                issues.push(ConfigIssue::error("profile with empty tag"));
            }
            if self.llm.pricing.get(&profile.strategic_model).is_none() {
                issues.push(ConfigIssue::warning(format!(
                    "no pricing entry for strategic model '{}' (profile '{}') — cost will read 0",
                    profile.strategic_model, profile.tag
                )));
            }
        }
        let mut tags: Vec<&str> = self.profiles.iter().map(|p| p.tag.as_str()).collect();
        tags.sort_unstable();
        tags.dedup();
        if tags.len() != self.profiles.len() {
            issues.push(ConfigIssue::error("duplicate profile tags"));
        }

        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_with_warning_only() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues
            .iter()
            .all(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn duplicate_profile_tags_are_an_error() {
        let mut config = Config::default();
        config.profiles = vec![
            ProfileConfig {
                tag: "sales".into(),
                ..Default::default()
            },
            ProfileConfig {
                tag: "sales".into(),
                ..Default::default()
            },
        ];
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("duplicate")));
    }

    #[test]
    fn profile_lookup() {
        let mut config = Config::default();
        config.profiles = vec![ProfileConfig {
            tag: "analyst".into(),
            ..Default::default()
        }];
        assert!(config.profile("analyst").is_some());
        assert!(config.profile("missing").is_none());
    }
}
