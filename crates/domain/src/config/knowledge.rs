use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Knowledge retrieval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
    /// Cap on documents passed to the planning prompt.
    #[serde(default = "d_max_docs")]
    pub max_documents: usize,
    /// Token budget for the formatted knowledge context.
    #[serde(default = "d_max_tokens")]
    pub max_context_tokens: usize,
    /// Rerank retrieved documents with a short LM call.
    #[serde(default = "d_true")]
    pub rerank: bool,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            max_documents: d_max_docs(),
            max_context_tokens: d_max_tokens(),
            rerank: d_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_docs() -> usize {
    8
}
fn d_max_tokens() -> usize {
    4000
}
fn d_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = KnowledgeConfig::default();
        assert_eq!(config.max_documents, 8);
        assert!(config.rerank);
    }
}
