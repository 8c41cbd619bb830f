//! Knowledge retrieval capability.
//!
//! The embedding store itself is a collaborator; the planner only needs
//! a typed retrieval interface plus the deterministic shaping steps:
//! collection-diversity balancing, LM reranking, and token-budgeted
//! formatting.

use tess_domain::error::Result;

use crate::parse::extract_json;
use crate::planner::PlanLlm;

/// A retrieved knowledge chunk, fully typed — no reflective field
/// probing downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedDocument {
    pub collection_id: String,
    pub title: String,
    pub content: String,
    pub score: f64,
    pub chunk_count: usize,
}

/// Retrieval capability over the configured collections.
#[async_trait::async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        collections: &[String],
        max_documents: usize,
    ) -> Result<Vec<RetrievedDocument>>;
}

/// A retriever that never finds anything. Used when no collections are
/// configured.
pub struct NullRetriever;

#[async_trait::async_trait]
impl KnowledgeRetriever for NullRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        _collections: &[String],
        _max_documents: usize,
    ) -> Result<Vec<RetrievedDocument>> {
        Ok(Vec::new())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shaping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Balance documents across collections round-robin (by descending
/// score within each collection) so one chatty collection cannot crowd
/// out the rest, then cap at `max_docs`.
pub fn balance_collection_diversity(
    mut docs: Vec<RetrievedDocument>,
    max_docs: usize,
) -> Vec<RetrievedDocument> {
    if docs.len() <= max_docs {
        docs.sort_by(|a, b| b.score.total_cmp(&a.score));
        return docs;
    }

    docs.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut by_collection: Vec<(String, Vec<RetrievedDocument>)> = Vec::new();
    for doc in docs {
        match by_collection.iter_mut().find(|(id, _)| *id == doc.collection_id) {
            Some((_, bucket)) => bucket.push(doc),
            None => by_collection.push((doc.collection_id.clone(), vec![doc])),
        }
    }

    let mut balanced = Vec::with_capacity(max_docs);
    let mut round = 0usize;
    while balanced.len() < max_docs {
        let mut took_any = false;
        for (_, bucket) in by_collection.iter_mut() {
            if let Some(doc) = bucket.get(round).cloned() {
                balanced.push(doc);
                took_any = true;
                if balanced.len() == max_docs {
                    break;
                }
            }
        }
        if !took_any {
            break;
        }
        round += 1;
    }
    balanced
}

/// Format documents into the planning-prompt context under a token
/// budget (~4 chars per token). Documents that do not fit are dropped,
/// never truncated mid-sentence.
pub fn format_with_token_budget(docs: &[RetrievedDocument], max_tokens: usize) -> String {
    let budget_chars = max_tokens.saturating_mul(4);
    let mut used = 0usize;
    let mut sections = Vec::new();
    for doc in docs {
        let section = format!("## {} ({})\n{}", doc.title, doc.collection_id, doc.content);
        if used + section.len() > budget_chars {
            continue;
        }
        used += section.len();
        sections.push(section);
    }
    sections.join("\n\n")
}

/// Rerank retrieved documents with a short LM call. The LM returns the
/// indices of the most relevant documents in order; unparseable replies
/// fall back to the original (score) order.
pub async fn rerank_with_llm(
    llm: &dyn PlanLlm,
    query: &str,
    docs: Vec<RetrievedDocument>,
    max_docs: usize,
) -> Vec<RetrievedDocument> {
    if docs.len() <= 1 {
        return docs;
    }
    let listing: Vec<String> = docs
        .iter()
        .enumerate()
        .map(|(idx, d)| format!("[{idx}] {} — {}", d.title, snippet(&d.content, 200)))
        .collect();
    let prompt = format!(
        "Question: {query}\n\nDocuments:\n{}\n\nReturn a JSON array of the indices of the \
         most relevant documents, best first, at most {max_docs} entries.",
        listing.join("\n")
    );

    let response = match llm
        .complete(
            "Reranking retrieved knowledge",
            "strategic",
            "You rank documents by relevance. Respond with a JSON array of indices only.",
            &prompt,
        )
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "rerank call failed, keeping retrieval order");
            return docs.into_iter().take(max_docs).collect();
        }
    };

    let Some(indices) = extract_json(&response).and_then(|v| {
        v.as_array().map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_u64().map(|i| i as usize))
                .collect::<Vec<_>>()
        })
    }) else {
        return docs.into_iter().take(max_docs).collect();
    };

    let mut reranked = Vec::new();
    for idx in indices {
        if let Some(doc) = docs.get(idx) {
            if !reranked.contains(doc) {
                reranked.push(doc.clone());
            }
        }
        if reranked.len() == max_docs {
            break;
        }
    }
    if reranked.is_empty() {
        docs.into_iter().take(max_docs).collect()
    } else {
        reranked
    }
}

fn snippet(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::test_support::QueuedLlm;

    fn doc(collection: &str, title: &str, score: f64) -> RetrievedDocument {
        RetrievedDocument {
            collection_id: collection.into(),
            title: title.into(),
            content: format!("content of {title}"),
            score,
            chunk_count: 1,
        }
    }

    #[test]
    fn diversity_balancing_round_robins_collections() {
        let docs = vec![
            doc("a", "a1", 0.9),
            doc("a", "a2", 0.8),
            doc("a", "a3", 0.7),
            doc("b", "b1", 0.6),
        ];
        let balanced = balance_collection_diversity(docs, 3);
        let titles: Vec<&str> = balanced.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["a1", "b1", "a2"]);
    }

    #[test]
    fn balancing_under_cap_just_sorts() {
        let docs = vec![doc("a", "low", 0.1), doc("b", "high", 0.9)];
        let balanced = balance_collection_diversity(docs, 5);
        assert_eq!(balanced[0].title, "high");
    }

    #[test]
    fn token_budget_drops_whole_documents() {
        let docs = vec![
            doc("a", "fits", 0.9),
            RetrievedDocument {
                collection_id: "a".into(),
                title: "huge".into(),
                content: "x".repeat(10_000),
                score: 0.8,
                chunk_count: 1,
            },
            doc("a", "also-fits", 0.7),
        ];
        let formatted = format_with_token_budget(&docs, 50);
        assert!(formatted.contains("fits"));
        assert!(formatted.contains("also-fits"));
        assert!(!formatted.contains("xxxx"));
    }

    #[tokio::test]
    async fn rerank_follows_llm_order() {
        let llm = QueuedLlm::default();
        llm.queue("[2, 0]");
        let docs = vec![doc("a", "first", 0.9), doc("a", "second", 0.8), doc("a", "third", 0.7)];
        let reranked = rerank_with_llm(&llm, "q", docs, 2).await;
        let titles: Vec<&str> = reranked.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["third", "first"]);
    }

    #[tokio::test]
    async fn rerank_falls_back_on_garbage() {
        let llm = QueuedLlm::default();
        llm.queue("the best one is probably the second");
        let docs = vec![doc("a", "first", 0.9), doc("a", "second", 0.8)];
        let reranked = rerank_with_llm(&llm, "q", docs.clone(), 2).await;
        assert_eq!(reranked, docs);
    }

    #[tokio::test]
    async fn null_retriever_returns_empty() {
        let retriever = NullRetriever;
        let docs = retriever.retrieve("q", &[], 5).await.unwrap();
        assert!(docs.is_empty());
    }
}
