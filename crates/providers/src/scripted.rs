//! A scripted LM client for tests and dry runs.
//!
//! Replies are queued ahead of time; every `chat` call pops the next
//! reply and records the request for later assertions. The engine's test
//! suites drive whole turns through this client.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use tess_domain::error::{Error, Result};

use crate::traits::{ChatRequest, ChatResponse, LlmClient, ToolCall, Usage};

/// One canned reply.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

impl ScriptedReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 20,
            },
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = Usage {
            input_tokens,
            output_tokens,
        };
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }
}

/// Queue-driven [`LlmClient`].
pub struct ScriptedLlm {
    provider_id: String,
    model: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(provider_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply. Returns `&self` style chaining via `Arc` is not
    /// needed — push before handing the client to the engine.
    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn push_text(&self, content: impl Into<String>) {
        self.push(ScriptedReply::text(content));
    }

    /// All requests seen so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    pub fn calls_made(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    /// Convenience: a shared handle with replies pre-queued.
    pub fn shared(model: &str, replies: Vec<ScriptedReply>) -> Arc<Self> {
        let llm = Self::new("scripted", model);
        for reply in replies {
            llm.push(reply);
        }
        Arc::new(llm)
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req);
        let reply = self.replies.lock().pop_front().ok_or_else(|| {
            Error::Provider {
                provider: self.provider_id.clone(),
                message: "scripted reply queue is empty".into(),
            }
        })?;
        Ok(ChatResponse {
            content: reply.content,
            tool_calls: reply.tool_calls,
            usage: reply.usage,
            model: self.model.clone(),
            finish_reason: Some("stop".into()),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_pop_in_order() {
        let llm = ScriptedLlm::new("scripted", "m");
        llm.push_text("first");
        llm.push_text("second");

        let a = llm.chat(ChatRequest::prompt("s", "u")).await.unwrap();
        let b = llm.chat(ChatRequest::prompt("s", "u")).await.unwrap();
        assert_eq!(a.content, "first");
        assert_eq!(b.content, "second");
        assert_eq!(llm.calls_made(), 2);
    }

    #[tokio::test]
    async fn empty_queue_is_a_provider_error() {
        let llm = ScriptedLlm::new("scripted", "m");
        let err = llm.chat(ChatRequest::default()).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[tokio::test]
    async fn usage_is_carried_through() {
        let llm = ScriptedLlm::new("scripted", "m");
        llm.push(ScriptedReply::text("x").with_usage(321, 45));
        let resp = llm.chat(ChatRequest::default()).await.unwrap();
        assert_eq!(resp.usage.input_tokens, 321);
        assert_eq!(resp.usage.output_tokens, 45);
    }
}
