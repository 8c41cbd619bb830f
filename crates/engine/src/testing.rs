//! Test doubles shared by the engine's unit and integration tests:
//! a programmable tool host and pre-wired runner/session fixtures.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use tess_domain::error::{Error, Result};
use tess_domain::tool::ToolOutput;
use tess_providers::registry::{LlmChannels, ProviderRegistry};
use tess_providers::scripted::{ScriptedLlm, ScriptedReply};
use tess_providers::LlmClient;
use tess_sessions::{SessionKey, SessionStore};

use crate::capabilities::ToolHost;
use crate::events::EventBus;
use crate::llm::LlmRunner;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StaticToolHost
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A [`ToolHost`] with scripted outputs per tool, in FIFO order. The
/// last queued output for a tool is repeated once its queue drains, so
/// loop tests do not need to count iterations up front.
#[derive(Default)]
pub struct StaticToolHost {
    outputs: Mutex<HashMap<String, VecDeque<ToolOutput>>>,
    prompts: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl StaticToolHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an output for a tool.
    pub fn push(&self, tool: &str, output: ToolOutput) {
        self.outputs
            .lock()
            .entry(tool.to_string())
            .or_default()
            .push_back(output);
    }

    /// Register a prompt body.
    pub fn set_prompt(&self, name: &str, body: &str) {
        self.prompts.lock().insert(name.into(), body.into());
    }

    /// Every invocation seen, in order: `(tool_name, arguments)`.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, tool: &str) -> usize {
        self.calls.lock().iter().filter(|(name, _)| name == tool).count()
    }
}

#[async_trait::async_trait]
impl ToolHost for StaticToolHost {
    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        self.calls.lock().push((name.to_string(), arguments));
        let mut outputs = self.outputs.lock();
        match outputs.get_mut(name) {
            Some(queue) => {
                if queue.len() > 1 {
                    Ok(queue.pop_front().unwrap_or_else(|| {
                        ToolOutput::error(name, "scripted queue underflow")
                    }))
                } else {
                    // Repeat the final output for further calls.
                    queue
                        .front()
                        .cloned()
                        .ok_or_else(|| Error::Protocol(format!("no output scripted for '{name}'")))
                }
            }
            None => Ok(ToolOutput::error(
                name,
                format!("tool '{name}' is not scripted"),
            )),
        }
    }

    async fn prompt_body(&self, name: &str, _arguments: Value) -> Result<String> {
        self.prompts
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("prompt '{name}' is not scripted")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixtures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Channels where both roles share one scripted client.
pub fn scripted_channels(llm: Arc<ScriptedLlm>) -> LlmChannels {
    LlmChannels {
        strategic: llm.clone(),
        strategic_model: llm.model().to_string(),
        tactical: llm.clone(),
        tactical_model: llm.model().to_string(),
    }
}

/// A session store under a unique temp directory, with one session
/// pre-created.
pub fn temp_sessions() -> (Arc<SessionStore>, SessionKey) {
    let dir = std::env::temp_dir().join(format!("tessera-test-{}", uuid::Uuid::new_v4()));
    let store = Arc::new(SessionStore::new(&dir).expect("temp session store"));
    let key = SessionKey::new("tester", "session-1");
    store.resolve_or_create(&key);
    (store, key)
}

/// A runner over a sink bus with text-only scripted replies.
pub fn test_runner(replies: &[&str]) -> (LlmRunner, Arc<EventBus>) {
    let (runner, bus, _sessions, _key) = test_runner_with_sessions(
        replies.iter().map(|r| ScriptedReply::text(*r)).collect(),
    );
    (runner, bus)
}

/// A runner plus its session store, for accounting assertions.
pub fn test_runner_with_sessions(
    replies: Vec<ScriptedReply>,
) -> (LlmRunner, Arc<EventBus>, Arc<SessionStore>, SessionKey) {
    let llm = ScriptedLlm::new("scripted", "test-model");
    for reply in replies {
        llm.push(reply);
    }
    let llm = Arc::new(llm);
    let bus = Arc::new(EventBus::sink());
    let (sessions, key) = temp_sessions();
    let runner = LlmRunner::new(
        bus.clone(),
        scripted_channels(llm),
        Arc::new(ProviderRegistry::empty()),
        sessions.clone(),
        key.clone(),
    );
    (runner, bus, sessions, key)
}
