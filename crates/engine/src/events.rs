//! The per-turn event bus.
//!
//! Components return results and emit events through this channel —
//! never both through a generator. Events stream to the caller (SSE) and
//! the audit-relevant ones are mirrored into the turn's audit trail so
//! the persisted record replays exactly what the UI saw, in order.

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use tess_domain::event::AgentEvent;

#[derive(Default)]
struct Audit {
    system_events: Vec<Value>,
    knowledge_events: Vec<Value>,
}

/// Turn-scoped event channel + audit log.
pub struct EventBus {
    tx: Option<mpsc::Sender<AgentEvent>>,
    audit: Mutex<Audit>,
}

impl EventBus {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            tx: Some(tx),
            audit: Mutex::new(Audit::default()),
        }
    }

    /// A bus with no subscriber — events are still audited. Used by
    /// tests and fire-and-forget turns.
    pub fn sink() -> Self {
        Self {
            tx: None,
            audit: Mutex::new(Audit::default()),
        }
    }

    /// Emit one event: audit it, then forward to the subscriber. A gone
    /// receiver does not fail the turn.
    pub async fn emit(&self, event: AgentEvent) {
        self.record(&event);
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    fn record(&self, event: &AgentEvent) {
        let name = event.name();
        let entry = json!({ "event": name, "data": event.payload() });
        let mut audit = self.audit.lock();
        match name {
            "knowledge_retrieval_start"
            | "knowledge_reranking_start"
            | "knowledge_reranking_complete"
            | "knowledge_retrieval_complete" => audit.knowledge_events.push(entry),
            "system_message" | "plan_generated" | "phase_start" | "phase_end" | "tool_intent"
            | "tool_result" | "tool_error" | "notification" => {
                audit.system_events.push(entry);
            }
            _ => {}
        }
    }

    /// Audit snapshot of system events, in emission order.
    pub fn system_events(&self) -> Vec<Value> {
        self.audit.lock().system_events.clone()
    }

    /// Audit snapshot of knowledge events, in emission order.
    pub fn knowledge_events(&self) -> Vec<Value> {
        self.audit.lock().knowledge_events.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_audited_by_category() {
        let bus = EventBus::sink();
        bus.emit(AgentEvent::llm_busy()).await; // not audited
        bus.emit(AgentEvent::tool_result("t", json!({}))).await;
        bus.emit(AgentEvent::KnowledgeRetrievalStart(Default::default()))
            .await;

        assert_eq!(bus.system_events().len(), 1);
        assert_eq!(bus.knowledge_events().len(), 1);
        assert_eq!(bus.system_events()[0]["event"], "tool_result");
    }

    #[tokio::test]
    async fn subscriber_receives_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let bus = EventBus::new(tx);
        bus.emit(AgentEvent::llm_busy()).await;
        bus.emit(AgentEvent::llm_idle()).await;
        drop(bus);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload()["state"], "busy");
        assert_eq!(second.payload()["state"], "idle");
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_fail_emission() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let bus = EventBus::new(tx);
        bus.emit(AgentEvent::llm_busy()).await; // should not panic
        assert!(bus.system_events().is_empty());
    }
}
