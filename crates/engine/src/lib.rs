//! `tess-engine` — the execution core of Tessera.
//!
//! A turn flows through here: the [`executor::PlanExecutor`] picks an
//! execution mode from the profile, drives planning, executes each phase
//! (fast-path deterministic dispatch or tactical LM dispatch, with
//! orchestrator pre-flight expansion and self-correction on failure),
//! synthesises the final answer, and persists the turn record. Every LM
//! and tool call emits events on the turn's event bus.

pub mod attach;
pub mod cancel;
pub mod capabilities;
pub mod correction;
pub mod events;
pub mod executor;
pub mod llm;
pub mod orchestrate;
pub mod phase;
pub mod quota;
pub mod resolver;
pub mod systools;
pub mod testing;
pub mod workflow;

pub use cancel::{CancelMap, CancelToken};
pub use capabilities::{ToolHost, TurnCapabilities};
pub use events::EventBus;
pub use executor::{run_turn, ActivePrompt, PlanExecutor, TurnDeps, TurnInput};
pub use llm::{LlmRunner, PlanningPhase};
pub use quota::QuotaTracker;
pub use workflow::{ActionRecord, TurnState};
