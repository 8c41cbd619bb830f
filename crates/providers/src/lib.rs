//! `tess-providers` — LM capability interface for Tessera.
//!
//! The engine never talks to a provider's wire format directly; it holds
//! `Arc<dyn LlmClient>` handles resolved per turn (one strategic, one
//! tactical — possibly the same client). This crate provides:
//! - the provider-agnostic request/response types and the `LlmClient` trait,
//! - an OpenAI-compatible HTTP adapter,
//! - a registry that builds clients from config and resolves profile roles,
//! - a scripted client used by the test suites to drive deterministic runs.

pub mod openai_compat;
pub mod registry;
pub mod scripted;
pub mod traits;

pub use registry::ProviderRegistry;
pub use scripted::ScriptedLlm;
pub use traits::{
    ChatRequest, ChatResponse, ContentPart, LlmClient, Message, MessageContent, Role, ToolCall,
    ToolSpec, Usage,
};
