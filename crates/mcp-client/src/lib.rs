//! `tess-mcp-client` — model-context-protocol client for Tessera.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types for communicating with MCP servers.
//! - A stdio transport (spawned child process, newline-delimited JSON)
//!   and a streamable-HTTP transport.
//! - An [`McpClient`] that performs discovery (`tools/list`,
//!   `prompts/list`) and dispatch (`tools/call`, `prompts/get`).
//! - Catalog normalisation: raw JSON-Schema tool definitions become the
//!   typed descriptors the rest of the engine consumes.

pub mod catalog;
pub mod client;
pub mod protocol;
pub mod transport;

pub use catalog::{catalogs_from_client, normalize_tool};
pub use client::McpClient;
pub use protocol::McpToolDef;
pub use transport::{HttpTransport, McpTransport, StdioTransport, TransportError};
