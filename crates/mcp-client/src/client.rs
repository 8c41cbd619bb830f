//! The MCP client: discovery and dispatch against one server.

use std::sync::Arc;

use serde_json::{json, Value};

use tess_domain::config::{McpServerConfig, McpTransportKind};
use tess_domain::error::{Error, Result};
use tess_domain::tool::ToolOutput;

use crate::protocol::{
    self, McpPromptDef, McpToolDef, PromptGetResult, PromptsListResult, ToolCallResult,
    ToolsListResult,
};
use crate::transport::{HttpTransport, McpTransport, StdioTransport, TransportError};

/// A connected MCP server.
pub struct McpClient {
    server_id: String,
    transport: Arc<dyn McpTransport>,
}

impl McpClient {
    /// Connect to a server: build the transport, run the `initialize`
    /// handshake, and send the `initialized` notification.
    pub async fn connect(config: &McpServerConfig) -> Result<Self> {
        let transport: Arc<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => Arc::new(
                StdioTransport::spawn(config).map_err(|e| Error::Protocol(e.to_string()))?,
            ),
            McpTransportKind::StreamableHttp => {
                Arc::new(HttpTransport::new(config).map_err(|e| Error::Protocol(e.to_string()))?)
            }
        };

        let client = Self {
            server_id: config.id.clone(),
            transport,
        };

        let params = serde_json::to_value(protocol::initialize_params())?;
        client.request("initialize", Some(params)).await?;
        client
            .transport
            .send_notification("notifications/initialized")
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;

        tracing::info!(server = %client.server_id, "MCP server initialized");
        Ok(client)
    }

    /// Wrap a pre-built transport (tests use an in-memory one).
    pub fn with_transport(server_id: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        Self {
            server_id: server_id.into(),
            transport,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let resp = self
            .transport
            .send_request(method, params)
            .await
            .map_err(|e| match e {
                TransportError::ProcessExited => {
                    Error::Protocol(format!("server '{}' exited", self.server_id))
                }
                other => Error::Protocol(other.to_string()),
            })?;
        resp.into_result()
            .map_err(|e| Error::Protocol(e.to_string()))
    }

    // ── Discovery ───────────────────────────────────────────────────

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        let result = self.request("tools/list", None).await?;
        let parsed: ToolsListResult = serde_json::from_value(result)?;
        Ok(parsed.tools)
    }

    pub async fn list_prompts(&self) -> Result<Vec<McpPromptDef>> {
        let result = self.request("prompts/list", None).await?;
        let parsed: PromptsListResult = serde_json::from_value(result)?;
        Ok(parsed.prompts)
    }

    /// Fetch a prompt body, with arguments substituted server-side.
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<String> {
        let result = self
            .request(
                "prompts/get",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        let parsed: PromptGetResult = serde_json::from_value(result)?;
        Ok(parsed.body())
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Invoke a tool and convert the protocol result into the engine's
    /// [`ToolOutput`] shape.
    ///
    /// Servers in this ecosystem return the output object as JSON text in
    /// the first content item; anything else is wrapped:
    /// plain text → `results: [{"response": text}]`, `isError` → an error
    /// output carrying the text as both message and data.
    pub async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let result = self
            .request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        let parsed: ToolCallResult = serde_json::from_value(result)?;
        Ok(convert_tool_result(name, parsed))
    }
}

/// Convert a raw `tools/call` result into a [`ToolOutput`].
pub fn convert_tool_result(tool_name: &str, result: ToolCallResult) -> ToolOutput {
    let text = result
        .content
        .iter()
        .filter(|c| c.content_type == "text")
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    if result.is_error {
        let mut output = ToolOutput::error(tool_name, text.clone());
        output.data = Some(Value::String(text));
        return output;
    }

    // Structured outputs arrive as JSON text.
    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        if value.get("status").is_some() {
            if let Ok(mut output) = serde_json::from_value::<ToolOutput>(value.clone()) {
                if output.metadata.tool_name.is_empty() {
                    output.metadata.tool_name = tool_name.to_string();
                }
                return output;
            }
        }
        // A bare array is a results list.
        if let Value::Array(rows) = value {
            return ToolOutput::success(tool_name, rows);
        }
    }

    ToolOutput::response(tool_name, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ContentItem;

    fn text_result(text: &str, is_error: bool) -> ToolCallResult {
        ToolCallResult {
            content: vec![ContentItem {
                content_type: "text".into(),
                text: text.into(),
            }],
            is_error,
        }
    }

    #[test]
    fn structured_output_passes_through() {
        let raw = r#"{
            "status": "success",
            "metadata": { "tool_name": "base_tableList" },
            "results": [{ "TableName": "CUSTOMERS" }]
        }"#;
        let output = convert_tool_result("base_tableList", text_result(raw, false));
        assert!(output.is_success());
        assert_eq!(output.results.len(), 1);
    }

    #[test]
    fn bare_array_becomes_results() {
        let output = convert_tool_result("t", text_result(r#"[{"a": 1}, {"a": 2}]"#, false));
        assert!(output.is_success());
        assert_eq!(output.results.len(), 2);
    }

    #[test]
    fn plain_text_becomes_response_row() {
        let output = convert_tool_result("t", text_result("2025-11-03", false));
        assert_eq!(
            output.results[0],
            serde_json::json!({ "response": "2025-11-03" })
        );
    }

    #[test]
    fn error_flag_maps_to_error_output() {
        let output = convert_tool_result(
            "base_readQuery",
            text_result("Object 'SALES.MISSING' does not exist", true),
        );
        assert!(!output.is_success());
        assert!(output.error_context().contains("does not exist"));
        assert!(output.data.is_some());
    }

    #[test]
    fn missing_tool_name_is_backfilled() {
        let raw = r#"{ "status": "success", "results": [] }"#;
        let output = convert_tool_result("filled_in", text_result(raw, false));
        assert_eq!(output.metadata.tool_name, "filled_in");
    }
}
