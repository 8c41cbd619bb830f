//! Protocol-backed [`ToolHost`]: routes tool and prompt calls to the
//! MCP server that advertised them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use tess_domain::config::McpConfig;
use tess_domain::error::{Error, Result};
use tess_domain::tool::{PromptCatalog, ToolCatalog, ToolOutput};
use tess_engine::capabilities::ToolHost;
use tess_mcp_client::{catalogs_from_client, McpClient};

/// Connections to every configured MCP server, with name→server routing
/// tables built at discovery time.
pub struct McpHost {
    clients: Vec<Arc<McpClient>>,
    tool_routes: HashMap<String, usize>,
    prompt_routes: HashMap<String, usize>,
}

impl McpHost {
    /// Connect to all configured servers and build the merged catalogs.
    /// Servers that fail to connect are skipped with a warning.
    pub async fn connect(config: &McpConfig) -> (Self, ToolCatalog, PromptCatalog) {
        let mut clients = Vec::new();
        let mut tool_routes = HashMap::new();
        let mut prompt_routes = HashMap::new();
        let mut all_tools = Vec::new();
        let mut all_prompts = Vec::new();

        for server in &config.servers {
            let client = match McpClient::connect(server).await {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    tracing::warn!(server = %server.id, error = %e, "MCP server unavailable, skipping");
                    continue;
                }
            };
            match catalogs_from_client(&client, config).await {
                Ok((tools, prompts)) => {
                    let idx = clients.len();
                    for tool in tools.iter() {
                        tool_routes.insert(tool.name.clone(), idx);
                        all_tools.push(tool.clone());
                    }
                    for prompt in prompts.iter() {
                        prompt_routes.insert(prompt.name.clone(), idx);
                        all_prompts.push(prompt.clone());
                    }
                    clients.push(client);
                }
                Err(e) => {
                    tracing::warn!(server = %server.id, error = %e, "catalog discovery failed, skipping");
                }
            }
        }

        tracing::info!(
            servers = clients.len(),
            tools = all_tools.len(),
            prompts = all_prompts.len(),
            "MCP catalogs ready"
        );
        (
            Self {
                clients,
                tool_routes,
                prompt_routes,
            },
            ToolCatalog::new(all_tools),
            PromptCatalog::new(all_prompts),
        )
    }

    /// An empty host for deployments with no MCP servers configured.
    pub fn empty() -> Self {
        Self {
            clients: Vec::new(),
            tool_routes: HashMap::new(),
            prompt_routes: HashMap::new(),
        }
    }

    pub fn server_count(&self) -> usize {
        self.clients.len()
    }
}

#[async_trait::async_trait]
impl ToolHost for McpHost {
    async fn invoke_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let idx = self
            .tool_routes
            .get(name)
            .ok_or_else(|| Error::Protocol(format!("no MCP server advertises tool '{name}'")))?;
        self.clients[*idx].invoke_tool(name, arguments).await
    }

    async fn prompt_body(&self, name: &str, arguments: Value) -> Result<String> {
        let idx = self
            .prompt_routes
            .get(name)
            .ok_or_else(|| Error::Protocol(format!("no MCP server advertises prompt '{name}'")))?;
        self.clients[*idx].get_prompt(name, arguments).await
    }
}
