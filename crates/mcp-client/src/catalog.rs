//! Catalog normalisation: raw protocol schemas → typed descriptors.
//!
//! Runs once per connection. Downstream code (validator, resolver,
//! executor) never inspects JSON Schema — only [`ToolDescriptor`]s.

use std::collections::HashMap;

use serde_json::Value;

use tess_domain::config::McpConfig;
use tess_domain::error::Result;
use tess_domain::tool::{ArgSpec, PromptCatalog, PromptDescriptor, ToolCatalog, ToolDescriptor, ToolScope};

use crate::client::McpClient;
use crate::protocol::{McpPromptDef, McpToolDef};

/// Normalise one `tools/list` entry into a typed descriptor.
pub fn normalize_tool(def: &McpToolDef, scopes: &HashMap<String, ToolScope>) -> ToolDescriptor {
    let required: Vec<&str> = def
        .input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|reqs| reqs.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let args = def
        .input_schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .map(|(name, schema)| ArgSpec {
                    name: name.clone(),
                    arg_type: schema
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("string")
                        .to_string(),
                    required: required.contains(&name.as_str()),
                    description: schema
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    ToolDescriptor {
        name: def.name.clone(),
        description: def.description.clone(),
        args,
        scope: scopes.get(&def.name).copied(),
    }
}

fn normalize_prompt(def: &McpPromptDef) -> PromptDescriptor {
    PromptDescriptor {
        name: def.name.clone(),
        description: def.description.clone(),
        args: def
            .arguments
            .iter()
            .map(|a| ArgSpec {
                name: a.name.clone(),
                arg_type: "string".into(),
                required: a.required,
                description: a.description.clone(),
            })
            .collect(),
    }
}

/// Discover and normalise both catalogs from a connected client.
pub async fn catalogs_from_client(
    client: &McpClient,
    config: &McpConfig,
) -> Result<(ToolCatalog, PromptCatalog)> {
    let tool_defs = client.list_tools().await?;
    let tools = ToolCatalog::new(
        tool_defs
            .iter()
            .map(|d| normalize_tool(d, &config.tool_scopes))
            .collect(),
    );

    // Prompt discovery is optional — plain tool servers skip it.
    let prompts = match client.list_prompts().await {
        Ok(defs) => PromptCatalog::new(defs.iter().map(normalize_prompt).collect()),
        Err(e) => {
            tracing::debug!(server = client.server_id(), error = %e, "prompts/list unsupported");
            PromptCatalog::default()
        }
    };

    tracing::info!(
        server = client.server_id(),
        tools = tools.len(),
        "catalog normalised"
    );
    Ok((tools, prompts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_reads_required_and_types() {
        let def: McpToolDef = serde_json::from_value(json!({
            "name": "base_columnStats",
            "description": "Column statistics",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "database_name": { "type": "string", "description": "Database" },
                    "table_name": { "type": "string" },
                    "column_name": { "type": "string" }
                },
                "required": ["database_name", "table_name"]
            }
        }))
        .unwrap();

        let mut scopes = HashMap::new();
        scopes.insert("base_columnStats".to_string(), ToolScope::Column);

        let tool = normalize_tool(&def, &scopes);
        assert_eq!(tool.args.len(), 3);
        assert!(tool.arg("database_name").unwrap().required);
        assert!(!tool.arg("column_name").unwrap().required);
        assert_eq!(tool.scope, Some(ToolScope::Column));
    }

    #[test]
    fn normalize_handles_empty_schema() {
        let def: McpToolDef = serde_json::from_value(json!({ "name": "CurrentDate" })).unwrap();
        let tool = normalize_tool(&def, &HashMap::new());
        assert!(tool.args.is_empty());
        assert!(tool.scope.is_none());
    }
}
