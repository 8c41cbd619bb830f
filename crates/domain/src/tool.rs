use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool / prompt descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One declared parameter of a tool or prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArgSpec {
    pub name: String,
    #[serde(default = "default_arg_type")]
    pub arg_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

fn default_arg_type() -> String {
    "string".into()
}

/// Declared operating scope of a tool. Column-scoped tools that arrive
/// without a `column_name` argument are expanded by the column orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolScope {
    Database,
    Table,
    Column,
}

/// Typed tool descriptor, normalised once when the catalog is loaded.
///
/// This is the only tool shape the planner and executor ever see — raw
/// protocol schemas never cross the catalog boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ToolScope>,
}

impl ToolDescriptor {
    pub fn arg(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|a| a.name == name)
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.arg(name).is_some()
    }

    pub fn required_args(&self) -> impl Iterator<Item = &ArgSpec> {
        self.args.iter().filter(|a| a.required)
    }

    /// True when the descriptor declares both ends of a date range.
    pub fn supports_date_range(&self) -> bool {
        self.has_arg("start_date") && self.has_arg("end_date")
    }

    /// The first date-shaped parameter name, if any.
    pub fn date_param(&self) -> Option<&str> {
        self.args
            .iter()
            .find(|a| {
                let n = a.name.to_lowercase();
                n == "date" || n.ends_with("_date") || n.starts_with("date_")
            })
            .map(|a| a.name.as_str())
    }
}

/// Typed prompt descriptor (the prompt-library analogue of a tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalogs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The active tool set for one turn. Built from the protocol catalog,
/// optionally filtered by the profile, and passed by value — there is no
/// process-global catalog.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolCatalog {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Names in stable (sorted) order, for prompt assembly.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    /// Restrict to the given names (profile override filtering).
    pub fn filtered(&self, keep: &[String]) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|(name, _)| keep.iter().any(|k| k == *name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn scope_of(&self, name: &str) -> Option<ToolScope> {
        self.tools.get(name).and_then(|t| t.scope)
    }
}

/// The active prompt set for one turn.
#[derive(Debug, Clone, Default)]
pub struct PromptCatalog {
    prompts: HashMap<String, PromptDescriptor>,
}

impl PromptCatalog {
    pub fn new(prompts: Vec<PromptDescriptor>) -> Self {
        Self {
            prompts: prompts.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PromptDescriptor> {
        self.prompts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prompts.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.prompts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &PromptDescriptor> {
        self.prompts.values()
    }

    pub fn filtered(&self, keep: &[String]) -> Self {
        Self {
            prompts: self
                .prompts
                .iter()
                .filter(|(name, _)| keep.iter().any(|k| k == *name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Argument synonym groups
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Canonical argument name → accepted synonyms. Planners and protocol
/// servers disagree on these names constantly; validation and resolution
/// both go through this table.
pub const ARGUMENT_SYNONYMS: &[(&str, &[&str])] = &[
    ("object_name", &["object_name", "table_name", "obj_name"]),
    ("database_name", &["database_name", "db_name", "database"]),
    ("column_name", &["column_name", "col_name"]),
    ("sql_text", &["sql_text", "sql", "query"]),
];

/// The canonical name for a provided argument name (itself if unknown).
pub fn canonical_arg_name(name: &str) -> &str {
    for (canonical, synonyms) in ARGUMENT_SYNONYMS {
        if synonyms.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            return canonical;
        }
    }
    name
}

/// All accepted spellings of a canonical name (just the name itself when
/// it has no synonym group).
pub fn synonyms_of(canonical: &str) -> Vec<&str> {
    for (c, synonyms) in ARGUMENT_SYNONYMS {
        if *c == canonical {
            return synonyms.to_vec();
        }
    }
    vec![canonical]
}

/// Look up a value in a JSON object by canonical argument name, accepting
/// any synonym, case-insensitively.
pub fn get_by_canonical_name<'a>(args: &'a Map<String, Value>, canonical: &str) -> Option<&'a Value> {
    let accepted = synonyms_of(canonical);
    args.iter()
        .find(|(k, _)| accepted.iter().any(|s| s.eq_ignore_ascii_case(k)))
        .map(|(_, v)| v)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Well-known capability names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// System tool names with engine-visible semantics.
pub mod names {
    pub const CURRENT_DATE: &str = "CurrentDate";
    pub const DATE_RANGE: &str = "DateRange";
    pub const CHARTING: &str = "Charting";
    pub const FINAL_REPORT: &str = "FinalReport";
    pub const COMPLEX_PROMPT_REPORT: &str = "ComplexPromptReport";
    pub const CONTEXT_REPORT: &str = "ContextReport";
    pub const LLM_TASK: &str = "LlmTask";
    /// Synthetic entry used in action history for multi-tool and
    /// orchestrated phases that have no single underlying tool call.
    pub const SYSTEM_LOG: &str = "SystemLog";

    /// Tools whose job is answer synthesis rather than data gathering.
    pub fn is_reporting(name: &str) -> bool {
        matches!(name, FINAL_REPORT | COMPLEX_PROMPT_REPORT | CONTEXT_REPORT)
    }

    /// Tools excluded from the deterministic loop fast path — each needs
    /// per-item reasoning or bypass handling.
    pub fn is_synthesis(name: &str) -> bool {
        matches!(name, LLM_TASK | CHARTING | FINAL_REPORT | COMPLEX_PROMPT_REPORT)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Metadata carried on every tool output. Unknown keys from the protocol
/// server are preserved in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputMetadata {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The wire shape every tool invocation resolves to:
/// `{status, metadata, results, error_message?, data?}`.
///
/// `results` for data tools is a list of row objects; LM-synthesis tools
/// and the context-report bypass use `results: [{"response": text}]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub status: ToolStatus,
    #[serde(default)]
    pub metadata: OutputMetadata,
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolOutput {
    pub fn success(tool_name: impl Into<String>, results: Vec<Value>) -> Self {
        Self {
            status: ToolStatus::Success,
            metadata: OutputMetadata {
                tool_name: tool_name.into(),
                ..Default::default()
            },
            results,
            error_message: None,
            data: None,
        }
    }

    /// An LM-synthesis result: `results: [{"response": text}]`.
    pub fn response(tool_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::success(
            tool_name,
            vec![serde_json::json!({ "response": text.into() })],
        )
    }

    pub fn error(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            metadata: OutputMetadata {
                tool_name: tool_name.into(),
                ..Default::default()
            },
            results: Vec::new(),
            error_message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }

    /// Full error context used for strategy matching: the summary message
    /// plus the raw error data.
    pub fn error_context(&self) -> String {
        let summary = self.error_message.as_deref().unwrap_or("");
        let data = self
            .data
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        format!("{summary} {data}").trim().to_string()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
