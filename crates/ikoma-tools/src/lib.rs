use ikoma_citations::CitationRegistry;
use ikoma_memory::VectorStore;
use ikoma_web::HttpFetcher;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod calc;
mod sandbox;
mod web_tools;

pub use calc::{evaluate, format_result};

#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("Tool '{0}' not found")]
    Unknown(String),
    #[error("invalid arguments for '{tool}': {message}")]
    InvalidArgs { tool: String, message: String },
    #[error("{0}")]
    Execution(String),
}

/// Declarative description of one tool: what the planner sees, plus the
/// JSON Schema its arguments must satisfy.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub category: &'static str,
}

/// The complete catalog, registered once at startup. Plan validation
/// resolves `tool_name` against these names, so an unknown tool is caught
/// before execution ever starts.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "calculate",
            description: "Evaluate an arithmetic expression (+, -, *, /, parentheses)",
            parameters: json!({
                "type": "object",
                "properties": {
                    "expression": {"type": "string", "description": "Expression to evaluate, e.g. '23*7+11'"}
                },
                "required": ["expression"],
                "additionalProperties": false
            }),
            category: "math",
        },
        ToolDefinition {
            name: "list_sandbox_files",
            description: "List all files in the sandbox directory. No input needed.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Unused, may be empty"}
                },
                "additionalProperties": false
            }),
            category: "file_system",
        },
        ToolDefinition {
            name: "create_text_file",
            description: "Create a NEW text file in the sandbox. Format: filename|||content",
            parameters: json!({
                "type": "object",
                "properties": {
                    "filename_and_content": {"type": "string", "description": "filename|||content"}
                },
                "required": ["filename_and_content"],
                "additionalProperties": false
            }),
            category: "file_system",
        },
        ToolDefinition {
            name: "update_text_file",
            description: "Update an existing text file in the sandbox. Format: filename|||new_content",
            parameters: json!({
                "type": "object",
                "properties": {
                    "filename_and_content": {"type": "string", "description": "filename|||new_content"}
                },
                "required": ["filename_and_content"],
                "additionalProperties": false
            }),
            category: "file_system",
        },
        ToolDefinition {
            name: "read_text_file",
            description: "Read a text file from the sandbox. Empty filename lists available files.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "filename": {"type": "string", "description": "File to read, may be empty"}
                },
                "required": ["filename"],
                "additionalProperties": false
            }),
            category: "file_system",
        },
        ToolDefinition {
            name: "scan_sandbox_files",
            description: "Scan sandbox files for a regex pattern (like TODO or FIXME comments)",
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regex pattern, default TODO|FIXME"},
                    "file_extension": {"type": "string", "description": "Comma-separated extensions, default .py,.md,.txt"}
                },
                "additionalProperties": false
            }),
            category: "file_system",
        },
        ToolDefinition {
            name: "extract_web_content",
            description: "Fetch a page and store high-quality content in memory. Format: url|||chunk_size|||store_in_memory|||min_quality",
            parameters: json!({
                "type": "object",
                "properties": {
                    "url_and_options": {"type": "string", "description": "url|||chunk_size|||store_in_memory|||min_quality"}
                },
                "required": ["url_and_options"],
                "additionalProperties": false
            }),
            category: "web",
        },
        ToolDefinition {
            name: "search_web_memories",
            description: "Search previously stored web content. Format: query|||min_quality|||domain_filter|||max_results",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query_and_filters": {"type": "string", "description": "query|||min_quality|||domain_filter|||max_results"}
                },
                "required": ["query_and_filters"],
                "additionalProperties": false
            }),
            category: "web",
        },
    ]
}

fn category_heading(category: &str) -> &'static str {
    match category {
        "math" => "MATH TOOLS",
        "file_system" => "FILE TOOLS",
        "web" => "WEB TOOLS",
        _ => "OTHER TOOLS",
    }
}

/// Resolves tool names to implementations and shared resources. Built once
/// at startup; invocation is synchronous.
pub struct ToolHost {
    sandbox: PathBuf,
    fetcher: Arc<HttpFetcher>,
    memory: Arc<VectorStore>,
    definitions: Vec<ToolDefinition>,
    validators: HashMap<&'static str, jsonschema::Validator>,
}

impl ToolHost {
    pub fn new(
        sandbox: &Path,
        fetcher: Arc<HttpFetcher>,
        memory: Arc<VectorStore>,
    ) -> anyhow::Result<Self> {
        let definitions = tool_definitions();
        let mut validators = HashMap::new();
        for def in &definitions {
            let validator = jsonschema::validator_for(&def.parameters)
                .map_err(|e| anyhow::anyhow!("schema for '{}' is invalid: {e}", def.name))?;
            validators.insert(def.name, validator);
        }
        Ok(Self {
            sandbox: sandbox.to_path_buf(),
            fetcher,
            memory,
            definitions,
            validators,
        })
    }

    pub fn sandbox(&self) -> &Path {
        &self.sandbox
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.definitions.iter().map(|d| d.name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.iter().any(|d| d.name == name)
    }

    /// Tool catalog formatted for the planning prompt, grouped by category.
    pub fn catalog_for_prompt(&self) -> String {
        let mut sections: Vec<(&str, Vec<String>)> = Vec::new();
        for def in &self.definitions {
            let heading = category_heading(def.category);
            let line = format!("  - {}: {}", def.name, def.description);
            match sections.iter_mut().find(|(h, _)| *h == heading) {
                Some((_, lines)) => lines.push(line),
                None => sections.push((heading, vec![line])),
            }
        }
        sections
            .into_iter()
            .map(|(heading, lines)| format!("{heading}:\n{}", lines.join("\n")))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Check `args` against the tool's argument schema.
    pub fn validate_args(&self, tool_name: &str, args: &Value) -> Result<(), ToolError> {
        let Some(validator) = self.validators.get(tool_name) else {
            return Err(ToolError::Unknown(tool_name.to_string()));
        };
        let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ToolError::InvalidArgs {
                tool: tool_name.to_string(),
                message: errors.join("; "),
            })
        }
    }

    /// Run one tool. The citation registry belongs to the calling run, so
    /// it is threaded through rather than shared process-wide.
    pub fn invoke(
        &self,
        tool_name: &str,
        args: &Value,
        citations: &mut CitationRegistry,
    ) -> Result<String, ToolError> {
        if !self.contains(tool_name) {
            return Err(ToolError::Unknown(tool_name.to_string()));
        }
        self.validate_args(tool_name, args)?;

        let result = match tool_name {
            "calculate" => {
                let expression = str_arg(args, "expression");
                calc::evaluate(expression).map(calc::format_result)
            }
            "list_sandbox_files" => sandbox::list_files(&self.sandbox),
            "create_text_file" => {
                sandbox::create_file(&self.sandbox, str_arg(args, "filename_and_content"))
            }
            "update_text_file" => {
                sandbox::update_file(&self.sandbox, str_arg(args, "filename_and_content"))
            }
            "read_text_file" => sandbox::read_file(&self.sandbox, str_arg(args, "filename")),
            "scan_sandbox_files" => {
                let pattern = args
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .unwrap_or("TODO|FIXME");
                let extensions = args
                    .get("file_extension")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".py,.md,.txt");
                sandbox::scan_files(&self.sandbox, pattern, extensions)
            }
            "extract_web_content" => web_tools::extract_web_content(
                &self.fetcher,
                &self.memory,
                citations,
                str_arg(args, "url_and_options"),
            ),
            "search_web_memories" => {
                web_tools::search_web_memories(&self.memory, str_arg(args, "query_and_filters"))
            }
            _ => Err(format!("Tool '{tool_name}' not implemented")),
        };

        result.map_err(ToolError::Execution)
    }
}

fn str_arg<'a>(args: &'a Value, field: &str) -> &'a str {
    args.get(field).and_then(|v| v.as_str()).unwrap_or("")
}
