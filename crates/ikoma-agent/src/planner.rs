use crate::schema::PLAN_SCHEMA;
use ikoma_core::Plan;
use ikoma_llm::extract_json_snippet;
use serde_json::json;
use std::sync::OnceLock;

fn schema_validator() -> &'static jsonschema::Validator {
    static VALIDATOR: OnceLock<jsonschema::Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        let schema = serde_json::from_str(PLAN_SCHEMA).expect("committed schema parses");
        jsonschema::validator_for(&schema).expect("committed schema compiles")
    })
}

#[derive(thiserror::Error, Debug)]
#[error("Plan validation failed: {message}")]
pub struct MalformedPlanError {
    pub message: String,
    pub diagnostics: Vec<String>,
}

impl MalformedPlanError {
    fn new(message: impl Into<String>, diagnostics: Vec<String>) -> Self {
        Self {
            message: message.into(),
            diagnostics,
        }
    }

    /// Message plus per-field diagnostics, for logs and repair prompts.
    pub fn detail(&self) -> String {
        if self.diagnostics.is_empty() {
            self.message.clone()
        } else {
            format!("{}: {}", self.message, self.diagnostics.join("; "))
        }
    }
}

/// Validate raw LLM output into a `Plan`. Markdown fences are tolerated.
/// Checks, in order: JSON well-formedness, schema shape, typed parse,
/// registered tool names, positive citation ids.
pub fn validate_plan(plan_text: &str, registered_tools: &[&str]) -> Result<Plan, MalformedPlanError> {
    let snippet = extract_json_snippet(plan_text)
        .ok_or_else(|| MalformedPlanError::new("response contained no JSON object", vec![]))?;

    let instance: serde_json::Value = serde_json::from_str(snippet)
        .map_err(|e| MalformedPlanError::new(format!("invalid JSON: {e}"), vec![]))?;

    let diagnostics: Vec<String> = schema_validator()
        .iter_errors(&instance)
        .map(|error| format!("{}: {error}", error.instance_path))
        .collect();
    if !diagnostics.is_empty() {
        return Err(MalformedPlanError::new(
            "plan does not match the schema",
            diagnostics,
        ));
    }

    let plan: Plan = serde_json::from_value(instance)
        .map_err(|e| MalformedPlanError::new(format!("plan shape mismatch: {e}"), vec![]))?;

    if plan.plan.is_empty() {
        return Err(MalformedPlanError::new("plan must contain at least one step", vec![]));
    }

    let mut diagnostics = Vec::new();
    for step in &plan.plan {
        if !registered_tools.contains(&step.tool_name.as_str()) {
            diagnostics.push(format!(
                "step {}: tool '{}' not found; available tools: {}",
                step.step,
                step.tool_name,
                registered_tools.join(", ")
            ));
        }
        if !step.args.is_object() {
            diagnostics.push(format!("step {}: args must be an object", step.step));
        }
        if let Some(citations) = &step.citations {
            for id in citations {
                if *id < 1 {
                    diagnostics.push(format!(
                        "step {}: citation id must be a positive integer, got {id}",
                        step.step
                    ));
                }
            }
        }
    }
    if !diagnostics.is_empty() {
        return Err(MalformedPlanError::new("plan references unusable tools", diagnostics));
    }

    Ok(plan)
}

/// Step numbers should run 1..N in order. Gaps and disorder are tolerated
/// but worth a warning in the run log.
pub fn step_numbering_warning(plan: &Plan) -> Option<String> {
    let numbers: Vec<u32> = plan.plan.iter().map(|s| s.step).collect();
    let expected: Vec<u32> = (1..=numbers.len() as u32).collect();
    if numbers == expected {
        None
    } else {
        Some(format!(
            "plan step numbers are not 1..{} in order: {numbers:?}",
            numbers.len()
        ))
    }
}

/// Degenerate single-step plan used when parsing and repair are both
/// exhausted. Keeps the loop alive with a harmless read-only step.
pub fn fallback_plan() -> Plan {
    serde_json::from_value(json!({
        "plan": [{
            "step": 1,
            "tool_name": "read_text_file",
            "args": {"filename": ""},
            "description": "List available files as a starting point"
        }],
        "reasoning": "Plan could not be parsed; falling back to exploring the sandbox"
    }))
    .expect("fallback plan is valid")
}

/// Prompt asking the model for a plan over the registered tool catalog.
pub fn planning_prompt(tool_catalog: &str, goal: &str, memory_context: Option<&str>) -> String {
    let mut prompt = format!(
        r#"You are a planning assistant. Based on the user's request, create a detailed plan of tool calls.

Available tools:
{tool_catalog}

Your task is to analyze the user's request and create a JSON plan with the following structure:
```json
{{
  "plan": [
    {{
      "step": 1,
      "tool_name": "tool_name",
      "args": {{"arg1": "value1", "arg2": "value2"}},
      "description": "What this step accomplishes"
    }}
  ],
  "reasoning": "Why this plan will achieve the user's goal"
}}
```

Important guidelines:
1. Break complex tasks into logical steps
2. Use exact tool names from the available tools
3. Provide proper arguments for each tool
4. Include clear descriptions for each step
5. Return only the JSON plan, no other text

User's request: {goal}"#
    );
    if let Some(context) = memory_context {
        prompt.push_str(&format!(
            "\n\nRelevant context from previous conversations:\n{context}"
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOLS: &[&str] = &["calculate", "read_text_file", "create_text_file"];

    fn valid_plan_text() -> String {
        r#"{"plan":[{"step":1,"tool_name":"calculate","args":{"expression":"23*7+11"},"description":"do the math"}],"reasoning":"one step suffices"}"#.to_string()
    }

    #[test]
    fn accepts_a_valid_plan_with_and_without_fences() {
        let plan = validate_plan(&valid_plan_text(), TOOLS).expect("bare");
        assert_eq!(plan.plan[0].tool_name, "calculate");

        let fenced = format!("```json\n{}\n```", valid_plan_text());
        validate_plan(&fenced, TOOLS).expect("fenced");
    }

    #[test]
    fn rejects_missing_step_fields() {
        let err = validate_plan(r#"{"plan":[{"step":1}],"reasoning":"r"}"#, TOOLS)
            .expect_err("incomplete step");
        assert!(!err.diagnostics.is_empty());
    }

    #[test]
    fn rejects_empty_plans_and_unknown_keys() {
        assert!(validate_plan(r#"{"plan":[],"reasoning":"r"}"#, TOOLS).is_err());
        let extra_key = r#"{"plan":[{"step":1,"tool_name":"calculate","args":{},"description":"d"}],"reasoning":"r","surprise":1}"#;
        assert!(validate_plan(extra_key, TOOLS).is_err());
        let extra_step_key = r#"{"plan":[{"step":1,"tool_name":"calculate","args":{},"description":"d","note":"x"}],"reasoning":"r"}"#;
        assert!(validate_plan(extra_step_key, TOOLS).is_err());
    }

    #[test]
    fn rejects_unregistered_tools_with_a_helpful_diagnostic() {
        let text = r#"{"plan":[{"step":1,"tool_name":"launch_rocket","args":{},"description":"d"}],"reasoning":"r"}"#;
        let err = validate_plan(text, TOOLS).expect_err("unknown tool");
        assert!(err.diagnostics[0].contains("launch_rocket"));
        assert!(err.diagnostics[0].contains("available tools"));
    }

    #[test]
    fn rejects_non_positive_citations() {
        let text = r#"{"plan":[{"step":1,"tool_name":"calculate","args":{},"description":"d","citations":[0]}],"reasoning":"r"}"#;
        assert!(validate_plan(text, TOOLS).is_err());
    }

    #[test]
    fn warns_on_step_number_gaps_but_not_on_clean_sequences() {
        let plan = validate_plan(&valid_plan_text(), TOOLS).expect("plan");
        assert!(step_numbering_warning(&plan).is_none());

        let gappy = r#"{"plan":[
            {"step":1,"tool_name":"calculate","args":{},"description":"a"},
            {"step":3,"tool_name":"calculate","args":{},"description":"b"}
        ],"reasoning":"r"}"#;
        let plan = validate_plan(gappy, TOOLS).expect("gaps tolerated");
        assert!(step_numbering_warning(&plan).is_some());
    }

    #[test]
    fn fallback_plan_uses_a_registered_tool() {
        let plan = fallback_plan();
        assert_eq!(plan.plan.len(), 1);
        assert!(TOOLS.contains(&plan.plan[0].tool_name.as_str()));
    }

    #[test]
    fn planning_prompt_includes_catalog_goal_and_context() {
        let prompt = planning_prompt("  - calculate: math", "Compute 2+2", Some("- likes math"));
        assert!(prompt.contains("- calculate: math"));
        assert!(prompt.contains("Compute 2+2"));
        assert!(prompt.contains("Relevant context from previous conversations"));
    }
}
