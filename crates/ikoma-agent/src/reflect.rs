use anyhow::{Result, anyhow};
use ikoma_core::{ExecutionResult, Reflection, StepStatus};
use ikoma_llm::extract_json_snippet;

/// Per-step transcript shown to the model and echoed into the final
/// assistant message.
pub fn results_transcript(results: &[ExecutionResult]) -> String {
    results
        .iter()
        .map(|result| {
            let mark = match result.status {
                StepStatus::Success => "✓",
                StepStatus::Error => "✗",
            };
            format!(
                "{mark} Step {}: {} -> {}",
                result.step, result.description, result.result
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn reflection_prompt(goal: &str, results: &[ExecutionResult]) -> String {
    format!(
        r#"Analyze the execution results and determine if the user's request has been satisfied.

Original request: {goal}

Execution results:
{}

Provide your analysis in JSON format:
```json
{{
  "task_completed": true/false,
  "success_rate": "percentage of successful steps",
  "summary": "Brief summary of what was accomplished",
  "next_action": "continue" or "end",
  "reasoning": "Why you chose this next action"
}}
```

Return only the JSON, no other text."#,
        results_transcript(results)
    )
}

/// Parse the model's reflection. Strict: `task_completed` must be a real
/// boolean and `next_action` one of the two allowed strings.
pub fn parse_reflection(text: &str) -> Result<Reflection> {
    let snippet =
        extract_json_snippet(text).ok_or_else(|| anyhow!("reflection contained no JSON object"))?;
    serde_json::from_str(snippet).map_err(|e| anyhow!("reflection did not match contract: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ikoma_core::NextAction;
    use serde_json::json;

    fn result(step: u32, status: StepStatus) -> ExecutionResult {
        ExecutionResult {
            step,
            tool_name: "calculate".to_string(),
            args: json!({"expression": "1+1"}),
            description: format!("step {step}"),
            status,
            result: "2".to_string(),
            started_at: Utc::now().to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn transcript_marks_successes_and_failures() {
        let transcript = results_transcript(&[
            result(1, StepStatus::Success),
            result(2, StepStatus::Error),
        ]);
        assert!(transcript.contains("✓ Step 1"));
        assert!(transcript.contains("✗ Step 2"));
    }

    #[test]
    fn parses_a_fenced_reflection() {
        let raw = "```json\n{\"task_completed\": true, \"success_rate\": \"100%\", \"summary\": \"did it\", \"next_action\": \"end\", \"reasoning\": \"done\"}\n```";
        let reflection = parse_reflection(raw).expect("parse");
        assert!(reflection.task_completed);
        assert_eq!(reflection.next_action, NextAction::End);
    }

    #[test]
    fn rejects_non_boolean_task_completed() {
        let raw = r#"{"task_completed": "yes", "success_rate": "100%", "summary": "s", "next_action": "end", "reasoning": "r"}"#;
        assert!(parse_reflection(raw).is_err());
    }

    #[test]
    fn rejects_unknown_next_action() {
        let raw = r#"{"task_completed": false, "success_rate": "0%", "summary": "s", "next_action": "maybe", "reasoning": "r"}"#;
        assert!(parse_reflection(raw).is_err());
    }
}
