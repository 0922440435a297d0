use crate::schema::schema_snippet;
use ikoma_llm::{LlmClient, extract_json_snippet};

#[derive(thiserror::Error, Debug)]
#[error("Exceeded plan repair retries ({attempts} attempts)")]
pub struct PlanRepairFailure {
    pub attempts: u32,
}

/// Prompt the model to self-correct an invalid plan. Each attempt is
/// stripped of fences and must parse as JSON; the first response that
/// parses is returned for the caller to re-validate in full. Bounded so a
/// stuck model cannot burn unbounded tokens.
pub fn repair(
    llm: &dyn LlmClient,
    invalid_plan: &str,
    validation_error: &str,
    retries: u32,
) -> Result<String, PlanRepairFailure> {
    let prompt = reflection_prompt(invalid_plan, validation_error);
    for _attempt in 1..=retries.max(1) {
        let Ok(response) = llm.generate(&prompt, 0.1) else {
            continue;
        };
        let Some(candidate) = extract_json_snippet(&response) else {
            continue;
        };
        if !(candidate.starts_with('{') && candidate.ends_with('}')) {
            continue;
        }
        if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
            return Ok(candidate.to_string());
        }
    }
    Err(PlanRepairFailure {
        attempts: retries.max(1),
    })
}

fn reflection_prompt(invalid_plan: &str, validation_error: &str) -> String {
    format!(
        r#"You generated an invalid plan JSON that failed validation. Please correct it.

INVALID JSON:
{invalid_plan}

VALIDATION ERROR:
{validation_error}

SCHEMA REQUIREMENTS:
{}

Return ONLY the corrected JSON that conforms to the schema above. No explanations or prose - just valid JSON."#,
        schema_snippet()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikoma_testkit::MockLlm;

    #[test]
    fn first_parseable_response_wins() {
        let llm = MockLlm::scripted([r#"{"plan": [], "reasoning": "fixed"}"#]);
        let repaired = repair(&llm, "{broken", "invalid JSON", 2).expect("repaired");
        assert_eq!(repaired, r#"{"plan": [], "reasoning": "fixed"}"#);
        assert_eq!(llm.generate_calls(), 1);
    }

    #[test]
    fn fenced_responses_are_unwrapped() {
        let llm = MockLlm::scripted(["```json\n{\"plan\": []}\n```"]);
        let repaired = repair(&llm, "{broken", "invalid JSON", 1).expect("repaired");
        assert_eq!(repaired, r#"{"plan": []}"#);
    }

    #[test]
    fn exhausting_retries_is_a_typed_failure() {
        let llm = MockLlm::scripted(["still not json", "also { not json"]);
        let err = repair(&llm, "{broken", "invalid JSON", 2).expect_err("exhausted");
        assert_eq!(err.attempts, 2);
        assert_eq!(llm.generate_calls(), 2);
    }

    #[test]
    fn repair_prompt_carries_error_and_schema() {
        let prompt = reflection_prompt("{bad}", "missing field `reasoning`");
        assert!(prompt.contains("{bad}"));
        assert!(prompt.contains("missing field `reasoning`"));
        assert!(prompt.contains("SCHEMA REQUIREMENTS"));
        assert!(prompt.contains("PlanStep"));
    }
}
