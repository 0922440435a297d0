/// Canonical plan schema, committed alongside the typed model in
/// `ikoma-core`. The test below keeps the two in sync; change one and the
/// other must follow.
pub const PLAN_SCHEMA: &str = r##"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "$id": "https://ikoma.dev/plan.schema.json",
  "title": "Plan",
  "description": "Schema for validating LLM-generated execution plans",
  "type": "object",
  "properties": {
    "plan": {
      "type": "array",
      "minItems": 1,
      "items": {
        "$ref": "#/$defs/PlanStep"
      }
    },
    "reasoning": {
      "type": "string"
    }
  },
  "required": ["plan", "reasoning"],
  "additionalProperties": false,
  "$defs": {
    "PlanStep": {
      "type": "object",
      "properties": {
        "step": {
          "type": "integer",
          "minimum": 1
        },
        "tool_name": {
          "type": "string"
        },
        "args": {
          "type": "object"
        },
        "description": {
          "type": "string"
        },
        "citations": {
          "type": "array",
          "items": {
            "type": "integer",
            "minimum": 1
          }
        }
      },
      "required": ["step", "tool_name", "args", "description"],
      "additionalProperties": false
    }
  }
}"##;

/// First ~60 lines of the schema, used as reference text in repair prompts.
pub fn schema_snippet() -> String {
    PLAN_SCHEMA
        .lines()
        .take(60)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ikoma_core::{Plan, PlanStep};
    use serde_json::{Value, json};

    fn schema() -> Value {
        serde_json::from_str(PLAN_SCHEMA).expect("schema parses")
    }

    #[test]
    fn committed_schema_matches_the_typed_model() {
        let schema = schema();

        // Top level: exactly the model's two fields, both required, extras
        // forbidden, matching the serde deny_unknown_fields derive.
        let props = schema["properties"].as_object().expect("properties");
        assert_eq!(props.len(), 2);
        assert!(props.contains_key("plan"));
        assert!(props.contains_key("reasoning"));
        assert_eq!(schema["required"], json!(["plan", "reasoning"]));
        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(schema["properties"]["plan"]["minItems"], json!(1));

        // Per-step keys track the PlanStep struct.
        let step = &schema["$defs"]["PlanStep"];
        let step_props = step["properties"].as_object().expect("step properties");
        let mut keys: Vec<&str> = step_props.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["args", "citations", "description", "step", "tool_name"]);
        assert_eq!(
            step["required"],
            json!(["step", "tool_name", "args", "description"])
        );
        assert_eq!(step["additionalProperties"], json!(false));
    }

    #[test]
    fn a_model_produced_plan_satisfies_the_schema() {
        let plan = Plan {
            plan: vec![PlanStep {
                step: 1,
                tool_name: "calculate".to_string(),
                args: json!({"expression": "1+1"}),
                description: "add".to_string(),
                citations: Some(vec![1, 2]),
            }],
            reasoning: "round trip".to_string(),
        };
        let instance = serde_json::to_value(&plan).expect("serialize");
        let validator = jsonschema::validator_for(&schema()).expect("validator");
        let errors: Vec<String> = validator.iter_errors(&instance).map(|e| e.to_string()).collect();
        assert!(errors.is_empty(), "schema rejected model output: {errors:?}");
    }

    #[test]
    fn schema_snippet_is_bounded() {
        assert!(schema_snippet().lines().count() <= 60);
        assert!(schema_snippet().contains("PlanStep"));
    }
}
