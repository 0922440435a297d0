use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".ikoma")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::System,
            content: content.into(),
        }
    }
}

/// One entry of an LLM-produced plan. `args` is the raw JSON object handed
/// to the tool; its shape is validated against the tool's argument schema
/// before execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PlanStep {
    pub step: u32,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<u32>>,
}

/// Wire shape: `{"plan":[...],"reasoning":"..."}`, no extra keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub plan: Vec<PlanStep>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step: u32,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub description: String,
    pub status: StepStatus,
    pub result: String,
    pub started_at: String,
    pub finished_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NextAction {
    Continue,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub task_completed: bool,
    pub success_rate: String,
    pub summary: String,
    pub next_action: NextAction,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    GoalSatisfied,
    IterationLimit,
    TimeLimit,
    UserStopped,
    PlanRepairExhausted,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoalSatisfied => "goal satisfied",
            Self::IterationLimit => "iteration limit",
            Self::TimeLimit => "time limit",
            Self::UserStopped => "user stopped",
            Self::PlanRepairExhausted => "plan repair exhausted",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run configuration handed to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub run_id: String,
    pub user_id: String,
    pub max_iterations: u32,
    pub time_limit_secs: Option<u64>,
    /// `None` or `Some(0)` both disable the human checkpoint.
    pub checkpoint_every: Option<u32>,
    pub interactive: bool,
    pub max_plan_retries: u32,
}

impl RunConfig {
    pub fn for_goal(run_id: impl Into<String>, limits: &LimitsConfig) -> Self {
        Self {
            run_id: run_id.into(),
            user_id: "default".to_string(),
            max_iterations: limits.max_iterations,
            time_limit_secs: Some(limits.max_mins * 60),
            checkpoint_every: Some(limits.checkpoint_every),
            interactive: false,
            max_plan_retries: limits.max_plan_retries,
        }
    }
}

/// The full mutable state of one run. This is what gets checkpointed after
/// every reflect cycle, so everything in here must serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub user_id: String,
    pub goal: String,
    pub messages: Vec<Message>,
    pub memory_context: Option<String>,
    pub current_plan: Option<Plan>,
    pub execution_results: Vec<ExecutionResult>,
    pub reflection: Option<Reflection>,
    pub reflection_failures: Vec<String>,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub time_limit_secs: Option<u64>,
    pub checkpoint_every: Option<u32>,
    /// Serialized citation registry (`{"citations":[...],"counter":n}`).
    /// Kept opaque here so the registry survives restarts with the run.
    #[serde(default)]
    pub citations: serde_json::Value,
    pub stop_reason: Option<StopReason>,
}

impl RunState {
    pub fn new(goal: impl Into<String>, config: &RunConfig) -> Self {
        let goal = goal.into();
        Self {
            run_id: config.run_id.clone(),
            user_id: config.user_id.clone(),
            goal: goal.clone(),
            messages: vec![Message::user(goal)],
            memory_context: None,
            current_plan: None,
            execution_results: Vec::new(),
            reflection: None,
            reflection_failures: Vec::new(),
            current_iteration: 0,
            max_iterations: config.max_iterations,
            start_time: Some(Utc::now()),
            time_limit_secs: config.time_limit_secs,
            checkpoint_every: config.checkpoint_every,
            citations: serde_json::Value::Null,
            stop_reason: None,
        }
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.kind == MessageKind::User)
            .map(|m| m.content.as_str())
    }

    pub fn elapsed_secs(&self) -> Option<f64> {
        let start = self.start_time?;
        let elapsed = Utc::now().signed_duration_since(start);
        Some(elapsed.num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub limits: LimitsConfig,
    pub checkpointer: CheckpointerConfig,
    pub paths: PathsConfig,
}

impl AppConfig {
    /// Resolve configuration from environment variables, falling back to
    /// built-in defaults. Unset or unparsable values fall back silently;
    /// the one exception is the legacy checkpointer toggle which warns.
    pub fn from_env(workspace: &Path) -> Self {
        Self {
            llm: LlmConfig::from_env(),
            limits: LimitsConfig::from_env(),
            checkpointer: CheckpointerConfig::from_env(),
            paths: PathsConfig::from_env(workspace),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub embed_model: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434/v1".to_string(),
            model: "meta-llama-3-8b-instruct".to_string(),
            embed_model: "nomic-ai/nomic-embed-text-v1.5-GGUF".to_string(),
            temperature: 0.1,
            timeout_seconds: 60,
            max_retries: 2,
            retry_base_ms: 400,
        }
    }
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("LMSTUDIO_BASE_URL") {
            cfg.base_url = v;
        }
        if let Ok(v) = std::env::var("LMSTUDIO_MODEL") {
            cfg.model = v;
        }
        if let Ok(v) = std::env::var("LMSTUDIO_EMBED_MODEL") {
            cfg.embed_model = v;
        }
        cfg
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_iterations: u32,
    pub max_mins: u64,
    pub checkpoint_every: u32,
    pub max_plan_retries: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            max_mins: 10,
            checkpoint_every: 5,
            max_plan_retries: 2,
        }
    }
}

impl LimitsConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_iterations: env_parse("IKOMA_MAX_ITER", d.max_iterations),
            max_mins: env_parse("IKOMA_MAX_MINS", d.max_mins),
            checkpoint_every: env_parse("IKOMA_CHECKPOINT_EVERY", d.checkpoint_every),
            max_plan_retries: env_parse("IKOMA_MAX_PLAN_RETRIES", d.max_plan_retries),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointerConfig {
    pub enabled: bool,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl CheckpointerConfig {
    pub fn from_env() -> Self {
        // Legacy toggle, inverted sense. Still honored, with a warning.
        if let Ok(v) = std::env::var("IKOMA_DISABLE_CHECKPOINTER") {
            eprintln!(
                "warning: IKOMA_DISABLE_CHECKPOINTER is deprecated, use CHECKPOINTER_ENABLED"
            );
            return Self {
                enabled: !parse_bool(&v),
            };
        }
        let enabled = std::env::var("CHECKPOINTER_ENABLED")
            .map(|v| parse_bool(&v))
            .unwrap_or(true);
        Self { enabled }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub conversation_db: PathBuf,
    pub vector_store: PathBuf,
    pub sandbox: PathBuf,
    pub http_cache: PathBuf,
}

impl PathsConfig {
    pub fn from_env(workspace: &Path) -> Self {
        let runtime = runtime_dir(workspace);
        Self {
            conversation_db: std::env::var("CONVERSATION_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| runtime.join("conversations.sqlite")),
            vector_store: std::env::var("VECTOR_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| runtime.join("vector_store")),
            sandbox: std::env::var("SANDBOX_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace.join("sandbox")),
            http_cache: runtime.join("http_cache"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_wire_format_rejects_unknown_keys() {
        let raw = r#"{"plan":[{"step":1,"tool_name":"calculate","args":{"expression":"1+1"},"description":"add"}],"reasoning":"simple","extra":true}"#;
        assert!(serde_json::from_str::<Plan>(raw).is_err());

        let raw = r#"{"plan":[{"step":1,"tool_name":"calculate","args":{"expression":"1+1"},"description":"add"}],"reasoning":"simple"}"#;
        let plan: Plan = serde_json::from_str(raw).expect("valid plan");
        assert_eq!(plan.plan.len(), 1);
        assert_eq!(plan.plan[0].tool_name, "calculate");
    }

    #[test]
    fn reflection_next_action_is_lowercase_on_the_wire() {
        let raw = r#"{"task_completed":true,"success_rate":"100%","summary":"done","next_action":"end","reasoning":"all steps succeeded"}"#;
        let reflection: Reflection = serde_json::from_str(raw).expect("valid reflection");
        assert_eq!(reflection.next_action, NextAction::End);
        assert!(reflection.task_completed);
    }

    #[test]
    fn stop_reason_display_matches_user_facing_wording() {
        assert_eq!(StopReason::IterationLimit.to_string(), "iteration limit");
        assert_eq!(StopReason::GoalSatisfied.to_string(), "goal satisfied");
    }

    #[test]
    fn run_state_starts_with_the_goal_as_user_message() {
        let limits = LimitsConfig::default();
        let config = RunConfig::for_goal("run-1", &limits);
        let state = RunState::new("calculate something", &config);
        assert_eq!(state.current_iteration, 0);
        assert_eq!(state.last_user_message(), Some("calculate something"));
        assert_eq!(state.max_iterations, 25);
    }
}
