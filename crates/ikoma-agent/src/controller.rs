use crate::planner::{self, MalformedPlanError};
use crate::reflect;
use crate::repair;
use crate::termination::{
    HumanCheckpointCriterion, TerminationCriterion, TerminationEngine, TimeLimitCriterion,
};
use anyhow::Result;
use chrono::Utc;
use ikoma_citations::CitationRegistry;
use ikoma_core::{
    ExecutionResult, Message, NextAction, Plan, Reflection, RunConfig, RunState, StepStatus,
    StopReason,
};
use ikoma_llm::LlmClient;
use ikoma_memory::{MemoryValue, VectorStore};
use ikoma_observe::Observer;
use ikoma_store::{Checkpointer, CheckpointRecord};
use ikoma_tools::ToolHost;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

const MEMORY_KEYWORDS: [&str; 7] = [
    "prefer", "like", "remember", "important", "project", "task", "learn",
];
const MEMORABLE_LENGTH: usize = 100;
const LLM_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Interactive confirmation seam. Non-interactive environments answer yes.
pub trait ConfirmPrompter: Send + Sync {
    fn confirm(&self, state: &RunState) -> bool;
}

pub struct AutoConfirm;

impl ConfirmPrompter for AutoConfirm {
    fn confirm(&self, _state: &RunState) -> bool {
        true
    }
}

/// The plan-execute-reflect controller. One instance can serve many runs;
/// each `run` call owns its state and citation registry, while the shared
/// resources (tools, memory, checkpointer) are thread-safe.
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolHost>,
    memory: Arc<VectorStore>,
    checkpointer: Option<Arc<Checkpointer>>,
    observer: Arc<Observer>,
    prompter: Arc<dyn ConfirmPrompter>,
    temperature: f32,
    cancel: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolHost>,
        memory: Arc<VectorStore>,
        checkpointer: Option<Arc<Checkpointer>>,
        observer: Arc<Observer>,
    ) -> Self {
        Self {
            llm,
            tools,
            memory,
            checkpointer,
            observer,
            prompter: Arc::new(AutoConfirm),
            temperature: 0.1,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn ConfirmPrompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// External cancellation: setting this flag stops the run after the
    /// current atomic operation completes.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Drive one goal to completion. Returns the final state including the
    /// full message history, citations, and termination reason.
    pub fn run(&self, goal: &str, config: &RunConfig) -> Result<RunState> {
        let mut state = RunState::new(goal, config);
        let mut citations = CitationRegistry::new();
        let engine = TerminationEngine::standard();
        let human = HumanCheckpointCriterion;
        self.observer
            .event(&state.run_id, &format!("run started, goal: {goal}"));

        loop {
            self.retrieve_phase(&mut state);

            let (plan, repair_exhausted) = self.plan_phase(&state, config);

            let timed_out = self.execute_phase(&mut state, plan, &mut citations);

            // A cancel or wall-clock stop mid-execute skips the reflection
            // call; the in-flight step already completed.
            let reflection_failed = if timed_out || state.stop_reason.is_some() {
                false
            } else {
                self.reflect_phase(&mut state)
            };
            state.current_iteration += 1;

            self.checkpoint_phase(&mut state, &citations);

            if config.interactive
                && human.should_checkpoint(&state)
                && !self.prompter.confirm(&state)
            {
                state.stop_reason = Some(StopReason::UserStopped);
            }
            if self.cancel.load(Ordering::SeqCst) && state.stop_reason.is_none() {
                state.stop_reason = Some(StopReason::UserStopped);
            }
            if state.stop_reason.is_none() {
                if timed_out {
                    state.stop_reason = Some(StopReason::TimeLimit);
                } else if let Some(reason) = engine.evaluate(&state) {
                    // When the model could not produce a plan at all and the
                    // reflection also failed, the turn was forced closed;
                    // report the real cause instead of "goal satisfied".
                    let reason = if reason == StopReason::GoalSatisfied
                        && reflection_failed
                        && repair_exhausted
                    {
                        StopReason::PlanRepairExhausted
                    } else {
                        reason
                    };
                    state.stop_reason = Some(reason);
                }
            }

            if let Some(reason) = state.stop_reason {
                let message = self.final_message(&state, reflection_failed, reason);
                self.check_citation_markers(&message, &citations, &state.run_id);
                state.messages.push(Message::assistant(message));
                state.citations =
                    serde_json::to_value(citations.to_state()).unwrap_or(serde_json::Value::Null);
                self.update_final_checkpoint(&state);
                self.store_memory_phase(&state);
                self.observer
                    .event(&state.run_id, &format!("run stopped: {reason}"));
                return Ok(state);
            }
        }
    }

    /// Pull up to three relevant memories for the goal. Failures degrade
    /// to an empty context, never to a halted run.
    fn retrieve_phase(&self, state: &mut RunState) {
        let Some(query) = state.last_user_message().map(str::to_string) else {
            return;
        };
        let namespace = vec!["memories".to_string(), state.user_id.clone()];
        match self.memory.search(&namespace, &query, 3) {
            Ok(hits) if !hits.is_empty() => {
                let mut context = String::from("Previous relevant context:\n");
                for hit in hits {
                    context.push_str(&format!("- {}\n", hit.entry.content));
                }
                state.memory_context = Some(context);
            }
            Ok(_) => {}
            Err(e) => {
                self.observer
                    .warn_log(&format!("could not retrieve memories: {e}"));
            }
        }
    }

    /// Ask for a plan, validate it, and route failures through the bounded
    /// repair loop. Returns the plan plus whether repair was exhausted and
    /// the fallback had to stand in.
    fn plan_phase(&self, state: &RunState, config: &RunConfig) -> (Plan, bool) {
        let prompt = planner::planning_prompt(
            &self.tools.catalog_for_prompt(),
            &state.goal,
            state.memory_context.as_deref(),
        );
        let tool_names = self.tools.tool_names();

        let response = match self.generate_with_retry(&prompt) {
            Ok(response) => response,
            Err(e) => {
                self.observer
                    .warn_log(&format!("plan generation failed: {e}; using fallback plan"));
                return (planner::fallback_plan(), false);
            }
        };

        match planner::validate_plan(&response, &tool_names) {
            Ok(plan) => (plan, false),
            Err(error) => {
                self.observer
                    .warn_log(&format!("plan rejected: {}", error.detail()));
                self.repair_or_fallback(&response, &error, &tool_names, config.max_plan_retries)
            }
        }
    }

    fn repair_or_fallback(
        &self,
        invalid_text: &str,
        error: &MalformedPlanError,
        tool_names: &[&str],
        retries: u32,
    ) -> (Plan, bool) {
        match repair::repair(self.llm.as_ref(), invalid_text, &error.detail(), retries) {
            Ok(repaired) => match planner::validate_plan(&repaired, tool_names) {
                Ok(plan) => (plan, false),
                Err(second_error) => {
                    self.observer.warn_log(&format!(
                        "repaired plan still invalid: {}; using fallback plan",
                        second_error.detail()
                    ));
                    (planner::fallback_plan(), true)
                }
            },
            Err(failure) => {
                self.observer
                    .warn_log(&format!("{failure}; using fallback plan"));
                (planner::fallback_plan(), true)
            }
        }
    }

    /// Run every step in plan order. Tool errors are captured and the
    /// remaining steps still run; only cancellation or the wall clock cut
    /// the plan short, and the in-flight step always completes first.
    /// Returns whether the time limit fired mid-plan.
    fn execute_phase(
        &self,
        state: &mut RunState,
        plan: Plan,
        citations: &mut CitationRegistry,
    ) -> bool {
        if let Some(warning) = planner::step_numbering_warning(&plan) {
            self.observer.warn_log(&warning);
        }
        state.execution_results.clear();
        let mut timed_out = false;

        for step in &plan.plan {
            if self.cancel.load(Ordering::SeqCst) {
                state.stop_reason = Some(StopReason::UserStopped);
                break;
            }
            if TimeLimitCriterion.should_stop(state) {
                timed_out = true;
                break;
            }
            let started_at = Utc::now().to_rfc3339();
            let outcome = self.tools.invoke(&step.tool_name, &step.args, citations);
            let finished_at = Utc::now().to_rfc3339();
            let (status, result) = match outcome {
                Ok(result) => (StepStatus::Success, result),
                Err(e) => (StepStatus::Error, e.to_string()),
            };
            state.execution_results.push(ExecutionResult {
                step: step.step,
                tool_name: step.tool_name.clone(),
                args: step.args.clone(),
                description: step.description.clone(),
                status,
                result,
                started_at,
                finished_at,
            });
        }

        state.current_plan = Some(plan);
        timed_out
    }

    /// Ask the model to judge the turn. A failed call or unparsable answer
    /// is recorded and forces `next_action = end`. Returns whether the
    /// reflection had to be synthesized.
    fn reflect_phase(&self, state: &mut RunState) -> bool {
        let prompt = reflect::reflection_prompt(&state.goal, &state.execution_results);
        match self.generate_with_retry(&prompt) {
            Ok(raw) => match reflect::parse_reflection(&raw) {
                Ok(reflection) => {
                    state.reflection = Some(reflection);
                    false
                }
                Err(e) => {
                    state
                        .reflection_failures
                        .push(format!("{e}; raw response: {raw}"));
                    state.reflection = Some(forced_end_reflection());
                    true
                }
            },
            Err(e) => {
                state.reflection_failures.push(format!("llm error: {e}"));
                state.reflection = Some(forced_end_reflection());
                true
            }
        }
    }

    /// Persist the turn as step `current_iteration`. Write errors are
    /// logged and swallowed: durability is best-effort, the loop continues.
    fn checkpoint_phase(&self, state: &mut RunState, citations: &CitationRegistry) {
        state.citations =
            serde_json::to_value(citations.to_state()).unwrap_or(serde_json::Value::Null);
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };
        let snapshot = match serde_json::to_value(&*state) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.observer
                    .warn_log(&format!("could not serialize run state: {e}"));
                return;
            }
        };
        let record = CheckpointRecord::new(&state.run_id, state.current_iteration, snapshot);
        if let Err(e) = checkpointer.save_step(&record) {
            self.observer
                .warn_log(&format!("checkpoint write failed: {e}"));
        }
    }

    /// Fold the final assistant message into the last checkpoint so a
    /// resumed run sees the complete transcript.
    fn update_final_checkpoint(&self, state: &RunState) {
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };
        if let Ok(snapshot) = serde_json::to_value(state)
            && let Err(e) =
                checkpointer.update_step(&state.run_id, state.current_iteration, &snapshot)
        {
            self.observer
                .warn_log(&format!("final checkpoint update failed: {e}"));
        }
    }

    fn final_message(
        &self,
        state: &RunState,
        reflection_failed: bool,
        reason: StopReason,
    ) -> String {
        let transcript = reflect::results_transcript(&state.execution_results);
        let mut message = match (&state.reflection, reflection_failed) {
            (Some(reflection), false) => {
                let summary = if reflection.summary.trim().is_empty() {
                    "Task execution completed."
                } else {
                    reflection.summary.as_str()
                };
                format!(
                    "Task completed! Here's what I accomplished:\n\n{summary}\n\n\
                     Execution Details:\n{transcript}\n\n\
                     Success Rate: {}",
                    reflection.success_rate
                )
            }
            _ => format!(
                "I've completed the requested tasks. Here are the results:\n\n{transcript}\n\n\
                 Let me know if you need anything else!"
            ),
        };
        if reason != StopReason::GoalSatisfied {
            message.push_str(&format!("\n\nStopped: {reason}"));
        }
        message
    }

    /// Every `[[n]]` marker in produced text must reference a citation of
    /// this run. A dangling marker is a bug worth surfacing loudly.
    fn check_citation_markers(&self, text: &str, citations: &CitationRegistry, run_id: &str) {
        for id in CitationRegistry::extract_ids(text) {
            if !citations.contains(id) {
                self.observer.warn_log(&format!(
                    "run {run_id}: message references unknown citation [[{id}]]"
                ));
            }
        }
    }

    /// Write the turn's memorable content back to long-term memory:
    /// keyword or length-selected message content plus every successful
    /// execution. Failures never halt the run.
    fn store_memory_phase(&self, state: &RunState) {
        let recent = state.messages.iter().rev().take(4).rev();
        let mut memorable: Vec<String> = Vec::new();
        for message in recent {
            let lower = message.content.to_lowercase();
            if MEMORY_KEYWORDS.iter().any(|k| lower.contains(k))
                || message.content.len() > MEMORABLE_LENGTH
            {
                memorable.push(message.content.clone());
            }
        }
        for result in &state.execution_results {
            if result.status == StepStatus::Success {
                memorable.push(format!(
                    "Successful execution: {} with {}",
                    result.tool_name, result.args
                ));
            }
        }
        if memorable.is_empty() {
            return;
        }

        let namespace = vec!["memories".to_string(), state.user_id.clone()];
        let value = MemoryValue {
            content: memorable.join(" "),
            context: "conversation".to_string(),
            plan_context: state
                .current_plan
                .as_ref()
                .and_then(|plan| serde_json::to_value(plan).ok()),
            reflection: state
                .reflection
                .as_ref()
                .map(|reflection| reflection.reasoning.clone()),
            metadata: serde_json::Value::Null,
        };
        if let Err(e) = self
            .memory
            .put(&namespace, &Uuid::now_v7().to_string(), &value)
        {
            self.observer
                .warn_log(&format!("could not store memory: {e}"));
        }
    }

    /// One retry with a short backoff; persistent failure surfaces to the
    /// phase that asked.
    fn generate_with_retry(&self, prompt: &str) -> Result<String> {
        match self.llm.generate(prompt, self.temperature) {
            Ok(response) => Ok(response),
            Err(first) => {
                self.observer
                    .warn_log(&format!("llm call failed, retrying once: {first}"));
                std::thread::sleep(LLM_RETRY_DELAY);
                self.llm.generate(prompt, self.temperature)
            }
        }
    }
}

fn forced_end_reflection() -> Reflection {
    Reflection {
        task_completed: false,
        success_rate: "N/A".to_string(),
        summary: String::new(),
        next_action: NextAction::End,
        reasoning: "reflection unavailable; closing the turn".to_string(),
    }
}
