use ikoma_core::{NextAction, RunState, StopReason};

const DEFAULT_TIME_LIMIT_SECS: u64 = 600;

/// A termination criterion is a pure predicate over the state snapshot.
/// Adding one must not require touching the others.
pub trait TerminationCriterion: Send + Sync {
    fn reason(&self) -> StopReason;
    fn should_stop(&self, state: &RunState) -> bool;
}

pub struct IterationLimitCriterion;

impl TerminationCriterion for IterationLimitCriterion {
    fn reason(&self) -> StopReason {
        StopReason::IterationLimit
    }

    fn should_stop(&self, state: &RunState) -> bool {
        state.current_iteration >= state.max_iterations
    }
}

pub struct TimeLimitCriterion;

impl TerminationCriterion for TimeLimitCriterion {
    fn reason(&self) -> StopReason {
        StopReason::TimeLimit
    }

    fn should_stop(&self, state: &RunState) -> bool {
        // No start time recorded means the clock never fires.
        let Some(elapsed) = state.elapsed_secs() else {
            return false;
        };
        let limit = state.time_limit_secs.unwrap_or(DEFAULT_TIME_LIMIT_SECS);
        elapsed >= limit as f64
    }
}

/// Stops when the reflection says the goal is done: `task_completed` is
/// strictly true, or `next_action` is "end".
pub struct GoalSatisfiedCriterion;

impl TerminationCriterion for GoalSatisfiedCriterion {
    fn reason(&self) -> StopReason {
        StopReason::GoalSatisfied
    }

    fn should_stop(&self, state: &RunState) -> bool {
        match &state.reflection {
            Some(reflection) => {
                reflection.task_completed || reflection.next_action == NextAction::End
            }
            None => false,
        }
    }
}

/// Never stops the run. Interactive mode consults `should_checkpoint` and
/// hands control to the confirmation prompter when it fires.
pub struct HumanCheckpointCriterion;

impl HumanCheckpointCriterion {
    pub fn should_checkpoint(&self, state: &RunState) -> bool {
        // None and 0 both mean the human checkpoint is disabled.
        let Some(every) = state.checkpoint_every else {
            return false;
        };
        if every == 0 || state.current_iteration == 0 {
            return false;
        }
        state.current_iteration % every == 0
    }
}

impl TerminationCriterion for HumanCheckpointCriterion {
    fn reason(&self) -> StopReason {
        StopReason::UserStopped
    }

    fn should_stop(&self, _state: &RunState) -> bool {
        false
    }
}

/// ORs its criteria in a fixed order (iteration, time, goal) so replayed
/// runs terminate identically.
pub struct TerminationEngine {
    criteria: Vec<Box<dyn TerminationCriterion>>,
}

impl TerminationEngine {
    pub fn standard() -> Self {
        Self {
            criteria: vec![
                Box::new(IterationLimitCriterion),
                Box::new(TimeLimitCriterion),
                Box::new(GoalSatisfiedCriterion),
            ],
        }
    }

    pub fn with_criteria(criteria: Vec<Box<dyn TerminationCriterion>>) -> Self {
        Self { criteria }
    }

    pub fn evaluate(&self, state: &RunState) -> Option<StopReason> {
        self.criteria
            .iter()
            .find(|c| c.should_stop(state))
            .map(|c| c.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use ikoma_core::{LimitsConfig, Reflection, RunConfig};

    fn state() -> RunState {
        let config = RunConfig::for_goal("run-t", &LimitsConfig::default());
        RunState::new("test goal", &config)
    }

    #[test]
    fn iteration_limit_fires_at_the_cap() {
        let mut state = state();
        state.max_iterations = 2;
        state.current_iteration = 1;
        assert!(!IterationLimitCriterion.should_stop(&state));
        state.current_iteration = 2;
        assert!(IterationLimitCriterion.should_stop(&state));
    }

    #[test]
    fn time_limit_respects_missing_start_time() {
        let mut state = state();
        state.start_time = None;
        assert!(!TimeLimitCriterion.should_stop(&state));

        state.start_time = Some(Utc::now() - Duration::seconds(700));
        state.time_limit_secs = Some(600);
        assert!(TimeLimitCriterion.should_stop(&state));

        state.time_limit_secs = Some(3600);
        assert!(!TimeLimitCriterion.should_stop(&state));
    }

    #[test]
    fn goal_satisfied_requires_a_reflection() {
        let mut state = state();
        assert!(!GoalSatisfiedCriterion.should_stop(&state));

        state.reflection = Some(Reflection {
            task_completed: false,
            success_rate: "50%".to_string(),
            summary: "partial".to_string(),
            next_action: NextAction::Continue,
            reasoning: "more to do".to_string(),
        });
        assert!(!GoalSatisfiedCriterion.should_stop(&state));

        state.reflection.as_mut().unwrap().task_completed = true;
        assert!(GoalSatisfiedCriterion.should_stop(&state));

        state.reflection.as_mut().unwrap().task_completed = false;
        state.reflection.as_mut().unwrap().next_action = NextAction::End;
        assert!(GoalSatisfiedCriterion.should_stop(&state));
    }

    #[test]
    fn human_checkpoint_never_stops_but_fires_on_schedule() {
        let mut state = state();
        state.checkpoint_every = Some(5);
        let criterion = HumanCheckpointCriterion;
        assert!(!criterion.should_stop(&state));

        state.current_iteration = 0;
        assert!(!criterion.should_checkpoint(&state));
        state.current_iteration = 5;
        assert!(criterion.should_checkpoint(&state));
        state.current_iteration = 7;
        assert!(!criterion.should_checkpoint(&state));

        // Disabled in both spellings.
        state.checkpoint_every = None;
        assert!(!criterion.should_checkpoint(&state));
        state.checkpoint_every = Some(0);
        assert!(!criterion.should_checkpoint(&state));
    }

    #[test]
    fn engine_evaluates_in_fixed_order() {
        let mut state = state();
        state.max_iterations = 1;
        state.current_iteration = 1;
        state.reflection = Some(Reflection {
            task_completed: true,
            success_rate: "100%".to_string(),
            summary: "done".to_string(),
            next_action: NextAction::End,
            reasoning: "finished".to_string(),
        });
        // Both iteration and goal criteria are true; iteration is checked
        // first and wins.
        assert_eq!(
            TerminationEngine::standard().evaluate(&state),
            Some(StopReason::IterationLimit)
        );
    }
}
