mod controller;
mod planner;
mod reflect;
mod repair;
mod schema;
mod termination;

pub use controller::{Agent, AutoConfirm, ConfirmPrompter};
pub use planner::{
    MalformedPlanError, fallback_plan, planning_prompt, step_numbering_warning, validate_plan,
};
pub use reflect::{parse_reflection, reflection_prompt, results_transcript};
pub use repair::{PlanRepairFailure, repair};
pub use schema::{PLAN_SCHEMA, schema_snippet};
pub use termination::{
    GoalSatisfiedCriterion, HumanCheckpointCriterion, IterationLimitCriterion,
    TerminationCriterion, TerminationEngine, TimeLimitCriterion,
};
