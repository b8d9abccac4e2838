//! Planning and applying.
//!
//! The planner compares the dependency graph against a state snapshot and
//! produces a [`Plan`]; the executor applies it with bounded parallelism,
//! retrying transient remote failures.

mod diff;
mod engine;
mod executor;
mod outcome;
mod plan;
mod retry;

pub use diff::{AttributeDiff, DiffEngine, PlannedAttributes, PlannedValue};
pub use engine::Planner;
pub use executor::{FailurePolicy, PlanExecutor, DEFAULT_PARALLELISM};
pub use outcome::{ApplyOutcome, ApplyReport, NodeOutcome};
pub use plan::{ChangeAction, DataReadings, Plan, PlanSummary, PlannedChange};
pub use retry::{RetryOutcome, RetryPolicy};
