//! The developer/reviewer iteration loop.
//!
//! Each iteration runs a developer turn, shows the reviewer a diff of
//! everything changed since the plan's base revision, and decides from both
//! outputs whether to complete, extend, or continue. Progress is reported as a
//! stream of [`LoopEvent`]s over a bounded queue that drops instead of
//! blocking.

mod diff;
mod engine;
mod events;
mod state;

pub use diff::{BASE_UNAVAILABLE_CAVEAT, MIN_DIFF_BYTES, ReviewDiff, review_diff, truncate_diff};
pub use engine::{Orchestrator, RunOutcome, RunSummary, TEAM_SESSION_ENV};
pub use events::{EventSink, LoopEvent};
pub use state::{Agreement, EXTENSION_ITERATIONS, LoopState};
