//! Structured signal extraction from free-form agent output.
//!
//! Turns are asked to answer in a fixed markdown template:
//!
//! - `## Progress` - what was done this turn
//! - `## Learnings` - facts worth carrying into later turns
//! - `## Status` - completion markers
//! - `### Verdict` - reviewer approval or the reasons it was withheld
//!
//! Agents drift from the template, so parsing is lenient: missing headers
//! fall back to the whole output, and completion markers are also accepted
//! anywhere in the text.

mod parser;
mod types;

pub use parser::{
    DEVELOPER_DONE_MARKER, DONE_MARKER, LEARNINGS_HEADER, OutputParser, PROGRESS_HEADER,
    REVIEWER_APPROVED_MARKER, STATUS_HEADER, VERDICT_HEADER, contains_marker, extract_section,
    mask_fences, parse, parse_agent_output, strip_markers,
};
pub use types::{ParseResult, Role, Sections, Verdict};
