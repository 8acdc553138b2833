//! Version-control access used to build the reviewer's diff.

mod git;

use anyhow::Result;

pub use git::GitVcs;

/// Pseudo-revision naming the uncommitted working copy.
pub const WORKING_COPY: &str = "@";

/// The orchestrator treats every call as fallible and degrades to a caveat
/// or empty text instead of failing the run.
pub trait Vcs: Send + Sync {
    /// Identifier of the revision `rev` builds on. For [`WORKING_COPY`] this
    /// is the checked-out commit.
    fn parent_revision_of(&self, rev: &str) -> Result<String>;

    /// Unified diff between two revisions; either may be [`WORKING_COPY`].
    fn diff(&self, from: &str, to: &str) -> Result<String>;

    /// Diff of the current change alone.
    fn diff_current(&self) -> Result<String>;

    /// Description of the current change followed by its diff.
    fn show_current_change(&self) -> Result<String>;
}
