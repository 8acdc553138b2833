//! Result types for agent output parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which side of the loop produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Developer,
    Reviewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Developer => "developer",
            Self::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "developer" => Ok(Self::Developer),
            "reviewer" => Ok(Self::Reviewer),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// The role-agnostic content of a turn's output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sections {
    /// Body of `## Progress`, or the whole output when no header was found.
    pub progress: String,
    /// Body of `## Learnings`.
    pub learnings: String,
    /// Body of `## Status`, if the header was present.
    pub status: Option<String>,
    /// The role-agnostic done marker was found.
    pub complete: bool,
    /// Notes about how the output deviated from the requested template.
    pub diagnostics: Vec<String>,
}

/// Reviewer decision on the developer's turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    ChangesRequested { feedback: String },
    /// Empty output: neither approval nor feedback.
    Silent,
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    pub fn feedback(&self) -> Option<&str> {
        match self {
            Self::ChangesRequested { feedback } => Some(feedback),
            _ => None,
        }
    }
}

/// Parsed turn output, tagged by the role that was parsed for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    Generic(Sections),
    Developer { sections: Sections, done: bool },
    Reviewer { sections: Sections, verdict: Verdict },
}

impl ParseResult {
    pub fn sections(&self) -> &Sections {
        match self {
            Self::Generic(sections)
            | Self::Developer { sections, .. }
            | Self::Reviewer { sections, .. } => sections,
        }
    }

    pub fn progress(&self) -> &str {
        &self.sections().progress
    }

    pub fn learnings(&self) -> &str {
        &self.sections().learnings
    }

    /// Developer-done for developer results, approval for reviewer results,
    /// the role-agnostic marker otherwise.
    pub fn signals_done(&self) -> bool {
        match self {
            Self::Generic(sections) => sections.complete,
            Self::Developer { done, .. } => *done,
            Self::Reviewer { verdict, .. } => verdict.is_approved(),
        }
    }
}
