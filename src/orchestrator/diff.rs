//! The diff window shown to the reviewer.

use crate::tracker::{Vcs, WORKING_COPY};

/// Prepended when the cumulative diff cannot be produced.
pub const BASE_UNAVAILABLE_CAVEAT: &str = "NOTE: The base revision for this plan is unavailable. \
The diff below shows only the current change, not everything changed since the plan started.";

/// Bytes kept free below the ceiling for the omission notice.
const NOTICE_RESERVE: usize = 128;

/// Smallest accepted diff ceiling.
pub const MIN_DIFF_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewDiff {
    pub text: String,
    /// Covers every change since the base revision.
    pub cumulative: bool,
    pub truncated: bool,
}

/// Build the reviewer's diff: cumulative from `base` to the working copy when
/// possible, otherwise the current change with a caveat.
pub fn review_diff(vcs: &dyn Vcs, base: Option<&str>, max_bytes: usize) -> ReviewDiff {
    if let Some(base) = base {
        match vcs.diff(base, WORKING_COPY) {
            Ok(text) => {
                let (text, truncated) = truncate_diff(&text, max_bytes);
                return ReviewDiff {
                    text,
                    cumulative: true,
                    truncated,
                };
            }
            Err(e) => {
                tracing::warn!(base, error = %e, "cumulative diff failed, using current change");
            }
        }
    }

    let current = vcs
        .diff_current()
        .or_else(|e| {
            tracing::debug!(error = %e, "diff of current change failed, trying show");
            vcs.show_current_change()
        })
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "could not read the current change");
            String::new()
        });
    let (text, truncated) = truncate_diff(
        &format!("{}\n\n{}", BASE_UNAVAILABLE_CAVEAT, current),
        max_bytes,
    );
    ReviewDiff {
        text,
        cumulative: false,
        truncated,
    }
}

/// Cap `diff` at `max_bytes`.
///
/// Longer input is cut at the last line break past the midpoint of the kept
/// region (or mid-line when there is none) and ends with an omission notice,
/// so the result is always strictly shorter than the input.
pub fn truncate_diff(diff: &str, max_bytes: usize) -> (String, bool) {
    if diff.len() <= max_bytes {
        return (diff.to_string(), false);
    }

    let mut budget = max_bytes.saturating_sub(NOTICE_RESERVE);
    while !diff.is_char_boundary(budget) {
        budget -= 1;
    }
    let cut = match diff[..budget].rfind('\n') {
        Some(pos) if pos >= budget / 2 => pos + 1,
        _ => budget,
    };

    let omitted = diff.len() - cut;
    let mut out = String::with_capacity(cut + 48);
    out.push_str(&diff[..cut]);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&format!("[... {} bytes omitted ...]\n", omitted));
    (out, true)
}
