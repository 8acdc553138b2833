//! Section and marker extraction from free-form agent output.
//!
//! Agents are asked to answer with `## Progress`, `## Learnings` and
//! `## Status` sections (plus `### Verdict` for reviewers) but do not reliably
//! do so. Header search runs over a masked copy of the text in which fenced
//! code blocks are blanked, so example markdown inside code never counts.
//! Offsets are shared between the masked and original text; extracted bodies
//! are always sliced from the original.

use std::sync::LazyLock;

use regex::Regex;

use super::types::{ParseResult, Role, Sections, Verdict};

/// Role-agnostic completion marker.
pub const DONE_MARKER: &str = "DONE DONE DONE!!!";
/// Emitted by the developer when it believes the plan is implemented.
pub const DEVELOPER_DONE_MARKER: &str = "DEV_DONE DEV_DONE DEV_DONE!!!";
/// Emitted by the reviewer when it accepts the developer's work.
pub const REVIEWER_APPROVED_MARKER: &str =
    "REVIEWER_APPROVED REVIEWER_APPROVED REVIEWER_APPROVED!!!";

const ALL_MARKERS: [&str; 3] = [DEVELOPER_DONE_MARKER, REVIEWER_APPROVED_MARKER, DONE_MARKER];

pub const PROGRESS_HEADER: &str = "## Progress";
pub const LEARNINGS_HEADER: &str = "## Learnings";
pub const STATUS_HEADER: &str = "## Status";
pub const VERDICT_HEADER: &str = "### Verdict";

const ISSUE_SECTIONS: [&str; 3] = ["Critical Issues", "Major Issues", "Minor Issues"];

// `Feedback:`, `**Feedback:**` or `**Feedback**:` at the start of a line.
static FEEDBACK_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:\*\*)?feedback(?:\*\*)?:(?:\*\*)?").unwrap());

/// Parser for agent turn output.
pub struct OutputParser {
    /// Whether to log parsing details (verbose mode)
    verbose: bool,
}

impl OutputParser {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Role-agnostic parse: sections plus the generic done marker.
    pub fn parse(&self, text: &str) -> ParseResult {
        let masked = mask_fences(text);
        ParseResult::Generic(self.sections(text, &masked))
    }

    /// Parse with the completion rules of `role`.
    pub fn parse_agent_output(&self, text: &str, role: Role) -> ParseResult {
        let masked = mask_fences(text);
        let sections = self.sections(text, &masked);
        let trimmed = text.trim();

        match role {
            Role::Developer => {
                let done = marker_in_status_or_text(
                    sections.status.as_deref(),
                    trimmed,
                    DEVELOPER_DONE_MARKER,
                );
                if self.verbose && done {
                    tracing::debug!("developer done marker found");
                }
                ParseResult::Developer { sections, done }
            }
            Role::Reviewer => {
                let (verdict_body, verdict_found) = extract_masked(text, &masked, VERDICT_HEADER);
                let approved = (verdict_found
                    && contains_marker(&verdict_body, REVIEWER_APPROVED_MARKER))
                    || marker_in_status_or_text(
                        sections.status.as_deref(),
                        trimmed,
                        REVIEWER_APPROVED_MARKER,
                    );

                let verdict = if approved {
                    Verdict::Approved
                } else {
                    let feedback = extract_feedback(text, &masked);
                    if feedback.is_empty() {
                        Verdict::Silent
                    } else {
                        Verdict::ChangesRequested { feedback }
                    }
                };
                if self.verbose {
                    tracing::debug!(approved, "reviewer verdict parsed");
                }
                ParseResult::Reviewer { sections, verdict }
            }
        }
    }

    fn sections(&self, text: &str, masked: &str) -> Sections {
        let trimmed = text.trim();
        let (mut progress, progress_found) = extract_masked(text, masked, PROGRESS_HEADER);
        let (learnings, learnings_found) = extract_masked(text, masked, LEARNINGS_HEADER);
        let (status, status_found) = extract_masked(text, masked, STATUS_HEADER);

        let mut diagnostics = Vec::new();
        if !progress_found && !learnings_found && !status_found && !trimmed.is_empty() {
            progress = trimmed.to_string();
            diagnostics.push(
                "no Progress/Learnings/Status header found; using the whole output as progress"
                    .to_string(),
            );
            if self.verbose {
                tracing::debug!(chars = trimmed.len(), "output did not follow the template");
            }
        }

        let status = status_found.then_some(status);
        let complete = marker_in_status_or_text(status.as_deref(), trimmed, DONE_MARKER);

        Sections {
            progress,
            learnings,
            status,
            complete,
            diagnostics,
        }
    }
}

/// Convenience wrapper for a non-verbose role-agnostic parse.
pub fn parse(text: &str) -> ParseResult {
    OutputParser::new(false).parse(text)
}

/// Convenience wrapper for a non-verbose role-specific parse.
pub fn parse_agent_output(text: &str, role: Role) -> ParseResult {
    OutputParser::new(false).parse_agent_output(text, role)
}

/// Extract the trimmed body under `header`. The flag reports whether the
/// header exists at all, even when its body is empty.
pub fn extract_section(text: &str, header: &str) -> (String, bool) {
    let masked = mask_fences(text);
    extract_masked(text, &masked, header)
}

/// Same-length copy of `text` with every fenced block blanked to spaces.
///
/// A fence only opens at column 0. Newlines are preserved so line offsets
/// stay aligned; an unterminated fence masks to end of text.
pub fn mask_fences(text: &str) -> String {
    let mut masked = String::with_capacity(text.len());
    let mut open_fence: Option<&str> = None;

    for line in text.split_inclusive('\n') {
        match open_fence {
            Some(fence) => {
                blank_into(&mut masked, line);
                if line.trim_start().starts_with(fence) {
                    open_fence = None;
                }
            }
            None => {
                if let Some(fence) = ["```", "~~~"].into_iter().find(|f| line.starts_with(f)) {
                    open_fence = Some(fence);
                    blank_into(&mut masked, line);
                } else {
                    masked.push_str(line);
                }
            }
        }
    }

    masked
}

fn blank_into(out: &mut String, line: &str) {
    out.extend(line.bytes().map(|b| if b == b'\n' { '\n' } else { ' ' }));
}

fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split_inclusive('\n').map(move |line| {
        let start = offset;
        offset += line.len();
        (start, line)
    })
}

fn starts_with_ignore_case(line: &str, prefix: &str) -> bool {
    line.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

/// Offset just past the header's line, if the header is present.
fn find_header(masked: &str, header: &str) -> Option<usize> {
    lines_with_offsets(masked)
        .find(|(_, line)| starts_with_ignore_case(line.trim_start(), header))
        .map(|(start, line)| start + line.len())
}

/// Start of the first line at or after `from` whose text begins with `prefix`.
fn next_line_starting_with(masked: &str, from: usize, prefix: &str) -> usize {
    lines_with_offsets(masked)
        .filter(|(start, _)| *start >= from)
        .find(|(_, line)| line.trim_start().starts_with(prefix))
        .map(|(start, _)| start)
        .unwrap_or(masked.len())
}

fn extract_masked(text: &str, masked: &str, header: &str) -> (String, bool) {
    match find_header(masked, header) {
        Some(start) => {
            let end = next_line_starting_with(masked, start, "##");
            (text[start..end].trim().to_string(), true)
        }
        None => (String::new(), false),
    }
}

/// Literal match that is not immediately followed by another `!`.
pub fn contains_marker(text: &str, marker: &str) -> bool {
    text.match_indices(marker)
        .any(|(i, _)| !text[i + marker.len()..].starts_with('!'))
}

fn marker_in_status_or_text(status: Option<&str>, trimmed: &str, marker: &str) -> bool {
    status.is_some_and(|s| contains_marker(s, marker)) || contains_marker(trimmed, marker)
}

fn extract_feedback(text: &str, masked: &str) -> String {
    for (start, line) in lines_with_offsets(masked) {
        let body = line.trim_start();
        let Some(prefix) = FEEDBACK_PREFIX.find(body) else {
            continue;
        };
        let content_start = start + (line.len() - body.len()) + prefix.end();
        let end = next_line_starting_with(masked, start + line.len(), "#");
        let feedback = text[content_start..end].trim();
        if !feedback.is_empty() {
            return feedback.to_string();
        }
    }

    let issues: Vec<String> = ISSUE_SECTIONS
        .iter()
        .filter_map(|title| {
            let (body, found) = extract_masked(text, masked, &format!("### {}", title));
            let (body, found) = if found {
                (body, found)
            } else {
                extract_masked(text, masked, &format!("## {}", title))
            };
            (found && !body.is_empty() && body != "None").then(|| format!("{}:\n{}", title, body))
        })
        .collect();
    if !issues.is_empty() {
        return issues.join("\n\n");
    }

    text.trim().to_string()
}

/// Remove every completion marker so it cannot leak into the next prompt.
/// Applying this twice yields the same result as applying it once.
pub fn strip_markers(text: &str) -> String {
    let mut out = text.to_string();
    loop {
        let before = out.len();
        for marker in ALL_MARKERS {
            out = out.replace(marker, "");
        }
        if out.len() == before {
            break;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sections_case_insensitive() {
        let text = "## PROGRESS\nAdded the parser.\n\n## learnings\nUse LazyLock.\n";
        assert_eq!(
            extract_section(text, PROGRESS_HEADER),
            ("Added the parser.".to_string(), true)
        );
        assert_eq!(
            extract_section(text, LEARNINGS_HEADER),
            ("Use LazyLock.".to_string(), true)
        );
        assert_eq!(extract_section(text, STATUS_HEADER), (String::new(), false));
    }

    #[test]
    fn test_header_found_with_empty_body() {
        let text = "## Progress\n## Learnings\nsomething";
        assert_eq!(extract_section(text, PROGRESS_HEADER), (String::new(), true));
    }

    #[test]
    fn test_header_inside_fence_is_ignored() {
        let text = "## Progress\nReal progress.\n```markdown\n## Learnings\nfake learnings\n```\nstill progress\n## Learnings\nreal learnings\n";
        let (progress, _) = extract_section(text, PROGRESS_HEADER);
        assert!(progress.starts_with("Real progress."));
        assert!(progress.contains("fake learnings"));
        assert!(progress.ends_with("still progress"));
        assert_eq!(
            extract_section(text, LEARNINGS_HEADER),
            ("real learnings".to_string(), true)
        );
    }

    #[test]
    fn test_indented_fence_does_not_open() {
        let text = "## Progress\n  ```\n## Status\nok\n";
        assert_eq!(extract_section(text, PROGRESS_HEADER).0, "```");
        assert_eq!(extract_section(text, STATUS_HEADER).0, "ok");
    }

    #[test]
    fn test_mask_preserves_length_and_newlines() {
        let text = "a\n```\nünïcode ## Progress\n```\nb";
        let masked = mask_fences(text);
        assert_eq!(masked.len(), text.len());
        assert_eq!(masked.matches('\n').count(), text.matches('\n').count());
        assert!(!masked.contains("Progress"));
        assert!(masked.starts_with("a\n"));
        assert!(masked.ends_with("\nb"));
    }

    #[test]
    fn test_unterminated_fence_masks_to_end() {
        let text = "## Progress\nstart\n```\n## Status\nDONE DONE DONE!!!";
        let masked = mask_fences(text);
        assert!(!masked.contains("Status"));
        let (progress, found) = extract_section(text, PROGRESS_HEADER);
        assert!(found);
        assert!(progress.contains("## Status"));
    }

    #[test]
    fn test_lenient_fallback_uses_whole_output() {
        let result = parse("  I fixed the bug and ran the tests.  \n");
        let sections = result.sections();
        assert_eq!(sections.progress, "I fixed the bug and ran the tests.");
        assert_eq!(sections.diagnostics.len(), 1);
        assert!(parse("   ").sections().diagnostics.is_empty());
    }

    #[test]
    fn test_marker_not_followed_by_extra_bang() {
        assert!(contains_marker("DONE DONE DONE!!!", DONE_MARKER));
        assert!(contains_marker("x DONE DONE DONE!!! y", DONE_MARKER));
        assert!(!contains_marker("DONE DONE DONE!!!!", DONE_MARKER));
        assert!(contains_marker(
            "DONE DONE DONE!!!! then DONE DONE DONE!!!",
            DONE_MARKER
        ));
        assert!(!contains_marker("DONE DONE DONE!!", DONE_MARKER));
    }

    #[test]
    fn test_role_agnostic_completion_status_then_text() {
        let in_status = parse("## Progress\nwork\n## Status\nDONE DONE DONE!!!\n");
        assert!(in_status.sections().complete);
        let anywhere = parse("## Progress\nwork finished DONE DONE DONE!!!\n");
        assert!(anywhere.sections().complete);
        assert!(!parse("## Progress\nnot yet\n").sections().complete);
    }

    #[test]
    fn test_developer_done_marker() {
        let text = format!("## Progress\nAll steps done.\n## Status\n{}\n", DEVELOPER_DONE_MARKER);
        let result = parse_agent_output(&text, Role::Developer);
        assert!(matches!(result, ParseResult::Developer { done: true, .. }));
        assert_eq!(result.progress(), "All steps done.");

        let result = parse_agent_output("## Progress\nstill going\n", Role::Developer);
        assert!(matches!(result, ParseResult::Developer { done: false, .. }));

        // The generic marker is not a developer-done signal.
        let result = parse_agent_output("## Status\nDONE DONE DONE!!!", Role::Developer);
        assert!(matches!(result, ParseResult::Developer { done: false, .. }));
        assert!(result.sections().complete);
    }

    #[test]
    fn test_reviewer_approval_in_verdict() {
        let text = format!(
            "## Progress\nReviewed.\n### Verdict\n{}\n",
            REVIEWER_APPROVED_MARKER
        );
        let result = parse_agent_output(&text, Role::Reviewer);
        match result {
            ParseResult::Reviewer { verdict, .. } => assert_eq!(verdict, Verdict::Approved),
            other => panic!("Expected Reviewer, got {:?}", other),
        }
    }

    #[test]
    fn test_reviewer_feedback_prefix_line() {
        let text = "## Progress\nReviewed.\n### Verdict\nChanges needed.\n**Feedback:** Missing error handling in parser.\nAlso add tests.\n## Learnings\nnone\n";
        match parse_agent_output(text, Role::Reviewer) {
            ParseResult::Reviewer { verdict, .. } => assert_eq!(
                verdict.feedback(),
                Some("Missing error handling in parser.\nAlso add tests.")
            ),
            other => panic!("Expected Reviewer, got {:?}", other),
        }
    }

    #[test]
    fn test_reviewer_feedback_from_issue_sections() {
        let text = "## Review\n### Critical Issues\nPanics on empty input.\n### Major Issues\nNone\n### Minor Issues\nTypo in docs.\n";
        match parse_agent_output(text, Role::Reviewer) {
            ParseResult::Reviewer { verdict, .. } => {
                let feedback = verdict.feedback().unwrap();
                assert!(feedback.contains("Critical Issues:\nPanics on empty input."));
                assert!(feedback.contains("Minor Issues:\nTypo in docs."));
                assert!(!feedback.contains("Major Issues"));
            }
            other => panic!("Expected Reviewer, got {:?}", other),
        }
    }

    #[test]
    fn test_reviewer_feedback_falls_back_to_raw_text() {
        let text = "  This does not compile.  ";
        match parse_agent_output(text, Role::Reviewer) {
            ParseResult::Reviewer { verdict, .. } => {
                assert_eq!(verdict.feedback(), Some("This does not compile."))
            }
            other => panic!("Expected Reviewer, got {:?}", other),
        }
        match parse_agent_output("", Role::Reviewer) {
            ParseResult::Reviewer { verdict, .. } => assert_eq!(verdict, Verdict::Silent),
            other => panic!("Expected Reviewer, got {:?}", other),
        }
    }

    #[test]
    fn test_feedback_inside_fence_is_ignored() {
        let text = "```\nFeedback: example only\n```\n### Major Issues\nReal issue.\n";
        match parse_agent_output(text, Role::Reviewer) {
            ParseResult::Reviewer { verdict, .. } => {
                assert_eq!(verdict.feedback(), Some("Major Issues:\nReal issue."))
            }
            other => panic!("Expected Reviewer, got {:?}", other),
        }
    }

    #[test]
    fn test_strip_markers_is_idempotent() {
        let text = format!(
            "## Status\n{}\nDone. {}\n",
            DEVELOPER_DONE_MARKER, DONE_MARKER
        );
        let once = strip_markers(&text);
        assert_eq!(strip_markers(&once), once);
        assert!(!once.contains("DONE DONE DONE"));
        assert!(!once.contains("DEV_DONE"));

        let nested = "DONE DDONE DONE DONE!!!ONE DONE!!!";
        let once = strip_markers(nested);
        assert_eq!(strip_markers(&once), once);
        assert!(!once.contains(DONE_MARKER));
    }
}
