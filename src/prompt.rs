//! Prompt rendering for developer and reviewer turns.

use crate::signals::{
    DEVELOPER_DONE_MARKER, DONE_MARKER, LEARNINGS_HEADER, PROGRESS_HEADER,
    REVIEWER_APPROVED_MARKER, STATUS_HEADER, VERDICT_HEADER,
};

/// State handed to a developer turn.
#[derive(Debug, Clone, Default)]
pub struct DeveloperPrompt<'a> {
    pub plan: &'a str,
    pub iteration: u32,
    pub progress: Option<&'a str>,
    pub learnings: Option<&'a str>,
    /// Outstanding reviewer feedback, consumed by this turn.
    pub feedback: Option<&'a str>,
    /// Other agents may share the working copy.
    pub team_mode: bool,
    /// No reviewer follows; completion uses the role-agnostic marker.
    pub solo: bool,
}

/// State handed to a reviewer turn.
#[derive(Debug, Clone, Default)]
pub struct ReviewerPrompt<'a> {
    pub plan: &'a str,
    pub iteration: u32,
    pub progress: Option<&'a str>,
    pub learnings: Option<&'a str>,
    pub diff: &'a str,
    /// What the developer reported this iteration.
    pub developer_summary: &'a str,
    pub developer_done: bool,
    pub team_mode: bool,
}

fn optional_section(title: &str, body: Option<&str>) -> String {
    match body.map(str::trim).filter(|b| !b.is_empty()) {
        Some(body) => format!("## {}\n{}\n\n", title, body),
        None => String::new(),
    }
}

fn team_note(team_mode: bool) -> &'static str {
    if team_mode {
        "Note: you are part of a team session. Other agents may be editing this working copy; \
         re-read files before changing them and keep edits scoped to your task.\n\n"
    } else {
        ""
    }
}

pub fn build_developer_prompt(input: &DeveloperPrompt<'_>) -> String {
    let feedback = match input.feedback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(feedback) => format!(
            "## REVIEWER FEEDBACK\nThe reviewer rejected the previous iteration. Address every point:\n\n{}\n\n",
            feedback
        ),
        None => String::new(),
    };

    let (done_marker, done_rule) = if input.solo {
        (
            DONE_MARKER,
            "Only output the marker when the whole plan is implemented and verified.",
        )
    } else {
        (
            DEVELOPER_DONE_MARKER,
            "Only output the marker when you believe the whole plan is implemented and verified; a reviewer will check your work.",
        )
    };

    format!(
        r#"You are the developer working through the plan below. This is iteration {iteration}.

{team}## PLAN
{plan}

{progress}{learnings}{feedback}## CRITICAL RULES
1. Check existing code before making changes
2. Run tests/checks to verify your work
3. {done_rule}

## OUTPUT FORMAT
End your reply with these sections:

{progress_header}
What you did this iteration.

{learnings_header}
Facts worth remembering in later iterations.

{status_header}
{done_marker} if the plan is complete, otherwise what remains.
"#,
        iteration = input.iteration,
        team = team_note(input.team_mode),
        plan = input.plan.trim(),
        progress = optional_section("PROGRESS SO FAR", input.progress),
        learnings = optional_section("LEARNINGS SO FAR", input.learnings),
        feedback = feedback,
        done_rule = done_rule,
        progress_header = PROGRESS_HEADER,
        learnings_header = LEARNINGS_HEADER,
        status_header = STATUS_HEADER,
        done_marker = done_marker,
    )
}

pub fn build_reviewer_prompt(input: &ReviewerPrompt<'_>) -> String {
    let claim = if input.developer_done {
        "The developer claims the plan is complete. Verify that claim against the plan."
    } else {
        "The developer has not claimed completion yet. Review the work so far."
    };

    format!(
        r#"You are the reviewer for iteration {iteration} of the plan below. Do not edit files.

{team}## PLAN
{plan}

{progress}{learnings}## DEVELOPER SUMMARY
{claim}

{summary}

## CHANGES
```diff
{diff}
```

## OUTPUT FORMAT
{progress_header}
Your assessment of the overall state.

{learnings_header}
Facts worth remembering in later iterations.

### Critical Issues
Problems that must be fixed, or None.

### Major Issues
Problems that should be fixed, or None.

### Minor Issues
Small improvements, or None.

{verdict_header}
{approved} if the plan is fully and correctly implemented.
Otherwise a line starting with "Feedback:" followed by what the developer must change.
"#,
        iteration = input.iteration,
        team = team_note(input.team_mode),
        plan = input.plan.trim(),
        progress = optional_section("PROGRESS SO FAR", input.progress),
        learnings = optional_section("LEARNINGS SO FAR", input.learnings),
        claim = claim,
        summary = input.developer_summary.trim(),
        diff = input.diff.trim_end(),
        progress_header = PROGRESS_HEADER,
        learnings_header = LEARNINGS_HEADER,
        verdict_header = VERDICT_HEADER,
        approved = REVIEWER_APPROVED_MARKER,
    )
}
