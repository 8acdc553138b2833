use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::orchestrator::LoopEvent;
use crate::signals::Role;
use crate::stream::{EventKind, describe_tool_use, tool_emoji, truncate_str};
use crate::ui::icons::{
    CHECK, CROSS, DIFF, FEEDBACK, PIVOT, REVIEW, RUNNING, SPARKLE, STOP, WARN,
};

/// Terminal renderer for the loop's event stream.
///
/// A spinner shows the current iteration and turn; notable events are
/// printed above it. When stderr is not a terminal the spinner is hidden and
/// lines go to stdout.
pub struct LoopUI {
    multi: MultiProgress,
    iteration_bar: ProgressBar,
    verbose: bool,
    iteration: u32,
    ceiling: u32,
    role: Option<Role>,
}

impl LoopUI {
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let iteration_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        let iteration_bar = multi.add(ProgressBar::new_spinner());
        iteration_bar.set_style(iteration_style);
        iteration_bar.set_prefix("  Iter");

        Self {
            multi,
            iteration_bar,
            verbose,
            iteration: 0,
            ceiling: 0,
            role: None,
        }
    }

    /// Render events until the orchestrator closes the stream.
    pub async fn observe(&mut self, mut rx: mpsc::Receiver<LoopEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(&event);
        }
        self.iteration_bar.finish_and_clear();
    }

    pub fn handle(&mut self, event: &LoopEvent) {
        match event {
            LoopEvent::IterationStarted { iteration, ceiling } => {
                self.iteration = *iteration;
                self.ceiling = *ceiling;
                self.role = None;
                self.set_status("starting...");
                self.iteration_bar
                    .enable_steady_tick(Duration::from_millis(100));
            }
            LoopEvent::CeilingRaised { ceiling, .. } => {
                self.ceiling = *ceiling;
            }
            LoopEvent::TurnStarted { role, .. } => {
                self.role = Some(*role);
                self.set_status(&format!("{} turn", role));
            }
            LoopEvent::Stream { event, .. } => match &event.kind {
                EventKind::ToolUse(tool) => {
                    self.set_status(&describe_tool_use(&tool.name, &tool.input));
                }
                EventKind::AssistantText(chunk) => {
                    let snippet = chunk.trim();
                    if !snippet.is_empty() {
                        self.set_status(&format!("\u{1F4AD} {}", truncate_str(snippet, 60)));
                    }
                }
                _ => {}
            },
            LoopEvent::Completed { .. }
            | LoopEvent::MaxIterations { .. }
            | LoopEvent::Canceled { .. } => {
                self.iteration_bar.finish_and_clear();
            }
            _ => {}
        }

        if let Some(line) = event_line(event, self.verbose) {
            self.print_line(line);
        }
    }

    fn set_status(&self, status: &str) {
        let role = self
            .role
            .map(|r| format!("{} ", style(r).magenta()))
            .unwrap_or_default();
        self.iteration_bar.set_message(format!(
            "Iteration {}/{} {}{}",
            style(self.iteration).cyan(),
            self.ceiling,
            role,
            style(format!("({})", status)).dim()
        ));
    }

    /// Print above the spinner, or straight to stdout when it is hidden.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.is_hidden() || self.multi.println(msg.as_ref()).is_err() {
            println!("{}", msg.as_ref());
        }
    }
}

/// The line printed for `event`, if any. Stream events other than tool use
/// and errors are only shown in verbose mode.
pub fn event_line(event: &LoopEvent, verbose: bool) -> Option<String> {
    let line = match event {
        LoopEvent::Started {
            plan_id,
            ceiling,
            extended,
            solo,
        } => {
            let mut mode = Vec::new();
            if *extended {
                mode.push("extended");
            }
            if *solo {
                mode.push("solo");
            }
            let mode = if mode.is_empty() {
                String::new()
            } else {
                format!(" [{}]", mode.join(", "))
            };
            format!(
                "{}Running plan {} (up to {} iterations){}",
                RUNNING,
                style(format!("#{}", plan_id)).bold(),
                ceiling,
                mode
            )
        }
        LoopEvent::Resumed { last_iteration, .. } => format!(
            "{}Resuming after iteration {}",
            PIVOT,
            style(last_iteration).cyan()
        ),
        LoopEvent::BaseRevision { revision: None, .. } => format!(
            "{}{}",
            WARN,
            style("No base revision; the reviewer will only see the current change").yellow()
        ),
        LoopEvent::BaseRevision {
            revision: Some(rev),
            reused,
        } if verbose => format!(
            "    {} {}{}",
            style("base").dim(),
            truncate_str(rev, 12),
            if *reused { " (reused)" } else { "" }
        ),
        LoopEvent::IterationStarted { iteration, ceiling } => format!(
            "\n{} {}/{}",
            style("Iteration").bold(),
            style(iteration).cyan(),
            ceiling
        ),
        LoopEvent::TurnStarted { role, .. } => {
            let icon = match role {
                Role::Developer => RUNNING,
                Role::Reviewer => REVIEW,
            };
            format!("  {}{} turn", icon, style(role).magenta())
        }
        LoopEvent::TurnCompleted {
            role,
            output_chars,
            tokens,
            ..
        } if verbose => format!(
            "    {} {} done: {} chars, {} tokens",
            style("\u{2192}").dim(),
            role,
            output_chars,
            tokens
        ),
        LoopEvent::PromptBuilt { role, chars, .. } if verbose => format!(
            "    {} {} prompt: {} chars",
            style("\u{2192}").dim(),
            role,
            chars
        ),
        LoopEvent::Stream { event, .. } => match &event.kind {
            EventKind::ToolUse(tool) => format!(
                "    {} {}",
                tool_emoji(&tool.name),
                style(describe_tool_use(&tool.name, &tool.input)).yellow()
            ),
            EventKind::Error(err) => format!("    {}{}", CROSS, style(&err.message).red()),
            EventKind::Message(msg) if verbose && !msg.text.trim().is_empty() => format!(
                "    {} {}",
                style("\u{1F4AD}").dim(),
                style(truncate_str(msg.text.trim(), 200)).dim()
            ),
            _ => return None,
        },
        LoopEvent::ContextLimit { role, used, limit } => format!(
            "    {}{}",
            WARN,
            style(format!(
                "{} turn stopped at {} tokens (limit {})",
                role, used, limit
            ))
            .yellow()
        ),
        LoopEvent::DiffPrepared {
            bytes,
            cumulative,
            truncated,
            ..
        } if verbose => format!(
            "    {}{} bytes of {}{}",
            DIFF,
            bytes,
            if *cumulative {
                "cumulative diff"
            } else {
                "current change"
            },
            if *truncated { " (truncated)" } else { "" }
        ),
        LoopEvent::DeveloperDone { .. } => {
            format!("    {}Developer signaled done", SPARKLE)
        }
        LoopEvent::DoneSuppressed { tools, .. } => format!(
            "    {}{}",
            WARN,
            style(format!(
                "Done signal ignored: the turn also edited files ({})",
                tools.join(", ")
            ))
            .yellow()
        ),
        LoopEvent::ReviewerApproved { .. } => {
            format!("    {}Reviewer approved", CHECK)
        }
        LoopEvent::BothDone { iteration } => format!(
            "  {}{}",
            SPARKLE,
            style(format!(
                "Developer and reviewer agree at iteration {}",
                iteration
            ))
            .green()
            .bold()
        ),
        LoopEvent::FeedbackRecorded { feedback, .. } => {
            let first = feedback.lines().next().unwrap_or_default();
            format!(
                "    {}Feedback: {}",
                FEEDBACK,
                style(truncate_str(first, 100)).yellow()
            )
        }
        LoopEvent::CeilingRaised { ceiling, .. } => format!(
            "  {}Extended mode: running until iteration {}",
            PIVOT,
            style(ceiling).cyan()
        ),
        LoopEvent::Completed { iteration } => format!(
            "\n{}{}",
            CHECK,
            style(format!("Plan completed at iteration {}", iteration))
                .green()
                .bold()
        ),
        LoopEvent::MaxIterations { ceiling, .. } => format!(
            "\n{}{}",
            STOP,
            style(format!("Stopped after reaching the ceiling of {} iterations", ceiling)).yellow()
        ),
        LoopEvent::Error { role, message, .. } => {
            let role = role.map(|r| format!("{} ", r)).unwrap_or_default();
            format!("  {}{}", CROSS, style(format!("{}error: {}", role, message)).red())
        }
        LoopEvent::Canceled { iteration } => format!(
            "\n{}{}",
            STOP,
            style(format!("Canceled during iteration {}", iteration)).yellow()
        ),
        _ => return None,
    };
    Some(line)
}
