//! Observable output of a run.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::signals::Role;
use crate::stream::StreamEvent;

/// Everything an observer can see of a run, in order.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    Started {
        plan_id: i64,
        ceiling: u32,
        extended: bool,
        solo: bool,
    },
    /// Earlier sessions exist; numbering continues after `last_iteration`.
    Resumed {
        plan_id: i64,
        last_iteration: u32,
    },
    /// `None` when no base revision could be captured.
    BaseRevision {
        revision: Option<String>,
        reused: bool,
    },
    IterationStarted {
        iteration: u32,
        ceiling: u32,
    },
    IterationCompleted {
        iteration: u32,
    },
    TurnStarted {
        iteration: u32,
        role: Role,
    },
    TurnCompleted {
        iteration: u32,
        role: Role,
        output_chars: usize,
        tokens: u64,
    },
    PromptBuilt {
        iteration: u32,
        role: Role,
        chars: usize,
    },
    /// A protocol event passed through from the running turn.
    Stream {
        role: Role,
        event: StreamEvent,
    },
    ContextLimit {
        role: Role,
        used: u64,
        limit: u64,
    },
    DiffPrepared {
        iteration: u32,
        bytes: usize,
        cumulative: bool,
        truncated: bool,
    },
    DeveloperDone {
        iteration: u32,
    },
    /// The developer claimed completion but also edited files this turn.
    DoneSuppressed {
        iteration: u32,
        tools: Vec<String>,
    },
    ReviewerApproved {
        iteration: u32,
    },
    BothDone {
        iteration: u32,
    },
    FeedbackRecorded {
        iteration: u32,
        feedback: String,
    },
    CeilingRaised {
        iteration: u32,
        ceiling: u32,
    },
    Completed {
        iteration: u32,
    },
    MaxIterations {
        iteration: u32,
        ceiling: u32,
    },
    /// A failure that was absorbed; the loop moves on.
    Error {
        iteration: u32,
        role: Option<Role>,
        message: String,
    },
    Canceled {
        iteration: u32,
    },
}

impl LoopEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Resumed { .. } => "resumed",
            Self::BaseRevision { .. } => "base_revision",
            Self::IterationStarted { .. } => "iteration_started",
            Self::IterationCompleted { .. } => "iteration_completed",
            Self::TurnStarted { .. } => "turn_started",
            Self::TurnCompleted { .. } => "turn_completed",
            Self::PromptBuilt { .. } => "prompt_built",
            Self::Stream { .. } => "stream",
            Self::ContextLimit { .. } => "context_limit",
            Self::DiffPrepared { .. } => "diff_prepared",
            Self::DeveloperDone { .. } => "developer_done",
            Self::DoneSuppressed { .. } => "done_suppressed",
            Self::ReviewerApproved { .. } => "reviewer_approved",
            Self::BothDone { .. } => "both_done",
            Self::FeedbackRecorded { .. } => "feedback_recorded",
            Self::CeilingRaised { .. } => "ceiling_raised",
            Self::Completed { .. } => "completed",
            Self::MaxIterations { .. } => "max_iterations",
            Self::Error { .. } => "error",
            Self::Canceled { .. } => "canceled",
        }
    }
}

/// Producer side of the bounded observer queue.
///
/// `emit` never waits: when the queue is full the event is dropped and
/// counted, so a slow observer cannot stall the loop.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<LoopEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LoopEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn emit(&self, event: LoopEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped.is_power_of_two() {
                    tracing::warn!(
                        kind = event.kind(),
                        dropped,
                        "observer queue full, dropping events"
                    );
                }
            }
            // Nobody is listening.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Events dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
