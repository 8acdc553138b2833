use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::diff::review_diff;
use super::events::{EventSink, LoopEvent};
use super::state::{Agreement, LoopState};
use crate::config::LoopConfig;
use crate::errors::OrchestratorError;
use crate::prompt::{DeveloperPrompt, ReviewerPrompt, build_developer_prompt, build_reviewer_prompt};
use crate::runner::{AgentLauncher, ContextTracker, LaunchRequest};
use crate::signals::{OutputParser, ParseResult, Role, strip_markers};
use crate::store::{Plan, PlanStatus, SessionStatus, Store};
use crate::stream::{EventKind, is_edit_tool};
use crate::tracker::{Vcs, WORKING_COPY};

/// Environment variable tagging each turn in team mode.
pub const TEAM_SESSION_ENV: &str = "PAIRLOOP_TEAM_SESSION";

/// How a run ended when it was not canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { iteration: u32 },
    MaxIterations { iteration: u32, ceiling: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub plan_id: i64,
    pub outcome: RunOutcome,
    /// Observer events lost to a full queue.
    pub dropped_events: u64,
}

/// Result of one iteration body.
enum Step {
    /// Completion signals agreed.
    Agreed,
    Continue,
}

/// Collected text and tool activity of one finished turn.
#[derive(Debug, Default)]
struct TurnOutput {
    session_id: Option<i64>,
    text: String,
    edit_tools: Vec<String>,
}

/// Drives developer and reviewer turns for one plan until both agree the
/// plan is done, the iteration ceiling is passed, or the run is canceled.
pub struct Orchestrator {
    plan_id: i64,
    config: LoopConfig,
    model: Option<String>,
    launcher: Arc<dyn AgentLauncher>,
    store: Arc<dyn Store>,
    vcs: Arc<dyn Vcs>,
    events: EventSink,
    parser: OutputParser,
    span: tracing::Span,
}

impl Orchestrator {
    /// Build an orchestrator and the receiving end of its event stream. The
    /// stream closes when [`Orchestrator::run`] returns.
    pub fn new(
        plan_id: i64,
        config: LoopConfig,
        model: Option<String>,
        launcher: Arc<dyn AgentLauncher>,
        store: Arc<dyn Store>,
        vcs: Arc<dyn Vcs>,
    ) -> (Self, mpsc::Receiver<LoopEvent>) {
        let (events, rx) = EventSink::channel(config.event_buffer);
        let span = tracing::info_span!("orchestrator", plan_id);
        let orchestrator = Self {
            plan_id,
            config,
            model,
            launcher,
            store,
            vcs,
            events,
            parser: OutputParser::new(tracing::enabled!(tracing::Level::DEBUG)),
            span,
        };
        (orchestrator, rx)
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<RunSummary, OrchestratorError> {
        let span = self.span.clone();
        async move {
            let result = self.run_loop(&cancel).await;
            let dropped = self.events.dropped();
            if dropped > 0 {
                tracing::warn!(dropped, "observer events were dropped during the run");
            }
            result.map(|outcome| RunSummary {
                plan_id: self.plan_id,
                outcome,
                dropped_events: dropped,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<RunOutcome, OrchestratorError> {
        let plan = self
            .store
            .get_plan(self.plan_id)
            .await
            .map_err(OrchestratorError::Store)?
            .ok_or(OrchestratorError::PlanNotFound { id: self.plan_id })?;

        let last_iteration = self
            .store
            .get_latest_session(plan.id)
            .await
            .map_err(OrchestratorError::Store)?
            .map(|s| s.iteration)
            .unwrap_or(0);
        if last_iteration > 0 {
            tracing::info!(last_iteration, "resuming plan");
            self.events.emit(LoopEvent::Resumed {
                plan_id: plan.id,
                last_iteration,
            });
        }

        let base = self.base_revision(&plan).await;
        self.set_status(PlanStatus::Running).await;

        let mut state = LoopState::new(
            last_iteration,
            self.config.max_iterations,
            self.config.extended,
        );
        self.events.emit(LoopEvent::Started {
            plan_id: plan.id,
            ceiling: state.ceiling(),
            extended: self.config.extended,
            solo: self.config.solo,
        });

        loop {
            if cancel.is_cancelled() {
                return Err(self.canceled(state.iteration()).await);
            }
            let Some(iteration) = state.advance() else {
                let ceiling = state.ceiling();
                tracing::info!(iteration = state.iteration(), ceiling, "iteration ceiling reached");
                self.set_status(PlanStatus::Stopped).await;
                self.events.emit(LoopEvent::MaxIterations {
                    iteration: state.iteration() - 1,
                    ceiling,
                });
                return Ok(RunOutcome::MaxIterations {
                    iteration: state.iteration() - 1,
                    ceiling,
                });
            };
            self.events.emit(LoopEvent::IterationStarted {
                iteration,
                ceiling: state.ceiling(),
            });
            tracing::info!(iteration, "iteration started");

            let step = if self.config.solo {
                self.solo_iteration(&plan, iteration, cancel).await
            } else {
                self.dual_iteration(&plan, iteration, base.as_deref(), cancel)
                    .await
            };

            match step {
                Ok(Step::Agreed) => match state.on_agreement() {
                    Agreement::Complete => {
                        self.set_status(PlanStatus::Completed).await;
                        self.events.emit(LoopEvent::IterationCompleted { iteration });
                        self.events.emit(LoopEvent::Completed { iteration });
                        tracing::info!(iteration, "plan completed");
                        return Ok(RunOutcome::Completed { iteration });
                    }
                    Agreement::Extend { ceiling } => {
                        tracing::info!(iteration, ceiling, "extended mode triggered");
                        self.events
                            .emit(LoopEvent::CeilingRaised { iteration, ceiling });
                    }
                    Agreement::Ignored => {
                        tracing::debug!(iteration, "agreement ignored after extension");
                    }
                },
                Ok(Step::Continue) => {}
                Err(e) if e.is_cancellation() || cancel.is_cancelled() => {
                    tracing::info!(iteration, error = %e, "run canceled");
                    return Err(self.canceled(iteration).await);
                }
                Err(e) => {
                    tracing::warn!(iteration, error = %e, "iteration failed, continuing");
                    let role = match &e {
                        OrchestratorError::Turn { role, .. } => Some(*role),
                        _ => None,
                    };
                    self.events.emit(LoopEvent::Error {
                        iteration,
                        role,
                        message: e.to_string(),
                    });
                }
            }
            self.events.emit(LoopEvent::IterationCompleted { iteration });
        }
    }

    /// Reuse the persisted base revision, or capture it on the first run.
    async fn base_revision(&self, plan: &Plan) -> Option<String> {
        if let Some(revision) = &plan.base_revision {
            self.events.emit(LoopEvent::BaseRevision {
                revision: Some(revision.clone()),
                reused: true,
            });
            return Some(revision.clone());
        }

        let captured = match self.vcs.parent_revision_of(WORKING_COPY) {
            Ok(revision) => Some(revision),
            Err(e) => {
                tracing::warn!(error = %e, "could not capture base revision");
                None
            }
        };
        if let Some(revision) = &captured
            && let Err(e) = self
                .store
                .update_plan_base_revision(plan.id, revision)
                .await
        {
            tracing::warn!(error = %e, "failed to persist base revision");
        }
        self.events.emit(LoopEvent::BaseRevision {
            revision: captured.clone(),
            reused: false,
        });
        captured
    }

    async fn dual_iteration(
        &self,
        plan: &Plan,
        iteration: u32,
        base: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Step, OrchestratorError> {
        let progress = self.latest(self.store.get_latest_progress(plan.id).await, "progress");
        let learnings = self.latest(self.store.get_latest_learnings(plan.id).await, "learnings");
        let feedback = self.latest(self.store.get_latest_feedback(plan.id).await, "feedback");

        let prompt = build_developer_prompt(&DeveloperPrompt {
            plan: &plan.content,
            iteration,
            progress: progress.as_deref(),
            learnings: learnings.as_deref(),
            feedback: feedback.as_deref(),
            team_mode: self.config.team_mode,
            solo: false,
        });
        let dev = self
            .run_turn(plan.id, iteration, Role::Developer, prompt, cancel)
            .await?;
        let dev_parsed = self.parser.parse_agent_output(&dev.text, Role::Developer);
        let dev_summary = strip_markers(dev_parsed.progress());
        let dev_learnings = strip_markers(dev_parsed.learnings());
        self.record_narrative(&dev, &dev_summary, &dev_learnings).await;

        if feedback.is_some()
            && let Err(e) = self.store.clear_feedback(plan.id).await
        {
            tracing::warn!(error = %e, "failed to clear consumed feedback");
        }

        let developer_done = self.gate_done(iteration, dev_parsed.signals_done(), &dev);

        if cancel.is_cancelled() {
            return Err(OrchestratorError::Canceled);
        }

        let diff = review_diff(self.vcs.as_ref(), base, self.config.max_diff_bytes);
        self.events.emit(LoopEvent::DiffPrepared {
            iteration,
            bytes: diff.text.len(),
            cumulative: diff.cumulative,
            truncated: diff.truncated,
        });

        let learnings_for_review = if dev_learnings.is_empty() {
            learnings.as_deref()
        } else {
            Some(dev_learnings.as_str())
        };
        let prompt = build_reviewer_prompt(&ReviewerPrompt {
            plan: &plan.content,
            iteration,
            progress: progress.as_deref(),
            learnings: learnings_for_review,
            diff: &diff.text,
            developer_summary: &dev_summary,
            developer_done,
            team_mode: self.config.team_mode,
        });
        let review = self
            .run_turn(plan.id, iteration, Role::Reviewer, prompt, cancel)
            .await?;
        let parsed = self.parser.parse_agent_output(&review.text, Role::Reviewer);
        self.record_narrative(
            &review,
            &strip_markers(parsed.progress()),
            &strip_markers(parsed.learnings()),
        )
        .await;

        let ParseResult::Reviewer { verdict, .. } = parsed else {
            return Ok(Step::Continue);
        };

        if verdict.is_approved() {
            self.events.emit(LoopEvent::ReviewerApproved { iteration });
            if developer_done {
                self.events.emit(LoopEvent::BothDone { iteration });
                return Ok(Step::Agreed);
            }
        } else if let Some(feedback) = verdict.feedback() {
            match review.session_id {
                Some(session_id) => {
                    if let Err(e) = self
                        .store
                        .create_feedback(plan.id, session_id, feedback)
                        .await
                    {
                        tracing::warn!(error = %e, "failed to persist reviewer feedback");
                    }
                }
                None => tracing::warn!("reviewer session was not persisted, feedback lost"),
            }
            self.events.emit(LoopEvent::FeedbackRecorded {
                iteration,
                feedback: feedback.to_string(),
            });
        }
        Ok(Step::Continue)
    }

    /// Developer-only iteration completed by the role-agnostic done marker.
    async fn solo_iteration(
        &self,
        plan: &Plan,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<Step, OrchestratorError> {
        let progress = self.latest(self.store.get_latest_progress(plan.id).await, "progress");
        let learnings = self.latest(self.store.get_latest_learnings(plan.id).await, "learnings");

        let prompt = build_developer_prompt(&DeveloperPrompt {
            plan: &plan.content,
            iteration,
            progress: progress.as_deref(),
            learnings: learnings.as_deref(),
            feedback: None,
            team_mode: self.config.team_mode,
            solo: true,
        });
        let dev = self
            .run_turn(plan.id, iteration, Role::Developer, prompt, cancel)
            .await?;
        let parsed = self.parser.parse(&dev.text);
        self.record_narrative(
            &dev,
            &strip_markers(parsed.progress()),
            &strip_markers(parsed.learnings()),
        )
        .await;

        if self.gate_done(iteration, parsed.signals_done(), &dev) {
            Ok(Step::Agreed)
        } else {
            Ok(Step::Continue)
        }
    }

    /// A done claim from a turn that also edited files is not trusted.
    fn gate_done(&self, iteration: u32, claimed: bool, turn: &TurnOutput) -> bool {
        if !claimed {
            return false;
        }
        if !turn.edit_tools.is_empty() {
            tracing::info!(iteration, tools = ?turn.edit_tools, "done signal suppressed by edits");
            self.events.emit(LoopEvent::DoneSuppressed {
                iteration,
                tools: turn.edit_tools.clone(),
            });
            return false;
        }
        self.events.emit(LoopEvent::DeveloperDone { iteration });
        true
    }

    async fn run_turn(
        &self,
        plan_id: i64,
        iteration: u32,
        role: Role,
        prompt: String,
        cancel: &CancellationToken,
    ) -> Result<TurnOutput, OrchestratorError> {
        self.events.emit(LoopEvent::PromptBuilt {
            iteration,
            role,
            chars: prompt.len(),
        });

        let session_id = match self
            .store
            .create_session(plan_id, iteration, role, &prompt)
            .await
        {
            Ok(session) => Some(session.id),
            Err(e) => {
                tracing::warn!(%role, error = %e, "failed to persist session");
                None
            }
        };
        self.events.emit(LoopEvent::TurnStarted { iteration, role });

        let mut env = Vec::new();
        if self.config.team_mode {
            env.push((
                TEAM_SESSION_ENV.to_string(),
                format!("{}:{}:{}", plan_id, iteration, role),
            ));
        }
        let request = LaunchRequest { prompt, env };

        let mut stream = match self.launcher.launch(request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(source) => {
                self.finish_session(session_id, "", SessionStatus::Failed)
                    .await;
                return Err(OrchestratorError::Turn { role, source });
            }
        };

        let mut tracker =
            ContextTracker::new(self.model.as_deref(), self.config.context_threshold_pct);
        let mut output = TurnOutput {
            session_id,
            ..TurnOutput::default()
        };
        let mut messages: Vec<String> = Vec::new();
        let mut result_text: Option<String> = None;
        let mut seq: u64 = 0;

        while let Some(event) = stream.next_event().await {
            if let Some(session_id) = session_id
                && let Err(e) = self
                    .store
                    .create_raw_event(session_id, seq, event.kind.name(), &event.raw)
                    .await
            {
                tracing::warn!(seq, error = %e, "failed to persist raw event");
            }
            seq += 1;

            match &event.kind {
                EventKind::Init(init) => {
                    if self.model.is_none()
                        && let Some(model) = &init.model
                    {
                        tracker.set_model(model);
                    }
                }
                EventKind::Message(message) => {
                    if !message.text.is_empty() {
                        messages.push(message.text.clone());
                    }
                    if let Some(usage) = &message.usage
                        && tracker.record(usage.total())
                    {
                        tracing::warn!(
                            %role,
                            used = tracker.used(),
                            limit = tracker.limit(),
                            "context window threshold reached, stopping turn"
                        );
                        stream.stop();
                        self.events.emit(LoopEvent::ContextLimit {
                            role,
                            used: tracker.used(),
                            limit: tracker.limit(),
                        });
                    }
                }
                EventKind::ToolUse(tool) => {
                    if is_edit_tool(&tool.name) {
                        output.edit_tools.push(tool.name.clone());
                    }
                }
                EventKind::Result(result) => {
                    result_text = result.result.clone().filter(|r| !r.trim().is_empty());
                }
                _ => {}
            }
            self.events.emit(LoopEvent::Stream { role, event });
        }

        let exit = stream.wait().await;
        output.text = result_text.unwrap_or_else(|| messages.join("\n"));

        match exit {
            Ok(()) => {
                self.finish_session(session_id, &output.text, SessionStatus::Completed)
                    .await;
                self.events.emit(LoopEvent::TurnCompleted {
                    iteration,
                    role,
                    output_chars: output.text.len(),
                    tokens: tracker.used(),
                });
                Ok(output)
            }
            Err(source) => {
                self.finish_session(session_id, &output.text, SessionStatus::Failed)
                    .await;
                Err(OrchestratorError::Turn { role, source })
            }
        }
    }

    async fn record_narrative(&self, turn: &TurnOutput, progress: &str, learnings: &str) {
        let Some(session_id) = turn.session_id else {
            return;
        };
        if !progress.is_empty()
            && let Err(e) = self.store.create_progress(session_id, progress).await
        {
            tracing::warn!(error = %e, "failed to persist progress");
        }
        if !learnings.is_empty()
            && let Err(e) = self.store.create_learnings(session_id, learnings).await
        {
            tracing::warn!(error = %e, "failed to persist learnings");
        }
    }

    async fn finish_session(&self, session_id: Option<i64>, output: &str, status: SessionStatus) {
        if let Some(session_id) = session_id
            && let Err(e) = self
                .store
                .complete_session(session_id, output, status)
                .await
        {
            tracing::warn!(session_id, error = %e, "failed to complete session");
        }
    }

    /// Best-effort read: a failed lookup is treated as absent.
    fn latest(&self, result: anyhow::Result<Option<String>>, what: &str) -> Option<String> {
        match result {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(e) => {
                tracing::warn!(what, error = %e, "failed to load latest record");
                None
            }
        }
    }

    async fn set_status(&self, status: PlanStatus) {
        if let Err(e) = self.store.update_plan_status(self.plan_id, status).await {
            tracing::warn!(%status, error = %e, "failed to update plan status");
        }
    }

    async fn canceled(&self, iteration: u32) -> OrchestratorError {
        self.set_status(PlanStatus::Stopped).await;
        self.events.emit(LoopEvent::Canceled { iteration });
        OrchestratorError::Canceled
    }
}
