//! `pairloop run <plan-id>`: drive a plan through the developer/reviewer loop.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use pairloop::config::Config;
use pairloop::errors::OrchestratorError;
use pairloop::orchestrator::{Orchestrator, RunOutcome};
use pairloop::runner::AgentRunner;
use pairloop::tracker::GitVcs;
use pairloop::ui::LoopUI;

use super::super::RunArgs;
use super::open_store;

/// Layer command-line flags over the file and environment configuration.
pub fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if let Some(max) = args.max_iterations {
        config.run.max_iterations = max;
    }
    if args.extended {
        config.run.extended = true;
    }
    if args.solo {
        config.run.solo = true;
    }
    if args.team {
        config.run.team_mode = true;
    }
    if let Some(model) = &args.model {
        config.agent.model = Some(model.clone());
    }
    if let Some(cmd) = &args.agent_cmd {
        config.agent.command = cmd.clone();
    }
}

pub async fn cmd_run(project_dir: &Path, verbose: bool, args: &RunArgs) -> Result<()> {
    let mut config = Config::load_for_project(project_dir)?;
    apply_overrides(&mut config, args);
    config.validate()?;

    let store = open_store(project_dir, &config)?;
    let vcs = GitVcs::new(project_dir).with_context(|| {
        format!(
            "{} is not inside a git repository; the reviewer needs one to see changes",
            project_dir.display()
        )
    })?;
    let runner = AgentRunner::new(config.agent.clone(), project_dir.to_path_buf());

    let (orchestrator, events) = Orchestrator::new(
        args.plan_id,
        config.run.clone(),
        config.agent.model.clone(),
        Arc::new(runner),
        Arc::new(store),
        Arc::new(vcs),
    );

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, stopping the current turn");
                cancel.cancel();
            }
        })
    };

    let mut ui = LoopUI::new(verbose);
    let (result, ()) = tokio::join!(orchestrator.run(cancel.clone()), ui.observe(events));
    ctrl_c.abort();

    match result {
        Ok(summary) => {
            if summary.dropped_events > 0 && verbose {
                println!(
                    "{}",
                    style(format!(
                        "{} progress events were not displayed",
                        summary.dropped_events
                    ))
                    .dim()
                );
            }
            match summary.outcome {
                RunOutcome::Completed { .. } => Ok(()),
                RunOutcome::MaxIterations { ceiling, .. } => {
                    println!(
                        "Resume with `pairloop run {} --max-iterations <n>` to continue past {}.",
                        summary.plan_id, ceiling
                    );
                    Ok(())
                }
            }
        }
        Err(OrchestratorError::Canceled) => bail!("Run of plan {} was canceled", args.plan_id),
        Err(e) => Err(e).context(format!("Run of plan {} failed", args.plan_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RunArgs {
        RunArgs {
            plan_id: 1,
            max_iterations: None,
            extended: false,
            solo: false,
            team: false,
            model: None,
            agent_cmd: None,
        }
    }

    #[test]
    fn test_flags_override_file_values() {
        let mut config = Config::parse("[loop]\nmax_iterations = 4\n[agent]\nmodel = \"a\"").unwrap();
        let args = RunArgs {
            max_iterations: Some(7),
            extended: true,
            model: Some("b".into()),
            agent_cmd: Some("/opt/agent".into()),
            ..args()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.run.max_iterations, 7);
        assert!(config.run.extended);
        assert!(!config.run.solo);
        assert_eq!(config.agent.model.as_deref(), Some("b"));
        assert_eq!(config.agent.command, "/opt/agent");
    }

    #[test]
    fn test_absent_flags_keep_file_values() {
        let mut config = Config::parse("[loop]\nsolo = true\nmax_iterations = 4").unwrap();
        apply_overrides(&mut config, &args());
        assert!(config.run.solo);
        assert_eq!(config.run.max_iterations, 4);
    }
}
