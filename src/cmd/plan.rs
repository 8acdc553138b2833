//! Plan registration, listing and status commands.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use pairloop::config::Config;
use pairloop::store::{Plan, PlanStatus, Store};

use super::open_store;

fn store_for(project_dir: &Path) -> Result<impl Store> {
    let config = Config::load_for_project(project_dir)?;
    open_store(project_dir, &config)
}

fn styled_status(status: PlanStatus) -> String {
    padded_status(status, 0)
}

/// Pad before styling so escape codes do not break column alignment.
fn padded_status(status: PlanStatus, width: usize) -> String {
    let label = format!("{:<width$}", status.as_str());
    match status {
        PlanStatus::Pending => style(label).dim().to_string(),
        PlanStatus::Running => style(label).cyan().to_string(),
        PlanStatus::Completed => style(label).green().to_string(),
        PlanStatus::Stopped => style(label).yellow().to_string(),
    }
}

pub async fn cmd_plan_add(project_dir: &Path, file: &Path, name: Option<&str>) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read plan file: {}", file.display()))?;
    if content.trim().is_empty() {
        bail!("Plan file is empty: {}", file.display());
    }
    let name = match name {
        Some(name) => name.to_string(),
        None => file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plan".to_string()),
    };

    let store = store_for(project_dir)?;
    let plan = store.create_plan(&name, &content).await?;
    println!(
        "Created plan {} ({})",
        style(format!("#{}", plan.id)).bold(),
        plan.name
    );
    println!("Run `pairloop run {}` to start it.", plan.id);
    Ok(())
}

pub async fn cmd_plan_list(project_dir: &Path, json: bool) -> Result<()> {
    let store = store_for(project_dir)?;
    let plans = store.list_plans().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(());
    }

    if plans.is_empty() {
        println!("No plans yet. Add one with `pairloop plan add <file>`.");
        return Ok(());
    }

    println!();
    println!("{:<6} {:<30} {:<10} Updated", "ID", "Name", "Status");
    println!("{:<6} {:<30} {:<10} -------", "------", "-".repeat(30), "------");
    for plan in &plans {
        println!(
            "{:<6} {:<30} {} {}",
            plan.id,
            plan.name,
            padded_status(plan.status, 10),
            plan.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!();
    Ok(())
}

async fn require_plan(store: &impl Store, id: i64) -> Result<Plan> {
    match store.get_plan(id).await? {
        Some(plan) => Ok(plan),
        None => bail!("Plan {} not found", id),
    }
}

pub async fn cmd_plan_show(project_dir: &Path, id: i64) -> Result<()> {
    let store = store_for(project_dir)?;
    let plan = require_plan(&store, id).await?;

    println!();
    println!("{} {}", style(format!("Plan #{}", plan.id)).bold(), plan.name);
    println!("Status:   {}", styled_status(plan.status));
    println!(
        "Base:     {}",
        plan.base_revision.as_deref().unwrap_or("(not captured yet)")
    );
    println!("Created:  {}", plan.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!();
    println!("{}", plan.content.trim_end());
    println!();
    Ok(())
}

pub async fn cmd_status(project_dir: &Path, id: i64) -> Result<()> {
    let store = store_for(project_dir)?;
    let plan = require_plan(&store, id).await?;

    println!();
    println!("{} {}", style(format!("Plan #{}", plan.id)).bold(), plan.name);
    println!("Status:     {}", styled_status(plan.status));
    match store.get_latest_session(plan.id).await? {
        Some(session) => println!(
            "Iteration:  {} ({} turn, {})",
            session.iteration,
            session.role,
            session.status.as_str()
        ),
        None => println!("Iteration:  none yet"),
    }

    let sections = [
        ("Progress", store.get_latest_progress(plan.id).await?),
        ("Learnings", store.get_latest_learnings(plan.id).await?),
        ("Outstanding feedback", store.get_latest_feedback(plan.id).await?),
    ];
    for (title, content) in sections {
        if let Some(content) = content {
            println!();
            println!("{}", style(title).bold().underlined());
            println!("{}", content.trim_end());
        }
    }
    println!();
    Ok(())
}
