use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "pairloop")]
#[command(version, about = "Drive a plan to completion with a developer agent and a reviewer agent")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .pairloop/ with a default config.toml
    Init {
        /// Overwrite an existing config.toml
        #[arg(long)]
        force: bool,
    },
    /// Register and inspect plans
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Run the developer/reviewer loop for a plan
    Run(RunArgs),
    /// Show a plan's status and latest notes
    Status { plan_id: i64 },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Store the contents of a file as a new plan
    Add {
        file: PathBuf,
        /// Plan name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List all plans
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show a plan's content
    Show { plan_id: i64 },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    pub plan_id: i64,

    /// Iteration ceiling for this run
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Keep going for a few iterations after the first agreement
    #[arg(long)]
    pub extended: bool,

    /// Developer turns only, without a reviewer
    #[arg(long)]
    pub solo: bool,

    /// Tag each turn with a team session id
    #[arg(long)]
    pub team: bool,

    /// Model passed to the agent CLI
    #[arg(long)]
    pub model: Option<String>,

    /// Agent CLI binary (overrides PAIRLOOP_AGENT_CMD)
    #[arg(long)]
    pub agent_cmd: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pairloop::logging::init(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Plan { command } => match command {
            PlanCommands::Add { file, name } => {
                cmd::cmd_plan_add(&project_dir, file, name.as_deref()).await?
            }
            PlanCommands::List { json } => cmd::cmd_plan_list(&project_dir, *json).await?,
            PlanCommands::Show { plan_id } => cmd::cmd_plan_show(&project_dir, *plan_id).await?,
        },
        Commands::Run(args) => cmd::cmd_run(&project_dir, cli.verbose, args).await?,
        Commands::Status { plan_id } => cmd::cmd_status(&project_dir, *plan_id).await?,
    }

    Ok(())
}
