//! Project configuration read from `.pairloop/config.toml`.
//!
//! Values are layered file → environment → CLI flags. The resolved [`Config`]
//! is handed explicitly to every component; nothing reads it globally.
//!
//! ```toml
//! [agent]
//! command = "claude"
//! model = "claude-sonnet-4-5"
//! max_turns = 40
//! skip_permissions = true
//! turn_timeout_secs = 1800
//!
//! [loop]
//! max_iterations = 10
//! extended = false
//! team_mode = false
//! solo = false
//!
//! [store]
//! path = ".pairloop/pairloop.db"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::MIN_DIFF_BYTES;
use crate::runner::DEFAULT_THRESHOLD_PCT;

/// Directory holding configuration and the database, relative to the project.
pub const PAIRLOOP_DIR: &str = ".pairloop";
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variables that override `agent.command`, highest priority first.
const AGENT_CMD_ENV: [&str; 2] = ["PAIRLOOP_AGENT_CMD", "CLAUDE_CMD"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    #[serde(rename = "loop")]
    pub run: LoopConfig,
    pub store: StoreConfig,
}

/// How the agent CLI is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub command: String,
    pub model: Option<String>,
    pub max_turns: Option<u32>,
    /// Pass `--dangerously-skip-permissions`.
    pub skip_permissions: bool,
    /// Kill a turn that runs longer than this.
    pub turn_timeout_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: None,
            max_turns: None,
            skip_permissions: true,
            turn_timeout_secs: None,
        }
    }
}

impl AgentConfig {
    /// Flags placed before the prompt on every invocation.
    pub fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        flags.push("--include-partial-messages".to_string());
        if let Some(model) = &self.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        if let Some(max_turns) = self.max_turns {
            flags.push("--max-turns".to_string());
            flags.push(max_turns.to_string());
        }
        flags
    }

    pub fn turn_timeout(&self) -> Option<Duration> {
        self.turn_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Iteration policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// On the first developer/reviewer agreement, run a few more iterations
    /// instead of completing.
    pub extended: bool,
    /// Tag each turn's environment with a team session id.
    pub team_mode: bool,
    /// Developer-only turns, completed by the role-agnostic done marker.
    pub solo: bool,
    /// Capacity of the observer event queue.
    pub event_buffer: usize,
    /// Byte ceiling for the diff shown to the reviewer.
    pub max_diff_bytes: usize,
    /// Percentage of the context window at which a turn is stopped.
    pub context_threshold_pct: u8,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            extended: false,
            team_mode: false,
            solo: false,
            event_buffer: 256,
            max_diff_bytes: 50_000,
            context_threshold_pct: DEFAULT_THRESHOLD_PCT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database path, relative to the project directory unless absolute.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(PAIRLOOP_DIR).join("pairloop.db"),
        }
    }
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load `<project>/.pairloop/config.toml` (defaults if absent) and apply
    /// environment overrides.
    pub fn load_for_project(project_dir: &Path) -> Result<Self> {
        let path = Self::path_for(project_dir);
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn path_for(project_dir: &Path) -> PathBuf {
        project_dir.join(PAIRLOOP_DIR).join(CONFIG_FILE)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(command) = AGENT_CMD_ENV
            .iter()
            .find_map(|key| lookup(key).filter(|v| !v.trim().is_empty()))
        {
            self.agent.command = command;
        }
    }

    /// Reject values the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            bail!("agent.command must not be empty");
        }
        if self.run.max_iterations == 0 {
            bail!("loop.max_iterations must be at least 1");
        }
        if self.run.event_buffer == 0 {
            bail!("loop.event_buffer must be at least 1");
        }
        if self.run.max_diff_bytes < MIN_DIFF_BYTES {
            bail!(
                "loop.max_diff_bytes must be at least {} (got {})",
                MIN_DIFF_BYTES,
                self.run.max_diff_bytes
            );
        }
        if !(1..=100).contains(&self.run.context_threshold_pct) {
            bail!(
                "loop.context_threshold_pct must be between 1 and 100 (got {})",
                self.run.context_threshold_pct
            );
        }
        Ok(())
    }

    pub fn store_path(&self, project_dir: &Path) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            project_dir.join(&self.store.path)
        }
    }
}
