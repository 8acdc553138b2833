//! Project initialization and store access shared by the other commands.

use anyhow::{Context, Result};
use std::path::Path;

use pairloop::config::{Config, PAIRLOOP_DIR};
use pairloop::store::SqliteStore;

/// Keeps the loop's own files out of the diffs shown to the reviewer.
const GITIGNORE: &str = "*\n";

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let pairloop_dir = project_dir.join(PAIRLOOP_DIR);
    let config_path = Config::path_for(project_dir);
    let existed = config_path.exists();

    ensure_layout(project_dir)?;
    if !existed || force {
        Config::default().save(&config_path)?;
    }

    if existed && !force {
        println!(
            "pairloop already initialized at {}",
            pairloop_dir.display()
        );
        println!("Keeping existing config.toml (use --force to overwrite).");
        return Ok(());
    }

    println!("Initialized pairloop project at {}", pairloop_dir.display());
    println!();
    println!("  .pairloop/");
    println!("  ├── config.toml   # Agent and loop settings");
    println!("  └── pairloop.db   # Plans, sessions and notes (created on first use)");
    println!();
    println!("Next steps:");
    println!("  1. Run `pairloop plan add <file>` to register a plan");
    println!("  2. Run `pairloop run <plan-id>` to start the loop");
    Ok(())
}

/// Create `.pairloop/` with its `.gitignore` if missing.
pub fn ensure_layout(project_dir: &Path) -> Result<()> {
    let dir = project_dir.join(PAIRLOOP_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let gitignore = dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, GITIGNORE)
            .with_context(|| format!("Failed to write {}", gitignore.display()))?;
    }
    Ok(())
}

pub fn open_store(project_dir: &Path, config: &Config) -> Result<SqliteStore> {
    ensure_layout(project_dir)?;
    let path = config.store_path(project_dir);
    SqliteStore::new(&path)
        .with_context(|| format!("Failed to open plan database at {}", path.display()))
}
