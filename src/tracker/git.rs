use anyhow::{Context, Result};
use git2::{Diff, DiffFormat, DiffOptions, Repository, Tree};
use std::path::{Path, PathBuf};

use super::{Vcs, WORKING_COPY};

/// [`Vcs`] over a git repository. The working copy is the index plus
/// uncommitted and untracked files on top of `HEAD`.
pub struct GitVcs {
    path: PathBuf,
}

impl GitVcs {
    pub fn new(project_dir: &Path) -> Result<Self> {
        Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            path: project_dir.to_path_buf(),
        })
    }

    // `Repository` is not `Sync`, so each call opens its own handle.
    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.path).context("Failed to open git repository")
    }

    fn diff_options() -> DiffOptions {
        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        opts
    }

    /// Tree of `rev`, or `None` for an unborn `HEAD`.
    fn tree_of<'r>(repo: &'r Repository, rev: &str) -> Result<Option<Tree<'r>>> {
        if rev == "HEAD" && repo.head().is_err() {
            return Ok(None);
        }
        let object = repo
            .revparse_single(rev)
            .with_context(|| format!("Unknown revision '{}'", rev))?;
        let tree = object
            .peel_to_tree()
            .with_context(|| format!("Revision '{}' has no tree", rev))?;
        Ok(Some(tree))
    }

    fn diff_between<'r>(repo: &'r Repository, from: &str, to: &str) -> Result<Diff<'r>> {
        let mut opts = Self::diff_options();
        let from = if from == WORKING_COPY { "HEAD" } else { from };
        let old_tree = Self::tree_of(repo, from)?;
        let diff = if to == WORKING_COPY {
            repo.diff_tree_to_workdir_with_index(old_tree.as_ref(), Some(&mut opts))?
        } else {
            let new_tree = Self::tree_of(repo, to)?;
            repo.diff_tree_to_tree(old_tree.as_ref(), new_tree.as_ref(), Some(&mut opts))?
        };
        Ok(diff)
    }
}

/// Render a diff as unified patch text.
fn patch_text(diff: &Diff<'_>) -> Result<String> {
    let mut buf = Vec::new();
    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if matches!(line.origin(), '+' | '-' | ' ') {
            buf.push(line.origin() as u8);
        }
        buf.extend_from_slice(line.content());
        true
    })
    .context("Failed to render diff")?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

impl Vcs for GitVcs {
    fn parent_revision_of(&self, rev: &str) -> Result<String> {
        let repo = self.repo()?;
        if rev == WORKING_COPY {
            let head = repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .context("Working copy has no parent commit")?;
            return Ok(head.id().to_string());
        }
        let commit = repo
            .revparse_single(rev)
            .and_then(|o| o.peel_to_commit())
            .with_context(|| format!("Unknown revision '{}'", rev))?;
        let parent = commit
            .parent(0)
            .with_context(|| format!("Revision '{}' has no parent", rev))?;
        Ok(parent.id().to_string())
    }

    fn diff(&self, from: &str, to: &str) -> Result<String> {
        let repo = self.repo()?;
        let diff = Self::diff_between(&repo, from, to)?;
        patch_text(&diff)
    }

    fn diff_current(&self) -> Result<String> {
        self.diff("HEAD", WORKING_COPY)
    }

    fn show_current_change(&self) -> Result<String> {
        let repo = self.repo()?;
        let header = match repo.head().and_then(|h| h.peel_to_commit()) {
            Ok(commit) => format!(
                "Working copy on top of {} {}\n\n",
                &commit.id().to_string()[..12],
                commit.summary().unwrap_or_default()
            ),
            Err(_) => "Working copy (no commits yet)\n\n".to_string(),
        };
        let diff = Self::diff_between(&repo, "HEAD", WORKING_COPY)?;
        Ok(format!("{}{}", header, patch_text(&diff)?))
    }
}
