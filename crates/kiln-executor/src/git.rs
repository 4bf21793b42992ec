//! Source providers backed by the `git` command line.

use async_trait::async_trait;
use kiln_core::pipeline::{CheckoutSpec, TriggerEvent};
use kiln_core::source::{SourceProvider, SourceTree};
use kiln_core::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

async fn run_git(args: &[&str], cwd: &Path) -> Result<String> {
    debug!(cwd = %cwd.display(), ?args, "Running git");
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| Error::Checkout(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Checkout(format!(
            "git {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn update_submodules(root: &Path) -> Result<()> {
    info!(root = %root.display(), "Updating submodules");
    run_git(&["submodule", "update", "--init", "--recursive"], root).await?;
    Ok(())
}

/// Whether `head` is the revision `wanted` (full sha or an abbreviation of it).
fn same_revision(head: &str, wanted: &str) -> bool {
    let wanted = wanted.trim().to_ascii_lowercase();
    !wanted.is_empty() && head.to_ascii_lowercase().starts_with(&wanted)
}

/// Clones a remote repository for every run.
pub struct GitSource {
    url: String,
}

impl GitSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    fn name(&self) -> &'static str {
        "git"
    }

    async fn checkout(
        &self,
        event: &TriggerEvent,
        spec: &CheckoutSpec,
        dest: &Path,
    ) -> Result<SourceTree> {
        if dest.exists() && dest.read_dir()?.next().is_some() {
            return Err(Error::Checkout(format!(
                "checkout directory '{}' is not empty",
                dest.display()
            )));
        }
        tokio::fs::create_dir_all(dest).await?;

        info!(url = %self.url, dest = %dest.display(), revision = %event.revision(), "Cloning repository");
        let dest_str = dest.to_string_lossy().to_string();
        run_git(
            &["clone", "--no-checkout", &self.url, &dest_str],
            Path::new("."),
        )
        .await?;

        if let TriggerEvent::PullRequest { number, .. } = event {
            let refspec = format!("pull/{}/head", number);
            run_git(&["fetch", "origin", &refspec], dest).await?;
        }
        run_git(&["checkout", "--detach", event.revision()], dest).await?;

        if spec.submodules {
            update_submodules(dest).await?;
        }

        let sha = run_git(&["rev-parse", "HEAD"], dest).await?;
        Ok(SourceTree {
            root: dest.to_path_buf(),
            sha,
        })
    }
}

/// Uses a working tree the runner already checked out.
///
/// The tree is never switched to another revision; a HEAD that does not
/// match the trigger is a checkout error.
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceProvider for LocalSource {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn checkout(
        &self,
        event: &TriggerEvent,
        spec: &CheckoutSpec,
        _dest: &Path,
    ) -> Result<SourceTree> {
        let head = run_git(&["rev-parse", "HEAD"], &self.root).await?;
        if !same_revision(&head, event.revision()) {
            return Err(Error::Checkout(format!(
                "working tree is at {} but the run was triggered for {}",
                head,
                event.revision()
            )));
        }

        if spec.submodules {
            update_submodules(&self.root).await?;
        }

        info!(root = %self.root.display(), sha = %head, "Using local working tree");
        Ok(SourceTree {
            root: self.root.clone(),
            sha: head,
        })
    }
}
