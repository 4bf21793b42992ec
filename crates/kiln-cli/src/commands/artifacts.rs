//! Retrieval of published artifact bundles.

use anyhow::{Context, Result};
use clap::Subcommand;
use kiln_core::artifact::ArtifactStore;
use kiln_core::{Error, RunId};
use kiln_executor::LocalArtifactStore;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum ArtifactsCommand {
    /// List the bundles a run published
    List {
        /// Run id printed by `kiln run`
        #[arg(long)]
        run: RunId,

        /// Root of the local artifact store
        #[arg(long, default_value = ".kiln/artifacts")]
        store: PathBuf,
    },
    /// Copy a published bundle into a directory, verifying its checksum
    Fetch {
        /// Run id printed by `kiln run`
        #[arg(long)]
        run: RunId,

        /// Bundle name
        name: String,

        /// Directory to copy the files into
        dest: PathBuf,

        /// Root of the local artifact store
        #[arg(long, default_value = ".kiln/artifacts")]
        store: PathBuf,
    },
}

pub async fn run(command: ArtifactsCommand) -> Result<()> {
    match command {
        ArtifactsCommand::List { run, store } => list(&LocalArtifactStore::new(store), &run).await,
        ArtifactsCommand::Fetch {
            run,
            name,
            dest,
            store,
        } => fetch(&LocalArtifactStore::new(store), &run, &name, dest).await,
    }
}

async fn list(store: &dyn ArtifactStore, run: &RunId) -> Result<()> {
    let refs = store
        .list(run)
        .await
        .with_context(|| format!("Failed to list artifacts for run {}", run))?;
    if refs.is_empty() {
        println!("No artifacts published for run {}", run);
        return Ok(());
    }
    for reference in &refs {
        println!(
            "{}  {} files  {} bytes  sha256 {}",
            reference.key.name,
            reference.files.len(),
            reference.size,
            reference.checksum
        );
    }
    Ok(())
}

async fn fetch(store: &dyn ArtifactStore, run: &RunId, name: &str, dest: PathBuf) -> Result<()> {
    let reference = store
        .list(run)
        .await?
        .into_iter()
        .find(|r| r.key.name == name)
        .ok_or_else(|| Error::NotFound(format!("artifact '{}' in run {}", name, run)))?;

    let files = store
        .fetch(&reference, &dest)
        .await
        .with_context(|| format!("Failed to fetch artifact '{}'", name))?;
    for file in &files {
        println!("{}", dest.join(file).display());
    }
    println!("Fetched {} files (sha256 {})", files.len(), reference.checksum);
    Ok(())
}
