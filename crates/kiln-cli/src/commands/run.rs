//! Local pipeline execution command.

use anyhow::{Context, Result, bail};
use clap::Args;
use kiln_config::load_pipeline;
use kiln_core::engine::LogStream;
use kiln_core::pipeline::{StepStatus, TestSelection, TriggerEvent, TriggerKind};
use kiln_core::source::SourceProvider;
use kiln_executor::{DockerEngine, GitSource, LocalArtifactStore, LocalSource};
use kiln_orchestrator::{PipelineEvent, PipelineOrchestrator};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the pipeline file
    #[arg(long, default_value = "kiln.kdl")]
    pub pipeline: PathBuf,

    /// Trigger event kind
    #[arg(long, env = "GITHUB_EVENT_NAME", default_value = "push")]
    pub event: TriggerKind,

    /// Revision to build (falls back to GITHUB_SHA, then the source tree's HEAD)
    #[arg(long, env = "KILN_SHA")]
    pub sha: Option<String>,

    /// Branch the push went to
    #[arg(long, env = "GITHUB_REF_NAME")]
    pub branch: Option<String>,

    /// Pull request number (pull_request events)
    #[arg(long)]
    pub pr: Option<u64>,

    /// Pull request base branch
    #[arg(long)]
    pub base: Option<String>,

    /// Override the pipeline's test selection
    #[arg(long)]
    pub tests: Option<TestSelection>,

    /// Existing working tree to build (defaults to the pipeline file's directory)
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Clone this repository instead of using a local tree
    #[arg(long, conflicts_with = "source")]
    pub clone: Option<String>,

    /// Scratch directory for checkouts
    #[arg(long, default_value = ".kiln/work")]
    pub workspace: PathBuf,

    /// Root of the local artifact store
    #[arg(long, default_value = ".kiln/artifacts")]
    pub store: PathBuf,

    /// Write the finished run as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Remove the built image when the run ends
    #[arg(long)]
    pub remove_image: bool,
}

/// Run a pipeline locally using Docker.
pub async fn run(args: RunArgs) -> Result<()> {
    let mut spec = load_pipeline(&args.pipeline)
        .with_context(|| format!("Failed to load pipeline: {}", args.pipeline.display()))?;
    if let Some(tests) = args.tests {
        spec.tests = tests;
        spec.validate().map_err(kiln_config::ConfigError::from)?;
    }

    let source_dir = match &args.source {
        Some(dir) => dir.clone(),
        None => pipeline_dir(&args.pipeline),
    };

    let sha = match args.sha.clone().or_else(|| std::env::var("GITHUB_SHA").ok()) {
        Some(sha) => sha,
        None if args.clone.is_some() => bail!("--sha is required with --clone"),
        None => head_revision(&source_dir).await?,
    };
    let trigger = trigger_event(&args, sha)?;

    let source: Arc<dyn SourceProvider> = match &args.clone {
        Some(url) => Arc::new(GitSource::new(url.clone())),
        None => Arc::new(LocalSource::new(
            source_dir
                .canonicalize()
                .with_context(|| format!("Failed to resolve source tree: {}", source_dir.display()))?,
        )),
    };
    let engine = Arc::new(DockerEngine::new().context("Failed to connect to Docker")?);
    let store = Arc::new(LocalArtifactStore::new(args.store.clone()));

    let mut env = HashMap::new();
    env.insert("CI".to_string(), "true".to_string());
    env.insert("KILN".to_string(), "true".to_string());

    let orchestrator = PipelineOrchestrator::new(engine, source, store, args.workspace.clone())
        .with_image_removal(args.remove_image)
        .with_test_env(env);

    println!("Running pipeline: {}", spec.name);
    let (mut rx, result_handle) = orchestrator.execute(&spec, trigger)?;

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::RunStarted { run_id, plan } => {
                let steps: Vec<&str> = plan.iter().map(|s| s.name()).collect();
                println!("Run {} ({})\n", run_id, steps.join(" -> "));
            }
            PipelineEvent::StepStarted { step } => {
                println!("▶ Step '{}' started", step);
            }
            PipelineEvent::StepLog { step, line } => {
                let stream_marker = match line.stream {
                    LogStream::Stdout => " ",
                    LogStream::Stderr => "!",
                    LogStream::System => "*",
                };
                println!("  [{}]{} {}", step, stream_marker, line.content);
            }
            PipelineEvent::StepCompleted { step, success } => {
                if success {
                    println!("✓ Step '{}' completed successfully\n", step);
                } else {
                    println!("✗ Step '{}' failed\n", step);
                }
            }
            PipelineEvent::PipelineCompleted { success } => {
                if success {
                    println!("--- Pipeline completed successfully ---");
                } else {
                    println!("--- Pipeline failed ---");
                }
            }
        }
    }

    let result = result_handle
        .await
        .context("Pipeline execution task failed")?;

    println!("\n--- Step Summary ---");
    for step in &result.run.steps {
        let status = match &step.status {
            StepStatus::Succeeded => "✓ succeeded".to_string(),
            StepStatus::Failed { message } => format!("✗ failed: {}", message),
            StepStatus::Skipped { reason } => format!("⊘ skipped: {}", reason),
        };
        println!("  {} - {}", step.step, status);
    }
    if let Some(image) = &result.run.image {
        println!("\nImage: {}", image.tag);
    }
    for artifact in &result.run.artifacts {
        println!(
            "Artifact: {} ({} files, sha256 {}) at {}",
            artifact.key.name,
            artifact.files.len(),
            artifact.checksum,
            artifact.location
        );
    }

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&result.run)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!(path = %path.display(), "Run report written");
    }

    let success = result.success();
    match result.error {
        None if success => {
            println!("\n✓ Pipeline succeeded!");
            Ok(())
        }
        Some(e) => Err(anyhow::Error::new(e).context("Pipeline failed")),
        None => bail!("Pipeline failed"),
    }
}

fn trigger_event(args: &RunArgs, sha: String) -> Result<TriggerEvent> {
    Ok(match args.event {
        TriggerKind::Push => TriggerEvent::Push {
            branch: args.branch.clone(),
            sha,
        },
        TriggerKind::PullRequest => {
            let Some(number) = args.pr else {
                bail!("--pr is required for pull_request events");
            };
            TriggerEvent::PullRequest {
                number,
                base: args.base.clone(),
                head_sha: sha,
            }
        }
    })
}

/// Directory containing the pipeline file, or the current directory.
fn pipeline_dir(pipeline: &Path) -> PathBuf {
    match pipeline.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

async fn head_revision(dir: &Path) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .await
        .context("Failed to run git")?;
    if !output.status.success() {
        bail!(
            "cannot determine the revision of {}; pass --sha",
            dir.display()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
