//! Pipeline orchestrator - executes the planned steps of a run in order.

use kiln_config::VariableContext;
use kiln_config::dockerfile::build_context;
use kiln_core::artifact::{ArtifactBundle, ArtifactRef, ArtifactStore, BundleRegistry};
use kiln_core::engine::{ContainerEngine, LogLine, LogSink, RunSpec};
use kiln_core::image::{Image, ImageTag, TransientContainer};
use kiln_core::pipeline::{PipelineRun, PipelineSpec, Step, TestSuite, TriggerEvent};
use kiln_core::source::{SourceProvider, SourceTree};
use kiln_core::{Error, Result, RunId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Event emitted during pipeline execution.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted { run_id: RunId, plan: Vec<Step> },
    StepStarted { step: Step },
    StepLog { step: Step, line: LogLine },
    StepCompleted { step: Step, success: bool },
    PipelineCompleted { success: bool },
}

/// Result of a pipeline execution.
#[derive(Debug)]
pub struct PipelineResult {
    pub run: PipelineRun,
    /// The error that failed the run, if any.
    pub error: Option<Error>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.run.is_success()
    }
}

/// Values that live for exactly one run and are handed from step to step.
struct RunScope {
    spec: PipelineSpec,
    trigger: TriggerEvent,
    vars: VariableContext,
    tree: Option<SourceTree>,
    image: Option<Image>,
    staged: Option<StagedBundle>,
    bundles: BundleRegistry,
    artifacts: Vec<ArtifactRef>,
    /// Containers a step has asked the engine for and not yet seen removed.
    containers: Vec<TransientContainer>,
}

/// An extracted bundle: `dir` holds only this run's files.
struct StagedBundle {
    bundle: ArtifactBundle,
    dir: PathBuf,
}

impl RunScope {
    fn image(&self) -> Result<&Image> {
        self.image
            .as_ref()
            .ok_or_else(|| Error::Internal("no image has been built in this run".to_string()))
    }
}

/// Orchestrates the execution of a pipeline.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    engine: Arc<dyn ContainerEngine>,
    source: Arc<dyn SourceProvider>,
    store: Arc<dyn ArtifactStore>,
    /// Per-run scratch space (checkouts).
    workspace: PathBuf,
    remove_image: bool,
    /// Environment passed to test containers.
    env: HashMap<String, String>,
}

impl PipelineOrchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        source: Arc<dyn SourceProvider>,
        store: Arc<dyn ArtifactStore>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            engine,
            source,
            store,
            workspace,
            remove_image: false,
            env: HashMap::new(),
        }
    }

    /// Remove the run's image once the run finishes. Off by default; the
    /// engine owns image garbage collection.
    pub fn with_image_removal(mut self, remove: bool) -> Self {
        self.remove_image = remove;
        self
    }

    /// Environment variables set in test containers.
    pub fn with_test_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Start a run for `trigger`, returning a channel of events and a handle to get the final result.
    ///
    /// Fails up front when the pipeline does not react to the event or the
    /// revision cannot name a run.
    pub fn execute(
        &self,
        spec: &PipelineSpec,
        trigger: TriggerEvent,
    ) -> Result<(
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    )> {
        if !spec.accepts(&trigger) {
            return Err(Error::InvalidInput(format!(
                "pipeline '{}' does not run on {:?} events",
                spec.name,
                trigger.kind()
            )));
        }
        let run_id = RunId::from_revision(trigger.revision())?;
        let run = PipelineRun::new(run_id, spec, trigger);

        let (tx, rx) = mpsc::channel(100);
        let this = self.clone();
        let spec = spec.clone();

        let handle = tokio::spawn(async move { this.execute_inner(spec, run, tx).await });

        Ok((rx, handle))
    }

    /// Internal execution logic
    async fn execute_inner(
        self,
        spec: PipelineSpec,
        mut run: PipelineRun,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        let vars = VariableContext::for_run(&run.id, &run.trigger)
            .with_pipeline(&spec)
            .with_env(self.env.clone());

        let deadline = spec.timeout.and_then(|t| Instant::now().checked_add(t));
        let mut scope = RunScope {
            spec,
            trigger: run.trigger.clone(),
            vars,
            tree: None,
            image: None,
            staged: None,
            bundles: BundleRegistry::new(),
            artifacts: Vec::new(),
            containers: Vec::new(),
        };

        info!(run_id = %run.id, pipeline = %run.pipeline, plan = ?run.plan, "Run started");
        let _ = tx
            .send(PipelineEvent::RunStarted {
                run_id: run.id.clone(),
                plan: run.plan.clone(),
            })
            .await;

        let mut failure = None;

        while let Some(step) = run.next_step() {
            if let Err(e) = run.begin(step) {
                error!(run_id = %run.id, step = %step, error = %e, "Step could not start");
                failure = Some(e);
                break;
            }
            let _ = tx.send(PipelineEvent::StepStarted { step }).await;

            match self.run_step(step, &run.id, &mut scope, deadline, &tx).await {
                Ok(()) => {
                    info!(run_id = %run.id, step = %step, "Step completed successfully");
                    run.image = scope.image.clone();
                    run.artifacts = scope.artifacts.clone();
                    if let Err(e) = run.succeed() {
                        failure = Some(e);
                        break;
                    }
                    let _ = tx
                        .send(PipelineEvent::StepCompleted {
                            step,
                            success: true,
                        })
                        .await;
                }
                Err(e) => {
                    error!(run_id = %run.id, step = %step, error = %e, "Step failed");
                    let _ = run.fail(e.to_string());
                    let _ = tx
                        .send(PipelineEvent::StepCompleted {
                            step,
                            success: false,
                        })
                        .await;
                    failure = Some(e);
                    break;
                }
            }
        }

        if self.remove_image {
            if let Some(image) = &scope.image {
                if let Err(e) = self.engine.remove_image(image).await {
                    warn!(image = %image.tag, error = %e, "Failed to remove image");
                }
            }
        }

        let success = run.is_success();
        info!(run_id = %run.id, success, "Run finished");
        let _ = tx.send(PipelineEvent::PipelineCompleted { success }).await;

        PipelineResult {
            run,
            error: failure,
        }
    }

    /// Run one step, forwarding its log lines as events and honouring the run deadline.
    async fn run_step(
        &self,
        step: Step,
        run_id: &RunId,
        scope: &mut RunScope,
        deadline: Option<Instant>,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> Result<()> {
        let (log_tx, mut log_rx) = mpsc::channel::<LogLine>(256);
        let events = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(line) = log_rx.recv().await {
                let _ = events.send(PipelineEvent::StepLog { step, line }).await;
            }
        });

        let work = self.dispatch(step, run_id, scope, &log_tx);
        let mut timed_out = false;
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, work).await {
                Ok(result) => result,
                Err(_) => {
                    timed_out = true;
                    Err(Error::Timeout(format!(
                        "run exceeded its time limit during '{}'",
                        step
                    )))
                }
            },
            None => work.await,
        };

        if timed_out {
            self.remove_leftover_containers(scope).await;
        }
        scope.containers.clear();

        drop(log_tx);
        let _ = forwarder.await;
        result
    }

    /// Force-remove containers an interrupted step left behind.
    async fn remove_leftover_containers(&self, scope: &mut RunScope) {
        for container in scope.containers.drain(..) {
            match self.engine.remove_container(&container).await {
                Ok(()) => info!(container = %container.name, "Removed container left by an interrupted step"),
                Err(e) => warn!(container = %container.name, error = %e, "Failed to remove container"),
            }
        }
    }

    async fn dispatch(
        &self,
        step: Step,
        run_id: &RunId,
        scope: &mut RunScope,
        logs: &LogSink,
    ) -> Result<()> {
        match step {
            Step::Checkout => self.checkout(run_id, scope).await,
            Step::Build => self.build(run_id, scope, logs).await,
            Step::CompiledTests => self.run_tests(TestSuite::Compiled, run_id, scope, logs).await,
            Step::DynamicTests => self.run_tests(TestSuite::Dynamic, run_id, scope, logs).await,
            Step::ArtifactExtract => self.extract(run_id, scope).await,
            Step::ArtifactUpload => self.upload(run_id, scope).await,
        }
    }

    async fn checkout(&self, run_id: &RunId, scope: &mut RunScope) -> Result<()> {
        let dest = self.workspace.join(run_id.as_str()).join("source");
        let tree = self
            .source
            .checkout(&scope.trigger, &scope.spec.checkout, &dest)
            .await?;
        info!(run_id = %run_id, root = %tree.root.display(), sha = %tree.sha, provider = self.source.name(), "Source checked out");
        scope.tree = Some(tree);
        Ok(())
    }

    async fn build(&self, run_id: &RunId, scope: &mut RunScope, logs: &LogSink) -> Result<()> {
        let tree = scope
            .tree
            .as_ref()
            .ok_or_else(|| Error::Internal("build started before checkout".to_string()))?;
        let recipe = &scope.spec.recipe;
        recipe.validate()?;

        let source_root = tree.root.join(&recipe.source_root);
        let context = build_context(recipe, &source_root);
        let namespace = scope
            .spec
            .image_namespace
            .as_deref()
            .map(|ns| scope.vars.interpolate(ns));
        let tag = ImageTag::for_run(namespace.as_deref(), recipe, run_id)?;

        info!(run_id = %run_id, tag = %tag, engine = self.engine.name(), "Building image");
        let image = self.engine.build_image(&context, &tag, logs).await?;
        scope.image = Some(image);
        Ok(())
    }

    async fn run_tests(
        &self,
        suite: TestSuite,
        run_id: &RunId,
        scope: &mut RunScope,
        logs: &LogSink,
    ) -> Result<()> {
        let image = scope.image()?.clone();
        let spec = RunSpec {
            name: format!("kiln-{}-tests-{}", suite, run_id),
            commands: scope.vars.interpolate_vec(scope.spec.test_commands(suite)),
            working_dir: Some(scope.spec.recipe.workdir.clone()),
            env: self.env.clone(),
        };

        info!(run_id = %run_id, suite = %suite, image = %image.tag, "Running tests");
        // The engine removes the container itself unless the deadline cuts it short.
        scope.containers.push(TransientContainer {
            name: spec.name.clone(),
            image: image.tag.clone(),
        });
        let outcome = self.engine.run_in_image(&image, spec, logs).await?;
        scope.containers.clear();
        if !outcome.success() {
            return Err(Error::TestFailure {
                suite: suite.to_string(),
                exit_code: outcome.exit_code,
            });
        }
        Ok(())
    }

    async fn extract(&self, run_id: &RunId, scope: &mut RunScope) -> Result<()> {
        let artifact = scope
            .spec
            .artifact
            .as_ref()
            .ok_or_else(|| Error::Internal("no artifact is configured".to_string()))?;
        let bundle = ArtifactBundle {
            name: scope.vars.interpolate(&artifact.name),
            source_path: scope
                .spec
                .artifact_source()
                .unwrap_or_else(|| scope.spec.recipe.output_path()),
            destination: artifact.destination.clone(),
        };
        scope.bundles.claim(&bundle)?;
        create_dir(&bundle.destination).await?;

        // Fresh per run, so the published bundle never picks up older files.
        let staging = self
            .workspace
            .join(run_id.as_str())
            .join("artifacts")
            .join(&bundle.name);
        create_dir(&staging).await?;

        let image = scope.image()?.clone();
        let name = TransientContainer::extraction_name(run_id);
        scope.containers.push(TransientContainer {
            name: name.clone(),
            image: image.tag.clone(),
        });
        let container = self
            .engine
            .create_container(&image, &name)
            .await
            .map_err(into_extraction)?;

        let copied = self
            .engine
            .copy_from_container(&container, &bundle.source_path, &staging)
            .await;

        if let Err(e) = self.engine.remove_container(&container).await {
            warn!(container = %container.name, error = %e, "Failed to remove transient container");
        }
        scope.containers.clear();

        let files = copied.map_err(into_extraction)?;
        if files.is_empty() {
            return Err(Error::Extraction(format!(
                "'{}' is empty in image {}",
                bundle.source_path, container.image
            )));
        }
        place_files(&staging, &files, &bundle.destination).await?;

        info!(
            run_id = %run_id,
            artifact = %bundle.name,
            files = files.len(),
            dest = %bundle.destination.display(),
            "Artifact extracted"
        );
        scope.staged = Some(StagedBundle {
            bundle,
            dir: staging,
        });
        Ok(())
    }

    async fn upload(&self, run_id: &RunId, scope: &mut RunScope) -> Result<()> {
        let StagedBundle { bundle, dir } = scope
            .staged
            .as_ref()
            .ok_or_else(|| Error::Internal("upload started before extraction".to_string()))?;

        let reference = self
            .store
            .publish(run_id, &bundle.name, dir)
            .await
            .map_err(|e| match e {
                Error::Upload(_) | Error::Conflict(_) => e,
                other => Error::Upload(other.to_string()),
            })?;

        info!(run_id = %run_id, artifact = %bundle.name, store = self.store.name(), location = %reference.location, "Artifact uploaded");
        scope.artifacts.push(reference);
        Ok(())
    }
}

async fn create_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Extraction(format!("cannot create '{}': {}", dir.display(), e)))
}

/// Copy extracted files into the destination. Same-named files are
/// replaced; anything else already there is left alone.
async fn place_files(staging: &Path, files: &[PathBuf], dest: &Path) -> Result<()> {
    for file in files {
        let target = dest.join(file);
        if let Some(parent) = target.parent() {
            create_dir(parent).await?;
        }
        tokio::fs::copy(staging.join(file), &target)
            .await
            .map_err(|e| {
                Error::Extraction(format!("cannot write '{}': {}", target.display(), e))
            })?;
    }
    Ok(())
}

fn into_extraction(e: Error) -> Error {
    match e {
        Error::Extraction(_) => e,
        other => Error::Extraction(other.to_string()),
    }
}
