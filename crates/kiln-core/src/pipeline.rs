//! Pipeline definitions, step planning and the run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::artifact::ArtifactRef;
use crate::image::Image;
use crate::recipe::BuildRecipe;
use crate::{Error, Result, RunId};

/// Which event kinds a pipeline reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    Push,
    PullRequest,
}

impl std::str::FromStr for TriggerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(TriggerKind::Push),
            "pull_request" | "pull-request" => Ok(TriggerKind::PullRequest),
            other => Err(Error::InvalidInput(format!(
                "unsupported trigger event '{}'",
                other
            ))),
        }
    }
}

/// The event that started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEvent {
    Push {
        branch: Option<String>,
        sha: String,
    },
    PullRequest {
        number: u64,
        base: Option<String>,
        head_sha: String,
    },
}

impl TriggerEvent {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerEvent::Push { .. } => TriggerKind::Push,
            TriggerEvent::PullRequest { .. } => TriggerKind::PullRequest,
        }
    }

    /// Revision the run builds.
    pub fn revision(&self) -> &str {
        match self {
            TriggerEvent::Push { sha, .. } => sha,
            TriggerEvent::PullRequest { head_sha, .. } => head_sha,
        }
    }
}

/// Test suites that can run inside the built image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestSuite {
    /// Native test binaries built alongside the package.
    Compiled,
    /// The language-level test suite.
    Dynamic,
}

impl std::fmt::Display for TestSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestSuite::Compiled => write!(f, "compiled"),
            TestSuite::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Which test suites gate a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestSelection {
    #[default]
    None,
    Compiled,
    Dynamic,
    All,
}

impl TestSelection {
    pub fn includes(self, suite: TestSuite) -> bool {
        matches!(
            (self, suite),
            (TestSelection::All, _)
                | (TestSelection::Compiled, TestSuite::Compiled)
                | (TestSelection::Dynamic, TestSuite::Dynamic)
        )
    }
}

impl std::str::FromStr for TestSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(TestSelection::None),
            "compiled" => Ok(TestSelection::Compiled),
            "dynamic" => Ok(TestSelection::Dynamic),
            "all" => Ok(TestSelection::All),
            other => Err(Error::InvalidInput(format!(
                "unknown test selection '{}' (expected none|compiled|dynamic|all)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TestSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TestSelection::None => "none",
            TestSelection::Compiled => "compiled",
            TestSelection::Dynamic => "dynamic",
            TestSelection::All => "all",
        };
        write!(f, "{}", s)
    }
}

/// How the source tree is materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSpec {
    /// Initialize nested sub-repositories recursively.
    pub submodules: bool,
}

impl Default for CheckoutSpec {
    fn default() -> Self {
        Self { submodules: true }
    }
}

/// Which in-image directory is exported, and under what name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Retrieval key of the published bundle.
    pub name: String,
    /// In-image path; defaults to the recipe output directory.
    pub source_path: Option<String>,
    /// Local staging directory.
    pub destination: PathBuf,
}

/// A fully loaded pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub triggers: Vec<TriggerKind>,
    /// Recipe file the pipeline was loaded with.
    pub recipe_path: PathBuf,
    pub recipe: BuildRecipe,
    pub checkout: CheckoutSpec,
    pub tests: TestSelection,
    pub compiled_tests: Vec<String>,
    pub dynamic_tests: Vec<String>,
    pub artifact: Option<ArtifactSpec>,
    pub image_namespace: Option<String>,
    /// Wall-clock limit for the whole run. None defers to the runner.
    pub timeout: Option<Duration>,
}

/// A named pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Checkout,
    Build,
    CompiledTests,
    DynamicTests,
    ArtifactExtract,
    ArtifactUpload,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Checkout => "checkout",
            Step::Build => "build",
            Step::CompiledTests => "compiled-tests",
            Step::DynamicTests => "dynamic-tests",
            Step::ArtifactExtract => "artifact-extract",
            Step::ArtifactUpload => "artifact-upload",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl PipelineSpec {
    /// Whether the pipeline reacts to this event.
    pub fn accepts(&self, event: &TriggerEvent) -> bool {
        self.triggers.contains(&event.kind())
    }

    /// Commands of a test suite.
    pub fn test_commands(&self, suite: TestSuite) -> &[String] {
        match suite {
            TestSuite::Compiled => &self.compiled_tests,
            TestSuite::Dynamic => &self.dynamic_tests,
        }
    }

    /// In-image path the artifact step exports.
    pub fn artifact_source(&self) -> Option<String> {
        self.artifact.as_ref().map(|a| {
            a.source_path
                .clone()
                .unwrap_or_else(|| self.recipe.output_path())
        })
    }

    /// Ordered steps of a run.
    pub fn plan(&self) -> Vec<Step> {
        let mut steps = vec![Step::Checkout, Step::Build];
        if self.tests.includes(TestSuite::Compiled) {
            steps.push(Step::CompiledTests);
        }
        if self.tests.includes(TestSuite::Dynamic) {
            steps.push(Step::DynamicTests);
        }
        if self.artifact.is_some() {
            steps.push(Step::ArtifactExtract);
            steps.push(Step::ArtifactUpload);
        }
        steps
    }

    /// Check the parts of the definition that span several fields.
    pub fn validate(&self) -> Result<()> {
        if self.triggers.is_empty() {
            return Err(Error::InvalidInput(format!(
                "pipeline '{}' has no trigger",
                self.name
            )));
        }
        for suite in [TestSuite::Compiled, TestSuite::Dynamic] {
            if self.tests.includes(suite) && self.test_commands(suite).is_empty() {
                return Err(Error::InvalidInput(format!(
                    "{} tests are enabled but no commands are defined",
                    suite
                )));
            }
        }
        self.recipe.validate()
    }
}

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Started, or between two steps.
    Triggered,
    /// The step currently executing.
    Running(Step),
    Completed,
    Failed { step: Step, message: String },
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed { .. })
    }
}

/// Status of one step in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Succeeded,
    Failed { message: String },
    Skipped { reason: String },
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: Step,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One execution of a pipeline for one trigger event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline: String,
    pub trigger: TriggerEvent,
    pub plan: Vec<Step>,
    pub state: RunState,
    pub steps: Vec<StepResult>,
    /// Image built by this run, set once the build step succeeds.
    pub image: Option<Image>,
    pub artifacts: Vec<ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    current_started: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(id: RunId, spec: &PipelineSpec, trigger: TriggerEvent) -> Self {
        Self {
            id,
            pipeline: spec.name.clone(),
            trigger,
            plan: spec.plan(),
            state: RunState::Triggered,
            steps: Vec::new(),
            image: None,
            artifacts: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
            current_started: None,
        }
    }

    /// The step that must run next, if any.
    pub fn next_step(&self) -> Option<Step> {
        if self.state.is_terminal() || matches!(self.state, RunState::Running(_)) {
            return None;
        }
        self.plan.get(self.steps.len()).copied()
    }

    /// Enter `step`. Only the next planned step is accepted.
    pub fn begin(&mut self, step: Step) -> Result<()> {
        match self.next_step() {
            Some(next) if next == step => {
                self.state = RunState::Running(step);
                self.current_started = Some(Utc::now());
                Ok(())
            }
            _ => Err(Error::Internal(format!(
                "step '{}' cannot start in state {:?}",
                step, self.state
            ))),
        }
    }

    /// Mark the running step as succeeded. The last step completes the run.
    pub fn succeed(&mut self) -> Result<()> {
        let step = self.running_step()?;
        self.record(step, StepStatus::Succeeded);
        if self.steps.len() == self.plan.len() {
            self.state = RunState::Completed;
            self.finished_at = Some(Utc::now());
        } else {
            self.state = RunState::Triggered;
        }
        Ok(())
    }

    /// Fail the running step; every remaining step is recorded as skipped.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        let step = self.running_step()?;
        let message = message.into();
        self.record(
            step,
            StepStatus::Failed {
                message: message.clone(),
            },
        );
        let reason = format!("step '{}' failed", step);
        for remaining in self.plan[self.steps.len()..].to_vec() {
            self.steps.push(StepResult {
                step: remaining,
                status: StepStatus::Skipped {
                    reason: reason.clone(),
                },
                started_at: None,
                finished_at: None,
            });
        }
        self.state = RunState::Failed { step, message };
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Result recorded for `step`, if it got that far.
    pub fn step_result(&self, step: Step) -> Option<&StepResult> {
        self.steps.iter().find(|r| r.step == step)
    }

    fn running_step(&self) -> Result<Step> {
        match self.state {
            RunState::Running(step) => Ok(step),
            _ => Err(Error::Internal(format!(
                "no step is running (state {:?})",
                self.state
            ))),
        }
    }

    fn record(&mut self, step: Step, status: StepStatus) {
        self.steps.push(StepResult {
            step,
            status,
            started_at: self.current_started.take(),
            finished_at: Some(Utc::now()),
        });
    }
}
