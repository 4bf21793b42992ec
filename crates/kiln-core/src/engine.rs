//! Container engine trait and the types that cross it.
//!
//! Engines build images from a rendered recipe, create never-started
//! containers to read files out of an image, and run commands in fresh
//! containers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::image::{Image, ImageTag, TransientContainer};
use crate::Result;

/// Name the rendered Dockerfile gets inside the build context.
pub const DOCKERFILE_NAME: &str = "Dockerfile.kiln";

/// Everything the engine needs to build one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildContext {
    /// Host directory sent as the build context.
    pub root: PathBuf,
    /// Rendered Dockerfile contents.
    pub dockerfile: String,
    /// Number of leading Dockerfile instructions that set up the base image,
    /// system packages and dependencies. A failure there is a recipe error.
    pub recipe_steps: usize,
    /// Paths (relative to `root`) left out of the context.
    pub excludes: Vec<String>,
    pub build_args: HashMap<String, String>,
}

/// A command to run in a fresh container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Container name, unique per run.
    pub name: String,
    /// Commands joined with `&&` and run through `/bin/sh -c`.
    pub commands: Vec<String>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
}

impl RunSpec {
    pub fn shell_command(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            self.commands.join(" && "),
        ]
    }
}

/// Exit status of a command run in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub exit_code: i64,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Where engines send log output while a step runs.
pub type LogSink = mpsc::Sender<LogLine>;

/// Trait for container engines.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Name of this engine.
    fn name(&self) -> &'static str;

    /// Check the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Build and tag exactly one image, or fail without tagging.
    async fn build_image(
        &self,
        context: &BuildContext,
        tag: &ImageTag,
        logs: &LogSink,
    ) -> Result<Image>;

    /// Create a container from `image` without starting it.
    async fn create_container(&self, image: &Image, name: &str) -> Result<TransientContainer>;

    /// Copy the contents of `path` inside the container into `dest`.
    /// Returns the copied files relative to `dest`.
    async fn copy_from_container(
        &self,
        container: &TransientContainer,
        path: &str,
        dest: &Path,
    ) -> Result<Vec<PathBuf>>;

    /// Destroy a container.
    async fn remove_container(&self, container: &TransientContainer) -> Result<()>;

    /// Run commands in a new container from `image` and report the exit code.
    async fn run_in_image(&self, image: &Image, spec: RunSpec, logs: &LogSink)
        -> Result<RunOutcome>;

    /// Remove an image.
    async fn remove_image(&self, image: &Image) -> Result<()>;
}
