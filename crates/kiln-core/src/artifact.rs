//! Artifact bundles and the store they are published to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::{Error, Result, RunId};

/// A named export of one in-image directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBundle {
    /// Retrieval key after the run finishes.
    pub name: String,
    /// Directory inside the image.
    pub source_path: String,
    /// Local staging directory.
    pub destination: PathBuf,
}

/// Bundle names claimed within one run.
#[derive(Debug, Default)]
pub struct BundleRegistry {
    names: HashSet<String>,
}

impl BundleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bundle, rejecting a name already used in this run.
    pub fn claim(&mut self, bundle: &ArtifactBundle) -> Result<()> {
        if bundle.name.trim().is_empty() {
            return Err(Error::InvalidInput("artifact name is empty".to_string()));
        }
        // The name becomes a directory under the run's workspace and the store.
        if bundle.name.starts_with('.') || bundle.name.contains(['/', '\\']) {
            return Err(Error::InvalidInput(format!(
                "artifact name '{}' is not a valid file name",
                bundle.name
            )));
        }
        if !self.names.insert(bundle.name.clone()) {
            return Err(Error::Conflict(format!(
                "artifact '{}' already exists in this run",
                bundle.name
            )));
        }
        Ok(())
    }
}

/// Key for storing/retrieving an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub run_id: RunId,
    pub name: String,
}

/// Reference to a published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: ArtifactKey,
    /// Storage location (backend-specific).
    pub location: String,
    /// sha256 over the sorted file names and contents.
    pub checksum: String,
    /// File names relative to the bundle root, sorted.
    pub files: Vec<String>,
    /// Size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Publish the contents of `dir` under `name` for a run.
    async fn publish(&self, run_id: &RunId, name: &str, dir: &Path) -> Result<ArtifactRef>;

    /// List artifacts published for a run.
    async fn list(&self, run_id: &RunId) -> Result<Vec<ArtifactRef>>;

    /// Copy a published artifact into `dest`.
    async fn fetch(&self, reference: &ArtifactRef, dest: &Path) -> Result<Vec<PathBuf>>;
}
