//! Source checkout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::pipeline::{CheckoutSpec, TriggerEvent};
use crate::Result;

/// A materialized source tree at the triggering revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTree {
    pub root: PathBuf,
    /// Commit the tree is checked out at.
    pub sha: String,
}

/// Trait for anything that can materialize a source tree.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Materialize the tree for `event` (including submodules when asked) under `dest`.
    async fn checkout(
        &self,
        event: &TriggerEvent,
        spec: &CheckoutSpec,
        dest: &Path,
    ) -> Result<SourceTree>;
}
