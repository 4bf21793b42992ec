//! Backends for Kiln.
//!
//! Provides:
//! - A Docker engine (bollard) for building images, extracting files and running tests
//! - Git and local-tree source providers
//! - A filesystem artifact store

pub mod archive;
pub mod docker;
pub mod git;
pub mod store;

pub use docker::DockerEngine;
pub use git::{GitSource, LocalSource};
pub use kiln_core::engine::{
    BuildContext, ContainerEngine, LogLine, LogSink, LogStream, RunOutcome, RunSpec,
};
pub use store::LocalArtifactStore;
