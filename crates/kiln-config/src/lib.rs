//! KDL configuration parsing for Kiln.
//!
//! This crate handles:
//! - Recipe files (base image, packages, manifest, packaging commands)
//! - Pipeline files (triggers, tests, artifact export)
//! - Rendering a recipe into a Dockerfile
//! - Variable interpolation

pub mod dockerfile;
pub mod error;
mod kdl_util;
pub mod pipeline;
pub mod recipe;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{load_pipeline, parse_pipeline, PipelineDocument};
pub use recipe::{parse_manifest, parse_recipe};
pub use variables::{GitContext, RunContext, VariableContext};
