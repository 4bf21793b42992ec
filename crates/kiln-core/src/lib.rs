//! Core domain types and traits for Kiln.
//!
//! This crate contains:
//! - Run identifiers and the error taxonomy
//! - Build recipes and dependency manifests
//! - Images, tags and transient containers
//! - Pipeline definitions and the run state machine
//! - Engine, source and artifact store traits

pub mod artifact;
pub mod engine;
pub mod error;
pub mod id;
pub mod image;
pub mod manifest;
pub mod pipeline;
pub mod recipe;
pub mod source;

pub use error::{Error, ErrorKind, Result};
pub use id::RunId;
