//! Error types for Kiln.
//!
//! Every variant is fatal to the run that raised it. Nothing is retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unreachable base image, unresolvable package, failing install.
    #[error("recipe error: {0}")]
    Recipe(String),

    /// Packaging command failed after dependencies were installed.
    #[error("build failed: {0}")]
    Build(String),

    /// Expected in-image path missing or the transient container could not be created.
    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("{suite} tests failed with exit code {exit_code}")]
    TestFailure { suite: String, exit_code: i64 },

    #[error("checkout failed: {0}")]
    Checkout(String),

    #[error("artifact upload failed: {0}")]
    Upload(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`], used to pick a process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Recipe,
    Build,
    Extraction,
    TestFailure,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Recipe(_) => ErrorKind::Recipe,
            Error::Build(_) => ErrorKind::Build,
            Error::Extraction(_) => ErrorKind::Extraction,
            Error::TestFailure { .. } => ErrorKind::TestFailure,
            _ => ErrorKind::Other,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
