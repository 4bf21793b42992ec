//! Run identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

const REVISION_PREFIX_LEN: usize = 12;
const SUFFIX_LEN: usize = 8;

/// Identifier of a single pipeline run.
///
/// Built from the triggering revision plus a per-run suffix, e.g.
/// `3f2a9c0d1e4b-0192f3a1`. It is used verbatim as the image tag and in
/// container names, so two runs of the same commit never share either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct RunId(String);

impl RunId {
    /// Derive a run id from a commit SHA.
    pub fn from_revision(sha: &str) -> Result<Self> {
        let revision: String = sha
            .trim()
            .chars()
            .take(REVISION_PREFIX_LEN)
            .collect::<String>()
            .to_ascii_lowercase();
        if revision.is_empty() || !revision.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!(
                "revision '{}' is not a hex commit sha",
                sha
            )));
        }
        // The leading bits of a v7 uuid are a timestamp; take the random tail.
        let uuid = Uuid::now_v7().simple().to_string();
        let suffix = &uuid[uuid.len() - SUFFIX_LEN..];
        Ok(Self(format!("{}-{}", revision, suffix)))
    }

    /// The revision part of the id.
    pub fn revision(&self) -> &str {
        self.0.split('-').next().unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let valid = match s.split_once('-') {
            Some((rev, suffix)) => {
                !rev.is_empty()
                    && !suffix.is_empty()
                    && rev.chars().all(|c| c.is_ascii_hexdigit())
                    && suffix.chars().all(|c| c.is_ascii_alphanumeric())
            }
            None => false,
        };
        if !valid {
            return Err(Error::InvalidInput(format!("invalid run id: {}", s)));
        }
        Ok(Self(s.to_string()))
    }
}
