//! Images and the transient containers used to read them.

use serde::{Deserialize, Serialize};

use crate::recipe::BuildRecipe;
use crate::{Error, Result, RunId};

const MAX_TAG_LEN: usize = 128;

/// Tag of a built image: `[namespace/]name:build_identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageTag {
    pub registry_namespace: Option<String>,
    pub image_name: String,
    pub build_identifier: String,
}

impl ImageTag {
    pub fn new(
        registry_namespace: Option<String>,
        image_name: impl Into<String>,
        build_identifier: impl Into<String>,
    ) -> Result<Self> {
        let tag = Self {
            registry_namespace,
            image_name: image_name.into().to_ascii_lowercase(),
            build_identifier: build_identifier.into(),
        };
        tag.validate()?;
        Ok(tag)
    }

    /// Tag for the image a run builds from `recipe`. The run id is the build identifier.
    pub fn for_run(namespace: Option<&str>, recipe: &BuildRecipe, run_id: &RunId) -> Result<Self> {
        Self::new(
            namespace.map(|n| n.to_ascii_lowercase()),
            &recipe.name,
            run_id.as_str(),
        )
    }

    /// Repository part without the tag.
    pub fn repository(&self) -> String {
        match &self.registry_namespace {
            Some(ns) => format!("{}/{}", ns, self.image_name),
            None => self.image_name.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        let id = &self.build_identifier;
        if id.is_empty()
            || id.len() > MAX_TAG_LEN
            || id.starts_with(['.', '-'])
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        {
            return Err(Error::InvalidInput(format!("invalid image tag '{}'", id)));
        }
        if !is_valid_name_component(&self.image_name) {
            return Err(Error::InvalidInput(format!(
                "invalid image name '{}'",
                self.image_name
            )));
        }
        if let Some(ns) = &self.registry_namespace {
            if !ns.split('/').all(is_valid_name_component) {
                return Err(Error::InvalidInput(format!(
                    "invalid registry namespace '{}'",
                    ns
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ImageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository(), self.build_identifier)
    }
}

/// One `/`-separated component of an image repository.
pub(crate) fn is_valid_name_component(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' || c == '.'
        })
}

/// An immutable image produced by applying a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub tag: ImageTag,
    /// Content address reported by the engine (e.g. "sha256:…").
    pub id: String,
}

/// A created-but-never-started container, used only to read files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientContainer {
    pub name: String,
    pub image: ImageTag,
}

impl TransientContainer {
    /// Container name used for artifact extraction in a run.
    pub fn extraction_name(run_id: &RunId) -> String {
        format!("kiln-extract-{}", run_id)
    }
}
