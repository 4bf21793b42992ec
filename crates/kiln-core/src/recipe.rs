//! Build recipes: what goes into an image and in which order.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;

use crate::image::is_valid_name_component;
use crate::{Error, Result};

/// `repo[/path][:tag][@digest]`, repository path lowercase.
static IMAGE_REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9.-]+(?::[0-9]+)?/)?[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*(?::[A-Za-z0-9_][A-Za-z0-9_.-]{0,127})?(?:@sha256:[a-f0-9]{64})?$",
    )
    .unwrap()
});

/// Debian package names plus an optional `=version` pin.
static PACKAGE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9+.-]*(?:=[A-Za-z0-9.+:~_-]+)?$").unwrap());

/// Installs a requirements-style manifest.
pub const DEFAULT_INSTALLER: &str = "python3 -m pip install --no-cache-dir -r";

/// Declarative description of how to produce an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecipe {
    /// Recipe name; also the default image name.
    pub name: String,
    /// Base OS image reference (e.g. "ubuntu:20.04").
    pub base_image: String,
    /// OS packages, installed verbatim and in order.
    pub system_packages: Vec<String>,
    /// Dependency manifest, relative to `source_root`.
    pub manifest: Option<PathBuf>,
    /// Installer invoked with the manifest path appended.
    pub installer: String,
    /// Host directory copied into the image.
    pub source_root: PathBuf,
    /// Where the source tree lives inside the image.
    pub workdir: String,
    /// Commands run after the source is copied, before the build commands.
    pub prepare_commands: Vec<String>,
    /// Packaging commands, executed strictly in order.
    pub build_commands: Vec<String>,
    /// In-image directory the packaging step writes to.
    pub output_dir: String,
    /// Environment set for every later instruction.
    pub env: Vec<(String, String)>,
    /// Build arguments forwarded to the engine. `None` takes the value from
    /// the runner's environment when the build starts.
    pub build_args: Vec<(String, Option<String>)>,
}

impl BuildRecipe {
    pub fn new(name: impl Into<String>, base_image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_image: base_image.into(),
            system_packages: Vec::new(),
            manifest: None,
            installer: DEFAULT_INSTALLER.to_string(),
            source_root: PathBuf::from("."),
            workdir: "/source".to_string(),
            prepare_commands: Vec::new(),
            build_commands: Vec::new(),
            output_dir: "/source/dist".to_string(),
            env: Vec::new(),
            build_args: Vec::new(),
        }
    }

    /// Add a package, keeping first-seen order and dropping duplicates.
    pub fn add_package(&mut self, package: impl Into<String>) {
        let package = package.into();
        if !self.system_packages.contains(&package) {
            self.system_packages.push(package);
        }
    }

    /// Absolute path of the packaging output inside the image.
    ///
    /// A relative `output_dir` is taken relative to `workdir`.
    pub fn output_path(&self) -> String {
        if self.output_dir.starts_with('/') {
            self.output_dir.clone()
        } else {
            format!(
                "{}/{}",
                self.workdir.trim_end_matches('/'),
                self.output_dir.trim_start_matches("./")
            )
        }
    }

    /// Check the recipe before anything is sent to the engine.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Recipe("recipe name is empty".to_string()));
        }
        if !is_valid_name_component(&self.name.to_ascii_lowercase()) {
            return Err(Error::Recipe(format!(
                "recipe name '{}' is not a valid image name",
                self.name
            )));
        }
        if !is_valid_image_reference(&self.base_image) {
            return Err(Error::Recipe(format!(
                "invalid base image reference '{}'",
                self.base_image
            )));
        }
        for package in &self.system_packages {
            if !PACKAGE_REGEX.is_match(package) {
                return Err(Error::Recipe(format!("invalid package name '{}'", package)));
            }
        }
        if !self.workdir.starts_with('/') {
            return Err(Error::Recipe(format!(
                "workdir '{}' must be absolute",
                self.workdir
            )));
        }
        if self.build_commands.iter().all(|c| c.trim().is_empty()) {
            return Err(Error::Recipe(
                "recipe has no packaging command".to_string(),
            ));
        }
        if self.output_dir.trim().is_empty() {
            return Err(Error::Recipe("output directory is empty".to_string()));
        }
        if let Some(manifest) = &self.manifest {
            if self.installer.trim().is_empty() {
                return Err(Error::Recipe(
                    "a manifest is set but the installer is empty".to_string(),
                ));
            }
            if manifest.is_absolute() {
                return Err(Error::Recipe(format!(
                    "manifest '{}' must be relative to the source root",
                    manifest.display()
                )));
            }
        }
        Ok(())
    }
}

/// Whether `reference` looks like a pullable image reference.
pub fn is_valid_image_reference(reference: &str) -> bool {
    !reference.is_empty() && IMAGE_REF_REGEX.is_match(reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_recipe() -> BuildRecipe {
        let mut recipe = BuildRecipe::new("opensfm", "ubuntu:jammy");
        recipe.add_package("build-essential");
        recipe.add_package("cmake");
        recipe.add_package("git");
        recipe.build_commands.push("python3 setup.py bdist_wheel".to_string());
        recipe
    }

    #[test]
    fn test_valid_recipe() {
        assert!(make_recipe().validate().is_ok());
    }

    #[test]
    fn test_packages_deduplicated_in_order() {
        let mut recipe = make_recipe();
        recipe.add_package("cmake");
        recipe.add_package("libeigen3-dev");
        assert_eq!(
            recipe.system_packages,
            vec!["build-essential", "cmake", "git", "libeigen3-dev"]
        );
    }

    #[test]
    fn test_image_references() {
        assert!(is_valid_image_reference("ubuntu:20.04"));
        assert!(is_valid_image_reference("ubuntu"));
        assert!(is_valid_image_reference("ghcr.io/org/image:v1.2"));
        assert!(is_valid_image_reference("localhost:5000/base"));
        assert!(!is_valid_image_reference(""));
        assert!(!is_valid_image_reference("Ubuntu:20.04"));
        assert!(!is_valid_image_reference("ubuntu 20.04"));
    }

    #[test]
    fn test_bad_base_image_is_recipe_error() {
        let mut recipe = make_recipe();
        recipe.base_image = "not a ref".to_string();
        assert!(matches!(recipe.validate(), Err(Error::Recipe(_))));
    }

    #[test]
    fn test_bad_package_name() {
        let mut recipe = make_recipe();
        recipe.add_package("cmake; rm -rf /");
        assert!(matches!(recipe.validate(), Err(Error::Recipe(_))));
    }

    #[test]
    fn test_pinned_package_is_valid() {
        let mut recipe = make_recipe();
        recipe.add_package("libceres-dev=2.0.0+dfsg1-5");
        assert!(recipe.validate().is_ok());
    }

    #[test]
    fn test_name_must_be_an_image_name() {
        let mut recipe = make_recipe();
        recipe.name = "my pkg".to_string();
        assert!(matches!(recipe.validate(), Err(Error::Recipe(_))));

        recipe.name = "OpenSfM".to_string();
        assert!(recipe.validate().is_ok());
    }

    #[test]
    fn test_missing_build_command() {
        let mut recipe = make_recipe();
        recipe.build_commands.clear();
        assert!(matches!(recipe.validate(), Err(Error::Recipe(_))));
    }

    #[test]
    fn test_output_path_relative_to_workdir() {
        let mut recipe = make_recipe();
        recipe.workdir = "/source/OpenSfM/".to_string();
        recipe.output_dir = "./dist".to_string();
        assert_eq!(recipe.output_path(), "/source/OpenSfM/dist");

        recipe.output_dir = "/wheels".to_string();
        assert_eq!(recipe.output_path(), "/wheels");
    }
}
