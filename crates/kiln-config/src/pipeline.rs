//! Pipeline configuration parsing.

use crate::kdl_util::*;
use crate::recipe::parse_recipe;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use kiln_core::pipeline::{
    ArtifactSpec, CheckoutSpec, PipelineSpec, TestSelection, TriggerKind,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A parsed pipeline file, before its recipe is loaded.
#[derive(Debug, Clone)]
pub struct PipelineDocument {
    pub name: String,
    pub triggers: Vec<TriggerKind>,
    /// Recipe file as written in the pipeline file.
    pub recipe: PathBuf,
    pub checkout: CheckoutSpec,
    pub tests: TestSelection,
    pub compiled_tests: Vec<String>,
    pub dynamic_tests: Vec<String>,
    pub artifact: Option<ArtifactSpec>,
    pub image_namespace: Option<String>,
    pub timeout: Option<Duration>,
}

/// Parse a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDocument> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut triggers = Vec::new();
    let mut recipe = None;
    let mut checkout = CheckoutSpec::default();
    let mut tests = TestSelection::None;
    let mut compiled_tests = Vec::new();
    let mut dynamic_tests = Vec::new();
    let mut artifact: Option<ArtifactSpec> = None;
    let mut image_namespace = None;
    let mut timeout = None;

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = require_string_arg(node, "pipeline name")?;
            }
            "on" => {
                let trigger = parse_trigger(node)?;
                if !triggers.contains(&trigger) {
                    triggers.push(trigger);
                }
            }
            "recipe" => {
                recipe = Some(PathBuf::from(require_string_arg(node, "recipe")?));
            }
            "checkout" => {
                checkout.submodules = get_bool_prop(node, "submodules").unwrap_or(true);
            }
            "tests" => {
                let value = require_string_arg(node, "tests")?;
                tests = value
                    .parse()
                    .map_err(|e: kiln_core::Error| ConfigError::invalid("tests", e.to_string()))?;
            }
            "compiled-tests" => {
                compiled_tests.extend(get_run_children(node));
            }
            "dynamic-tests" => {
                dynamic_tests.extend(get_run_children(node));
            }
            "artifact" => {
                let spec = parse_artifact(node)?;
                if let Some(existing) = &artifact {
                    return Err(ConfigError::Duplicate(format!(
                        "artifact '{}' (already exporting '{}')",
                        spec.name, existing.name
                    )));
                }
                artifact = Some(spec);
            }
            "image" => {
                image_namespace = get_string_prop(node, "namespace");
            }
            "timeout" => {
                let value = require_string_arg(node, "timeout")?;
                timeout = Some(parse_duration(&value)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }
    if triggers.is_empty() {
        return Err(ConfigError::MissingField("on".to_string()));
    }
    let recipe = recipe.ok_or_else(|| ConfigError::MissingField("recipe".to_string()))?;

    Ok(PipelineDocument {
        name,
        triggers,
        recipe,
        checkout,
        tests,
        compiled_tests,
        dynamic_tests,
        artifact,
        image_namespace,
        timeout,
    })
}

/// Load a pipeline file and the recipe it names.
///
/// The recipe path and artifact destination are resolved against the
/// pipeline file's directory. The recipe's source root stays relative to the
/// checked-out tree.
pub fn load_pipeline(path: &Path) -> ConfigResult<PipelineSpec> {
    let content = read(path)?;
    let document = parse_pipeline(&content)?;
    let base_dir = parent_dir(path);

    let recipe_path = base_dir.join(&document.recipe);
    let recipe = parse_recipe(&read(&recipe_path)?)?;

    let artifact = document.artifact.map(|mut a| {
        if a.destination.is_relative() {
            a.destination = base_dir.join(&a.destination);
        }
        a
    });

    let spec = PipelineSpec {
        name: document.name,
        triggers: document.triggers,
        recipe_path,
        recipe,
        checkout: document.checkout,
        tests: document.tests,
        compiled_tests: document.compiled_tests,
        dynamic_tests: document.dynamic_tests,
        artifact,
        image_namespace: document.image_namespace,
        timeout: document.timeout,
    };
    spec.validate()?;
    Ok(spec)
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<TriggerKind> {
    let trigger_type = get_first_string_arg(node).unwrap_or_default();
    trigger_type.parse().map_err(|_| ConfigError::InvalidValue {
        field: "trigger type".to_string(),
        message: format!("unknown trigger type: {}", trigger_type),
    })
}

fn parse_artifact(node: &KdlNode) -> ConfigResult<ArtifactSpec> {
    let name = require_string_arg(node, "artifact name")?;
    let source_path = get_string_prop(node, "path");
    if let Some(path) = &source_path {
        if !path.starts_with('/') {
            return Err(ConfigError::invalid(
                "artifact path",
                format!("'{}' must be an absolute in-image path", path),
            ));
        }
    }
    let destination = get_string_prop(node, "destination")
        .map(PathBuf::from)
        .ok_or_else(|| ConfigError::MissingField(format!("destination for artifact '{}'", name)))?;

    Ok(ArtifactSpec {
        name,
        source_path,
        destination,
    })
}

/// Longest timeout a pipeline may ask for.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Parse durations such as `90s`, `45m`, `6h` or `1h 30m`.
pub fn parse_duration(value: &str) -> ConfigResult<Duration> {
    let duration = humantime::parse_duration(value.trim())
        .map_err(|e| ConfigError::invalid("timeout", format!("'{}': {}", value, e)))?;
    if duration.is_zero() {
        return Err(ConfigError::invalid("timeout", "must be greater than zero"));
    }
    if duration > MAX_TIMEOUT {
        return Err(ConfigError::invalid(
            "timeout",
            format!("'{}' exceeds the {} day limit", value, MAX_TIMEOUT.as_secs() / 86400),
        ));
    }
    Ok(duration)
}

fn read(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
