//! CLI command implementations.

pub mod artifacts;
pub mod run;

use anyhow::{Context, Result};
use kiln_config::dockerfile::render_dockerfile;
use kiln_config::{ConfigError, load_pipeline, parse_manifest, parse_recipe};
use kiln_core::pipeline::TestSelection;
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    let spec = load_pipeline(path)
        .with_context(|| format!("Invalid pipeline: {}", path.display()))?;

    let triggers: Vec<String> = spec.triggers.iter().map(|t| format!("{:?}", t)).collect();
    println!("Configuration is valid");
    println!("  pipeline: {}", spec.name);
    println!("  triggers: {}", triggers.join(", "));
    println!(
        "  recipe:   {} ({})",
        spec.recipe.name,
        spec.recipe_path.display()
    );
    println!("  tests:    {}", spec.tests);
    if let Some(artifact) = &spec.artifact {
        println!(
            "  artifact: {} -> {}",
            artifact.name,
            artifact.destination.display()
        );
    }
    Ok(())
}

pub fn render(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
    let recipe = parse_recipe(&content)
        .with_context(|| format!("Failed to parse recipe: {}", path.display()))?;

    print!("{}", render_dockerfile(&recipe).dockerfile);
    Ok(())
}

pub fn plan(path: &Path, tests: Option<TestSelection>) -> Result<()> {
    let mut spec = load_pipeline(path)
        .with_context(|| format!("Invalid pipeline: {}", path.display()))?;
    if let Some(tests) = tests {
        spec.tests = tests;
        spec.validate().map_err(ConfigError::from)?;
    }

    println!("Pipeline '{}' (tests: {})", spec.name, spec.tests);
    for (i, step) in spec.plan().iter().enumerate() {
        println!("  {}. {}", i + 1, step);
    }
    Ok(())
}

pub fn deps(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    let manifest = parse_manifest(&content)
        .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;

    for option in &manifest.options {
        println!("{}", option);
    }
    for dependency in &manifest.dependencies {
        println!("{}", dependency);
    }
    println!("{} dependencies", manifest.len());
    Ok(())
}
