//! Recipe to Dockerfile translation.
//!
//! Instruction order matters for caching and for failure classification:
//! base image and environment, then system packages, then the dependency
//! manifest, and only then the source tree and the packaging commands.

use kiln_core::engine::BuildContext;
use kiln_core::recipe::BuildRecipe;
use std::collections::HashMap;
use std::path::Path;

/// Where the dependency manifest is copied before the source tree.
const MANIFEST_DIR: &str = "/tmp/kiln";

/// Paths left out of the build context. `.git` stays in when a recipe
/// command runs git inside the image.
const DEFAULT_EXCLUDES: [&str; 2] = [".git", "target"];

/// A rendered Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedRecipe {
    pub dockerfile: String,
    /// Instructions that belong to the recipe phase (see [`BuildContext::recipe_steps`]).
    pub recipe_steps: usize,
}

/// Render `recipe` into a Dockerfile.
pub fn render_dockerfile(recipe: &BuildRecipe) -> RenderedRecipe {
    let mut lines: Vec<String> = Vec::new();

    lines.push(format!("FROM {}", recipe.base_image));

    for (key, _) in &recipe.build_args {
        lines.push(format!("ARG {}", key));
    }

    for (key, value) in &recipe.env {
        lines.push(format!("ENV {}={}", key, quote(value)));
    }

    if !recipe.system_packages.is_empty() {
        lines.push(format!(
            "RUN apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
            recipe.system_packages.join(" ")
        ));
    }

    if let Some(manifest) = &recipe.manifest {
        let file_name = manifest
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "requirements.txt".to_string());
        let in_image = format!("{}/{}", MANIFEST_DIR, file_name);
        lines.push(format!("COPY {} {}", to_context_path(manifest), in_image));
        lines.push(format!("RUN {} {}", recipe.installer, in_image));
    }

    let recipe_steps = lines.len();

    lines.push(format!("COPY . {}", recipe.workdir));
    lines.push(format!("WORKDIR {}", recipe.workdir));

    for command in recipe.prepare_commands.iter().chain(&recipe.build_commands) {
        lines.push(format!("RUN {}", command));
    }

    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');

    RenderedRecipe {
        dockerfile,
        recipe_steps,
    }
}

/// Build context for `recipe`, rooted at `source_root`. Build args without
/// a value are read from the process environment.
pub fn build_context(recipe: &BuildRecipe, source_root: &Path) -> BuildContext {
    let rendered = render_dockerfile(recipe);
    let keep_git = uses_git(recipe);
    BuildContext {
        root: source_root.to_path_buf(),
        dockerfile: rendered.dockerfile,
        recipe_steps: rendered.recipe_steps,
        excludes: DEFAULT_EXCLUDES
            .iter()
            .filter(|ex| !(keep_git && **ex == ".git"))
            .map(|s| s.to_string())
            .collect(),
        build_args: resolve_build_args(recipe, |name| std::env::var(name).ok()),
    }
}

/// Values for the recipe's build args. A pass-through arg whose variable is
/// unset is left out, as `docker build --build-arg NAME` does.
pub fn resolve_build_args(
    recipe: &BuildRecipe,
    lookup: impl Fn(&str) -> Option<String>,
) -> HashMap<String, String> {
    recipe
        .build_args
        .iter()
        .filter_map(|(name, value)| {
            let value = value.clone().or_else(|| lookup(name))?;
            Some((name.clone(), value))
        })
        .collect()
}

/// Whether a prepare or build command invokes `git`.
fn uses_git(recipe: &BuildRecipe) -> bool {
    recipe
        .prepare_commands
        .iter()
        .chain(&recipe.build_commands)
        .any(|command| {
            command
                .split(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '('))
                .any(|word| word == "git")
        })
}

fn to_context_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
