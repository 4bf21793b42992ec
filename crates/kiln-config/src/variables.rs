//! `${...}` interpolation for test commands, artifact names and the image
//! namespace.
//!
//! Known names: `git.sha`, `git.short_sha`, `git.branch`, `git.ref`,
//! `run.id`, `run.trigger`, `run.date`, `pipeline.name`, `recipe.name` and
//! `env.NAME`. Anything else is left as written.

use kiln_core::RunId;
use kiln_core::pipeline::{PipelineSpec, TriggerEvent};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-z_]+)\.([A-Za-z_][A-Za-z0-9_]*)\}").unwrap()
});

/// Revision being built.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    /// Empty for pull requests and detached pushes.
    pub branch: String,
    /// Branch name, or `pr-<number>`.
    pub ref_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub trigger: String,
    /// UTC date the run started, `YYYY-MM-DD`.
    pub date: String,
}

/// Values visible to `${...}` references during one run.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub run: RunContext,
    pub pipeline_name: String,
    pub recipe_name: String,
    pub env: HashMap<String, String>,
}

impl VariableContext {
    pub fn for_run(run_id: &RunId, trigger: &TriggerEvent) -> Self {
        let sha = trigger.revision().to_string();
        let (branch, ref_name, kind) = match trigger {
            TriggerEvent::Push { branch, .. } => {
                let branch = branch.clone().unwrap_or_default();
                (branch.clone(), branch, "push")
            }
            TriggerEvent::PullRequest { number, .. } => {
                (String::new(), format!("pr-{}", number), "pull_request")
            }
        };

        Self {
            git: GitContext {
                short_sha: sha.chars().take(7).collect(),
                sha,
                branch,
                ref_name,
            },
            run: RunContext {
                id: run_id.to_string(),
                trigger: kind.to_string(),
                date: chrono::Utc::now().format("%Y-%m-%d").to_string(),
            },
            ..Default::default()
        }
    }

    /// Take the pipeline and recipe names from `spec`.
    pub fn with_pipeline(mut self, spec: &PipelineSpec) -> Self {
        self.pipeline_name = spec.name.clone();
        self.recipe_name = spec.recipe.name.clone();
        self
    }

    /// Variables reachable as `${env.NAME}`.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn resolve(&self, scope: &str, name: &str) -> Option<&str> {
        let value = match (scope, name) {
            ("git", "sha") => &self.git.sha,
            ("git", "short_sha") => &self.git.short_sha,
            ("git", "branch") => &self.git.branch,
            ("git", "ref") => &self.git.ref_name,
            ("run", "id") => &self.run.id,
            ("run", "trigger") => &self.run.trigger,
            ("run", "date") => &self.run.date,
            ("pipeline", "name") => &self.pipeline_name,
            ("recipe", "name") => &self.recipe_name,
            ("env", key) => return self.env.get(key).map(String::as_str),
            _ => return None,
        };
        Some(value)
    }

    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                match self.resolve(&caps[1], &caps[2]) {
                    Some(value) => value.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::pipeline::{CheckoutSpec, TestSelection, TriggerKind};
    use kiln_core::recipe::BuildRecipe;
    use std::path::PathBuf;

    fn push() -> TriggerEvent {
        TriggerEvent::Push {
            branch: Some("main".to_string()),
            sha: "abc1234567890def".to_string(),
        }
    }

    fn context(trigger: &TriggerEvent) -> (RunId, VariableContext) {
        let run_id = RunId::from_revision(trigger.revision()).unwrap();
        let ctx = VariableContext::for_run(&run_id, trigger);
        (run_id, ctx)
    }

    #[test]
    fn test_push_variables() {
        let (run_id, ctx) = context(&push());

        assert_eq!(
            ctx.interpolate("${git.sha} ${git.short_sha} ${git.branch} ${git.ref}"),
            "abc1234567890def abc1234 main main"
        );
        assert_eq!(ctx.interpolate("${run.id}"), run_id.to_string());
        assert_eq!(ctx.interpolate("${run.trigger}"), "push");
    }

    #[test]
    fn test_pull_request_variables() {
        let event = TriggerEvent::PullRequest {
            number: 42,
            base: Some("main".to_string()),
            head_sha: "fedcba9876543210".to_string(),
        };
        let (_, ctx) = context(&event);

        assert_eq!(ctx.interpolate("${git.ref}"), "pr-42");
        assert_eq!(ctx.interpolate("[${git.branch}]"), "[]");
        assert_eq!(ctx.interpolate("${git.short_sha}"), "fedcba9");
        assert_eq!(ctx.interpolate("${run.trigger}"), "pull_request");
    }

    #[test]
    fn test_pipeline_and_recipe_names() {
        let spec = PipelineSpec {
            name: "opensfm-wheel".to_string(),
            triggers: vec![TriggerKind::Push],
            recipe_path: PathBuf::from("Kilnfile"),
            recipe: BuildRecipe::new("opensfm", "ubuntu:20.04"),
            checkout: CheckoutSpec::default(),
            tests: TestSelection::None,
            compiled_tests: Vec::new(),
            dynamic_tests: Vec::new(),
            artifact: None,
            image_namespace: None,
            timeout: None,
        };
        let (_, ctx) = context(&push());
        let ctx = ctx.with_pipeline(&spec);

        assert_eq!(
            ctx.interpolate("${pipeline.name}/${recipe.name}"),
            "opensfm-wheel/opensfm"
        );
    }

    #[test]
    fn test_env_variables() {
        let (_, ctx) = context(&push());
        let ctx = ctx.with_env(HashMap::from([(
            "PYTHON".to_string(),
            "python3.8".to_string(),
        )]));

        assert_eq!(
            ctx.interpolate("${env.PYTHON} -m pytest"),
            "python3.8 -m pytest"
        );
        assert_eq!(ctx.interpolate("${env.MISSING}"), "${env.MISSING}");
    }

    #[test]
    fn test_unknown_and_shell_variables_preserved() {
        let (_, ctx) = context(&push());
        assert_eq!(ctx.interpolate("${unknown.var}"), "${unknown.var}");
        assert_eq!(ctx.interpolate("echo ${HOME} $PATH"), "echo ${HOME} $PATH");
    }

    #[test]
    fn test_run_date() {
        let (_, ctx) = context(&push());
        let date = ctx.interpolate("${run.date}");
        assert_eq!(date.len(), 10);
        assert_eq!(date.matches('-').count(), 2);
    }

    #[test]
    fn test_interpolate_vec() {
        let (_, ctx) = context(&push());
        let inputs = vec!["echo ${git.branch}".to_string(), "ls".to_string()];
        assert_eq!(ctx.interpolate_vec(&inputs), vec!["echo main", "ls"]);
    }
}
