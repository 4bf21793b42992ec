//! Kiln CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use kiln_config::ConfigError;
use kiln_core::ErrorKind;
use kiln_core::pipeline::TestSelection;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Build container images from recipes and export their artifacts", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline for one trigger event
    Run(commands::run::RunArgs),
    /// Validate a pipeline and the recipe it names
    Validate {
        /// Path to the pipeline file
        #[arg(default_value = "kiln.kdl")]
        path: PathBuf,
    },
    /// Print the Dockerfile generated from a recipe
    Render {
        /// Path to the recipe file
        #[arg(default_value = "Kilnfile")]
        recipe: PathBuf,
    },
    /// Print the ordered steps a run would execute
    Plan {
        /// Path to the pipeline file
        #[arg(default_value = "kiln.kdl")]
        path: PathBuf,
        /// Override the pipeline's test selection
        #[arg(long)]
        tests: Option<TestSelection>,
    },
    /// Inspect and retrieve published artifact bundles
    #[command(subcommand)]
    Artifacts(commands::artifacts::ArtifactsCommand),
    /// Print a parsed dependency manifest
    Deps {
        /// Path to the manifest
        #[arg(default_value = "requirements.txt")]
        manifest: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Process exit code for a failed command.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(config) = cause.downcast_ref::<ConfigError>() {
            return match config {
                ConfigError::Invalid(e) if e.kind() == ErrorKind::Recipe => 3,
                _ => 2,
            };
        }
        if let Some(e) = cause.downcast_ref::<kiln_core::Error>() {
            return match e.kind() {
                ErrorKind::Recipe | ErrorKind::Build => 3,
                ErrorKind::Extraction => 4,
                ErrorKind::TestFailure => 5,
                ErrorKind::Other => 1,
            };
        }
    }
    1
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = match cli.command {
        Commands::Run(args) => commands::run::run(args).await,
        Commands::Validate { path } => commands::validate(&path),
        Commands::Render { recipe } => commands::render(&recipe),
        Commands::Plan { path, tests } => commands::plan(&path, tests),
        Commands::Deps { manifest } => commands::deps(&manifest),
        Commands::Artifacts(command) => commands::artifacts::run(command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exit_codes_follow_error_kind() {
        let cases = [
            (kiln_core::Error::Recipe("x".into()), 3),
            (kiln_core::Error::Build("x".into()), 3),
            (kiln_core::Error::Extraction("x".into()), 4),
            (
                kiln_core::Error::TestFailure {
                    suite: "dynamic".into(),
                    exit_code: 1,
                },
                5,
            ),
            (kiln_core::Error::Timeout("x".into()), 1),
        ];
        for (error, code) in cases {
            let err = anyhow::Error::new(error);
            assert_eq!(exit_code(&err), code);
        }
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        let err: anyhow::Result<()> =
            Err(kiln_core::Error::Extraction("missing".into())).context("run failed");
        assert_eq!(exit_code(&err.unwrap_err()), 4);
    }

    #[test]
    fn test_config_errors_exit_with_two() {
        let err = anyhow::Error::new(ConfigError::MissingField("recipe".into()));
        assert_eq!(exit_code(&err), 2);

        let err = anyhow::Error::new(ConfigError::Invalid(kiln_core::Error::Recipe(
            "bad base image".into(),
        )));
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn test_run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "kiln",
            "run",
            "--pipeline",
            "ci/kiln.kdl",
            "--event",
            "pull_request",
            "--pr",
            "42",
            "--sha",
            "0123456789abcdef",
            "--tests",
            "all",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.pipeline, PathBuf::from("ci/kiln.kdl"));
                assert_eq!(args.pr, Some(42));
                assert_eq!(args.tests, Some(TestSelection::All));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_artifacts_arguments_parse() {
        let cli = Cli::try_parse_from([
            "kiln",
            "artifacts",
            "fetch",
            "--run",
            "0123456789ab-1a2b3c4d",
            "wheel-0123456",
            "out",
        ])
        .unwrap();
        match cli.command {
            Commands::Artifacts(commands::artifacts::ArtifactsCommand::Fetch {
                run,
                name,
                dest,
                store,
            }) => {
                assert_eq!(run.as_str(), "0123456789ab-1a2b3c4d");
                assert_eq!(run.revision(), "0123456789ab");
                assert_eq!(name, "wheel-0123456");
                assert_eq!(dest, PathBuf::from("out"));
                assert_eq!(store, PathBuf::from(".kiln/artifacts"));
            }
            _ => panic!("expected artifacts fetch command"),
        }
    }

    #[test]
    fn test_artifacts_rejects_malformed_run_id() {
        assert!(
            Cli::try_parse_from(["kiln", "artifacts", "list", "--run", "not a run"]).is_err()
        );
    }
}
