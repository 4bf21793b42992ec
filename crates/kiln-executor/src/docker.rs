//! Docker engine implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bytes::Bytes;
use futures::StreamExt;
use kiln_core::engine::*;
use kiln_core::image::{Image, ImageTag, TransientContainer};
use kiln_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::archive::{pack_context, unpack_archive};

/// Docker engine backed by the local daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }
}

/// Build step number from a classic-builder line such as `Step 3/9 : RUN …`.
fn parse_step(line: &str) -> Option<usize> {
    let rest = line.trim_start().strip_prefix("Step ")?;
    let (current, _) = rest.split_once('/')?;
    current.trim().parse().ok()
}

/// Classify a build failure: failures in the recipe phase are recipe errors.
fn classify_build_failure(step: Option<usize>, recipe_steps: usize, message: String) -> Error {
    match step {
        Some(n) if n <= recipe_steps => Error::Recipe(message),
        // Nothing ran yet: the base image could not be resolved.
        None => Error::Recipe(message),
        Some(_) => Error::Build(message),
    }
}

async fn send_log(logs: &LogSink, stream: LogStream, content: &str) {
    let content = content.trim_end();
    if content.is_empty() {
        return;
    }
    let _ = logs.send(LogLine::new(stream, content)).await;
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::Internal(format!("Docker is not reachable: {}", e)))
    }

    async fn build_image(
        &self,
        context: &BuildContext,
        tag: &ImageTag,
        logs: &LogSink,
    ) -> Result<Image> {
        let tag_str = tag.to_string();

        let packed = {
            let context = context.clone();
            tokio::task::spawn_blocking(move || pack_context(&context))
                .await
                .map_err(|e| Error::Internal(format!("context packing panicked: {}", e)))??
        };
        info!(tag = %tag_str, context_bytes = packed.len(), "Building image");

        let options = BuildImageOptions {
            dockerfile: DOCKERFILE_NAME.to_string(),
            t: tag_str.clone(),
            rm: true,
            forcerm: true,
            pull: true,
            buildargs: context.build_args.clone(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(packed)));

        let mut current_step = None;
        let mut image_id = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(line) = info.stream.as_deref() {
                        if let Some(step) = parse_step(line) {
                            current_step = Some(step);
                        }
                        debug!(tag = %tag_str, "{}", line.trim_end());
                        send_log(logs, LogStream::Stdout, line).await;
                    }
                    if let Some(status) = info.status.as_deref() {
                        send_log(logs, LogStream::System, status).await;
                    }
                    if let Some(error) = info.error {
                        warn!(tag = %tag_str, step = ?current_step, error = %error, "Build failed");
                        send_log(logs, LogStream::Stderr, &error).await;
                        return Err(classify_build_failure(
                            current_step,
                            context.recipe_steps,
                            error,
                        ));
                    }
                    if let Some(id) = info.aux.and_then(|aux| aux.id) {
                        image_id = Some(id);
                    }
                }
                Err(e) => {
                    warn!(tag = %tag_str, step = ?current_step, error = %e, "Build failed");
                    return Err(classify_build_failure(
                        current_step,
                        context.recipe_steps,
                        e.to_string(),
                    ));
                }
            }
        }

        let id = match image_id {
            Some(id) => id,
            None => self
                .docker
                .inspect_image(&tag_str)
                .await
                .map_err(|e| Error::Build(format!("built image '{}' not found: {}", tag_str, e)))?
                .id
                .unwrap_or_default(),
        };

        info!(tag = %tag_str, id = %id, "Image built");
        Ok(Image {
            tag: tag.clone(),
            id,
        })
    }

    async fn create_container(&self, image: &Image, name: &str) -> Result<TransientContainer> {
        let config = Config {
            image: Some(image.tag.to_string()),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            tty: Some(false),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        info!(container = %name, image = %image.tag, "Creating container");
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::Extraction(format!("Failed to create container: {}", e)))?;

        Ok(TransientContainer {
            name: name.to_string(),
            image: image.tag.clone(),
        })
    }

    async fn copy_from_container(
        &self,
        container: &TransientContainer,
        path: &str,
        dest: &Path,
    ) -> Result<Vec<PathBuf>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        info!(container = %container.name, path = %path, dest = %dest.display(), "Copying from container");
        let mut stream = self
            .docker
            .download_from_container(&container.name, Some(options));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                Error::Extraction(format!("Failed to copy '{}' from container: {}", path, e))
            })?;
            archive.extend_from_slice(&chunk);
        }

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_archive(&archive[..], &dest))
            .await
            .map_err(|e| Error::Internal(format!("unpacking panicked: {}", e)))?
    }

    async fn remove_container(&self, container: &TransientContainer) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(&container.name, Some(options))
            .await
            .map_err(|e| Error::Internal(format!("Failed to remove container: {}", e)))?;

        debug!(container = %container.name, "Container removed");
        Ok(())
    }

    async fn run_in_image(
        &self,
        image: &Image,
        spec: RunSpec,
        logs: &LogSink,
    ) -> Result<RunOutcome> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(image.tag.to_string()),
            cmd: Some(spec.shell_command()),
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig::default()),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        info!(container = %spec.name, image = %image.tag, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create container: {}", e)))?;

        let outcome = self.start_and_wait(&spec.name, logs).await;

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(&spec.name, Some(options))
            .await
        {
            warn!(container = %spec.name, error = %e, "Failed to remove container");
        }

        outcome
    }

    async fn remove_image(&self, image: &Image) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(&image.tag.to_string(), Some(options), None)
            .await
            .map_err(|e| Error::Internal(format!("Failed to remove image: {}", e)))?;
        info!(image = %image.tag, "Image removed");
        Ok(())
    }
}

impl DockerEngine {
    async fn start_and_wait(&self, name: &str, logs: &LogSink) -> Result<RunOutcome> {
        info!(container = %name, "Starting container");
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::Internal(format!("Failed to start container: {}", e)))?;

        let log_options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut log_stream = self.docker.logs(name, Some(log_options));
        while let Some(result) = log_stream.next().await {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    for line in String::from_utf8_lossy(&message).lines() {
                        send_log(logs, stream, line).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    break;
                }
            }
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.docker.wait_container(name, Some(options));
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports non-zero exits as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                return Err(Error::Internal(format!("Failed to wait for container: {}", e)));
            }
            None => {
                return Err(Error::Internal(
                    "container wait stream ended without a status".to_string(),
                ));
            }
        };

        info!(container = %name, exit_code, "Container exited");
        Ok(RunOutcome { exit_code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step() {
        assert_eq!(parse_step("Step 3/9 : RUN apt-get update"), Some(3));
        assert_eq!(parse_step(" Step 12/12 : RUN make"), Some(12));
        assert_eq!(parse_step(" ---> Running in 1234"), None);
        assert_eq!(parse_step("Step x/9"), None);
    }

    #[test]
    fn test_failure_in_package_install_is_recipe_error() {
        let err = classify_build_failure(Some(2), 4, "apt-get returned 100".into());
        assert!(matches!(err, Error::Recipe(_)));
    }

    #[test]
    fn test_failure_before_any_step_is_recipe_error() {
        let err = classify_build_failure(None, 4, "pull access denied".into());
        assert!(matches!(err, Error::Recipe(_)));
    }

    #[test]
    fn test_failure_in_packaging_is_build_error() {
        let err = classify_build_failure(Some(7), 4, "setup.py failed".into());
        assert!(matches!(err, Error::Build(_)));
    }
}

/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use kiln_core::RunId;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn context(dir: &Path, dockerfile: &str, recipe_steps: usize) -> BuildContext {
        BuildContext {
            root: dir.to_path_buf(),
            dockerfile: dockerfile.to_string(),
            recipe_steps,
            excludes: vec![],
            build_args: HashMap::new(),
        }
    }

    fn tag() -> ImageTag {
        let run = RunId::from_revision("0123456789abcdef").unwrap();
        ImageTag::new(None, "kiln-it", run.as_str()).unwrap()
    }

    /// Build, extract and clean up a tiny image.
    #[tokio::test]
    #[ignore]
    async fn test_build_and_extract() {
        let engine = DockerEngine::new().unwrap();
        engine.ping().await.expect("Docker should be running");

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("hello.txt"), "hello").unwrap();
        let dockerfile = "FROM alpine:latest\nCOPY . /src\nRUN mkdir -p /src/dist && cp /src/hello.txt /src/dist/pkg-1.0.whl\n";

        let (tx, mut rx) = mpsc::channel(1024);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let image = engine
            .build_image(&context(src.path(), dockerfile, 1), &tag(), &tx)
            .await
            .expect("Should build image");

        let container = engine
            .create_container(&image, &format!("kiln-it-{}", image.tag.build_identifier))
            .await
            .expect("Should create container");

        let out = tempfile::tempdir().unwrap();
        let files = engine
            .copy_from_container(&container, "/src/dist", &out.path().join("wheel_output"))
            .await
            .expect("Should copy");
        assert_eq!(files, vec![PathBuf::from("pkg-1.0.whl")]);

        engine.remove_container(&container).await.unwrap();
        engine.remove_image(&image).await.unwrap();
        drop(tx);
        let _ = drain.await;
    }

    /// A failing command propagates its exit code.
    #[tokio::test]
    #[ignore]
    async fn test_run_in_image_exit_code() {
        let engine = DockerEngine::new().unwrap();
        let src = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1024);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let image = engine
            .build_image(&context(src.path(), "FROM alpine:latest\n", 1), &tag(), &tx)
            .await
            .unwrap();

        let outcome = engine
            .run_in_image(
                &image,
                RunSpec {
                    name: format!("kiln-it-run-{}", image.tag.build_identifier),
                    commands: vec!["echo hi".into(), "exit 42".into()],
                    working_dir: None,
                    env: HashMap::new(),
                },
                &tx,
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 42);

        engine.remove_image(&image).await.unwrap();
        drop(tx);
        let _ = drain.await;
    }

    /// A package that does not exist fails the recipe phase.
    #[tokio::test]
    #[ignore]
    async fn test_nonexistent_package_is_recipe_error() {
        let engine = DockerEngine::new().unwrap();
        let src = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(1024);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let dockerfile = "FROM ubuntu:jammy\nRUN apt-get update && apt-get install -y kiln-no-such-package\nCOPY . /src\n";
        let result = engine
            .build_image(&context(src.path(), dockerfile, 2), &tag(), &tx)
            .await;
        assert!(matches!(result, Err(Error::Recipe(_))));

        drop(tx);
        let _ = drain.await;
    }
}
