// Docker CLI backend: drives the `docker` binary through the process
// invoker. Daemon-unavailable failures are classified transient so the
// caller's single retry has a chance once the engine is up.

use std::path::Path;

use async_trait::async_trait;
use gale_common::process_invoker::{OutputSender, ProcessInvoker};
use tokio_util::sync::CancellationToken;

use crate::container::backend::{ContainerBackend, ContainerSpec, ExecSpec};
use crate::errors::BackendError;

/// Runs containers via the Docker command-line client.
pub struct DockerCliBackend {
    docker_path: String,
}

impl DockerCliBackend {
    pub fn new() -> Self {
        Self {
            docker_path: "docker".to_string(),
        }
    }

    pub fn with_path(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
        }
    }

    /// Run a docker command, capturing stdout. Non-zero exit becomes a
    /// `BackendError` with transiency sniffed from the output.
    async fn run_docker(
        &self,
        args: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<String, BackendError> {
        let (exit_code, output) =
            ProcessInvoker::execute_captured(None, &self.docker_path, &args, None, cancel)
                .await
                .map_err(map_invoke_error)?;

        if exit_code != 0 {
            let message = format!(
                "docker {} exited with code {}: {}",
                args.first().map(String::as_str).unwrap_or(""),
                exit_code,
                output
            );
            return Err(classify(message));
        }
        Ok(output)
    }

    fn creation_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = Vec::new();
        if !spec.name.is_empty() {
            args.push("--name".to_string());
            args.push(spec.name.clone());
        }
        if let Some(network) = &spec.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(alias) = &spec.network_alias {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".to_string());
            args.push(entrypoint.clone());
        }
        if let Some(workdir) = &spec.working_directory {
            args.push("--workdir".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for volume in &spec.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        if let Some(options) = &spec.options {
            args.extend(options.split_whitespace().map(String::from));
        }
        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());
        args
    }
}

impl Default for DockerCliBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerBackend for DockerCliBackend {
    fn name(&self) -> &str {
        "docker"
    }

    async fn pull_image(
        &self,
        image: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        tracing::info!(target: "docker", "pulling image '{}'", image);
        self.run_docker(vec!["pull".to_string(), image.to_string()], cancel)
            .await?;
        Ok(())
    }

    async fn image_exists(
        &self,
        image: &str,
        cancel: CancellationToken,
    ) -> Result<bool, BackendError> {
        let args = vec![
            "image".to_string(),
            "inspect".to_string(),
            image.to_string(),
        ];
        let (exit_code, _) =
            ProcessInvoker::execute_captured(None, &self.docker_path, &args, None, cancel)
                .await
                .map_err(map_invoke_error)?;
        Ok(exit_code == 0)
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        tracing::info!(target: "docker", "building image '{}' from {}", tag, context_dir.display());
        self.run_docker(
            vec![
                "build".to_string(),
                "-t".to_string(),
                tag.to_string(),
                context_dir.display().to_string(),
            ],
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn create(
        &self,
        spec: &ContainerSpec,
        cancel: CancellationToken,
    ) -> Result<String, BackendError> {
        let mut args = vec!["create".to_string()];
        args.extend(Self::creation_args(spec));
        let output = self.run_docker(args, cancel).await?;
        let id = output
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();
        if id.is_empty() {
            return Err(BackendError::Permanent(
                "docker create returned no container id".to_string(),
            ));
        }
        tracing::debug!(target: "docker", "created container {} ({})", id, spec.image);
        Ok(id)
    }

    async fn start(&self, id: &str, cancel: CancellationToken) -> Result<(), BackendError> {
        self.run_docker(vec!["start".to_string(), id.to_string()], cancel)
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        spec: ExecSpec,
        output: OutputSender,
        cancel: CancellationToken,
    ) -> Result<i32, BackendError> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(workdir) = &spec.working_directory {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        args.push(id.to_string());
        args.extend(spec.command.iter().cloned());

        ProcessInvoker::execute(None, &self.docker_path, &args, None, output, cancel)
            .await
            .map_err(map_invoke_error)
    }

    async fn run_container(
        &self,
        spec: &ContainerSpec,
        output: OutputSender,
        cancel: CancellationToken,
    ) -> Result<i32, BackendError> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        args.extend(Self::creation_args(spec));
        ProcessInvoker::execute(None, &self.docker_path, &args, None, output, cancel)
            .await
            .map_err(map_invoke_error)
    }

    async fn copy_dir_in(
        &self,
        id: &str,
        source: &Path,
        destination: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        // Trailing `/.` copies directory contents, not the directory itself.
        let source_arg = format!("{}/.", source.display());
        self.run_docker(
            vec![
                "cp".to_string(),
                source_arg,
                format!("{}:{}", id, destination),
            ],
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &str, cancel: CancellationToken) -> Result<(), BackendError> {
        self.run_docker(
            vec!["rm".to_string(), "--force".to_string(), id.to_string()],
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn create_network(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        self.run_docker(
            vec![
                "network".to_string(),
                "create".to_string(),
                name.to_string(),
            ],
            cancel,
        )
        .await?;
        Ok(())
    }

    async fn remove_network(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        self.run_docker(
            vec!["network".to_string(), "rm".to_string(), name.to_string()],
            cancel,
        )
        .await?;
        Ok(())
    }
}

/// Classify a docker failure message: daemon-unavailable markers are
/// transient, everything else permanent.
fn classify(message: String) -> BackendError {
    const TRANSIENT_MARKERS: &[&str] = &[
        "Cannot connect to the Docker daemon",
        "connection refused",
        "dial unix",
        "i/o timeout",
        "is the docker daemon running",
    ];
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS
        .iter()
        .any(|marker| lower.contains(&marker.to_lowercase()))
    {
        BackendError::Transient(message)
    } else {
        BackendError::Permanent(message)
    }
}

fn map_invoke_error(err: anyhow::Error) -> BackendError {
    if gale_common::executor::is_cancellation(&err) {
        BackendError::Cancelled
    } else {
        BackendError::Permanent(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_creation_args_shape() {
        let mut env = HashMap::new();
        env.insert("KEY".to_string(), "value".to_string());
        let spec = ContainerSpec {
            name: "gale-job".to_string(),
            image: "node:16-buster-slim".to_string(),
            env,
            volumes: vec!["/host:/ctr".to_string()],
            ports: vec!["8080:80".to_string()],
            entrypoint: Some("tail".to_string()),
            cmd: vec!["-f".to_string(), "/dev/null".to_string()],
            network: Some("gale-net".to_string()),
            network_alias: Some("job".to_string()),
            options: Some("--privileged".to_string()),
            working_directory: Some("/github/workspace".to_string()),
        };

        let args = DockerCliBackend::creation_args(&spec);
        let joined = args.join(" ");
        assert!(joined.contains("--name gale-job"));
        assert!(joined.contains("--network gale-net"));
        assert!(joined.contains("--network-alias job"));
        assert!(joined.contains("--entrypoint tail"));
        assert!(joined.contains("--workdir /github/workspace"));
        assert!(joined.contains("-e KEY=value"));
        assert!(joined.contains("-v /host:/ctr"));
        assert!(joined.contains("-p 8080:80"));
        assert!(joined.contains("--privileged"));
        // Image comes before the command tail.
        let image_pos = args.iter().position(|a| a == "node:16-buster-slim").unwrap();
        assert_eq!(&args[image_pos + 1..], ["-f", "/dev/null"]);
    }

    #[test]
    fn test_classify_transient() {
        assert!(classify("Cannot connect to the Docker daemon at unix:///var/run/docker.sock".to_string())
            .is_transient());
        assert!(classify("dial unix /var/run/docker.sock: connection refused".to_string())
            .is_transient());
        assert!(!classify("No such image: ghost:latest".to_string()).is_transient());
    }
}
