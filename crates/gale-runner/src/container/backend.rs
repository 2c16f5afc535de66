// The ContainerBackend contract: image pull, container create/start/exec,
// working-tree copy, teardown, and per-plan networks. Everything the job
// runtime needs from an engine, nothing more.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use gale_common::process_invoker::OutputSender;
use tokio_util::sync::CancellationToken;

use crate::errors::BackendError;

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    /// `src:dest` mount strings.
    pub volumes: Vec<String>,
    /// `host:container` port strings.
    pub ports: Vec<String>,
    pub entrypoint: Option<String>,
    /// Command arguments (after the entrypoint).
    pub cmd: Vec<String>,
    pub network: Option<String>,
    /// Hostname alias on the network (service key).
    pub network_alias: Option<String>,
    /// Raw extra options appended to creation (`--privileged` etc.).
    pub options: Option<String>,
    pub working_directory: Option<String>,
}

/// One command execution inside a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_directory: Option<String>,
}

/// Abstract container engine operations.
///
/// Implementations stream exec output by line into the provided sender so
/// the step runtime can interpret workflow commands; ordering within a
/// stream is preserved.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &str;

    async fn pull_image(
        &self,
        image: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError>;

    async fn image_exists(
        &self,
        image: &str,
        cancel: CancellationToken,
    ) -> Result<bool, BackendError>;

    /// Build an image from a Dockerfile directory; used by docker actions
    /// that declare `image: Dockerfile`.
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError>;

    /// Create a container; returns its id.
    async fn create(
        &self,
        spec: &ContainerSpec,
        cancel: CancellationToken,
    ) -> Result<String, BackendError>;

    async fn start(&self, id: &str, cancel: CancellationToken) -> Result<(), BackendError>;

    /// Execute a command in a running container; returns the exit code.
    async fn exec(
        &self,
        id: &str,
        spec: ExecSpec,
        output: OutputSender,
        cancel: CancellationToken,
    ) -> Result<i32, BackendError>;

    /// Run a container to completion (create + start + wait + remove);
    /// returns the exit code. Used for docker actions.
    async fn run_container(
        &self,
        spec: &ContainerSpec,
        output: OutputSender,
        cancel: CancellationToken,
    ) -> Result<i32, BackendError>;

    /// Copy the contents of a host directory into the container.
    async fn copy_dir_in(
        &self,
        id: &str,
        source: &Path,
        destination: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError>;

    /// Stop and remove a container.
    async fn remove(&self, id: &str, cancel: CancellationToken) -> Result<(), BackendError>;

    async fn create_network(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError>;

    async fn remove_network(
        &self,
        name: &str,
        cancel: CancellationToken,
    ) -> Result<(), BackendError>;
}
