// Host backend: the ContainerBackend contract realised directly on the
// host. Used for platform labels that map to no image (windows-*/macos-*)
// and for development without a container engine. "Containers" are
// directories; exec spawns processes with an overlaid environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use gale_common::process_invoker::{OutputSender, ProcessInvoker};
use tokio_util::sync::CancellationToken;

use crate::container::backend::{ContainerBackend, ContainerSpec, ExecSpec};
use crate::errors::BackendError;

/// Executes "containers" as plain host processes.
#[derive(Default)]
pub struct HostBackend {
    containers: DashMap<String, HostContainer>,
}

#[derive(Clone)]
struct HostContainer {
    root: PathBuf,
    env: HashMap<String, String>,
    working_directory: Option<String>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn container(&self, id: &str) -> Result<HostContainer, BackendError> {
        self.containers
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BackendError::Permanent(format!("unknown host container '{}'", id)))
    }
}

#[async_trait]
impl ContainerBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    async fn pull_image(
        &self,
        _image: &str,
        _cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn image_exists(
        &self,
        _image: &str,
        _cancel: CancellationToken,
    ) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn build_image(
        &self,
        _context_dir: &Path,
        _tag: &str,
        _cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        Err(BackendError::Permanent(
            "building images requires a container engine".to_string(),
        ))
    }

    async fn create(
        &self,
        spec: &ContainerSpec,
        _cancel: CancellationToken,
    ) -> Result<String, BackendError> {
        let id = format!("host-{}", uuid::Uuid::new_v4().as_simple());
        let root = std::env::temp_dir().join("gale").join(&id);
        std::fs::create_dir_all(&root)
            .map_err(|err| BackendError::Permanent(format!("failed to create {}: {}", root.display(), err)))?;

        self.containers.insert(
            id.clone(),
            HostContainer {
                root,
                env: spec.env.clone(),
                working_directory: spec.working_directory.clone(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str, _cancel: CancellationToken) -> Result<(), BackendError> {
        self.container(id)?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        spec: ExecSpec,
        output: OutputSender,
        cancel: CancellationToken,
    ) -> Result<i32, BackendError> {
        let container = self.container(id)?;
        let mut env = container.env;
        let workdir = container.working_directory;
        for (key, value) in spec.env {
            env.insert(key, value);
        }
        let working_directory = spec
            .working_directory
            .or(workdir)
            .map(PathBuf::from);

        let (program, arguments) = match spec.command.split_first() {
            Some((program, arguments)) => (program.clone(), arguments.to_vec()),
            None => {
                return Err(BackendError::Permanent("empty exec command".to_string()));
            }
        };

        ProcessInvoker::execute(
            working_directory.as_deref(),
            &program,
            &arguments,
            Some(&env),
            output,
            cancel,
        )
        .await
        .map_err(|err| {
            if gale_common::executor::is_cancellation(&err) {
                BackendError::Cancelled
            } else {
                BackendError::Permanent(format!("{:#}", err))
            }
        })
    }

    async fn run_container(
        &self,
        _spec: &ContainerSpec,
        _output: OutputSender,
        _cancel: CancellationToken,
    ) -> Result<i32, BackendError> {
        Err(BackendError::Permanent(
            "docker actions require a container engine".to_string(),
        ))
    }

    async fn copy_dir_in(
        &self,
        id: &str,
        source: &Path,
        destination: &str,
        _cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        let root = self.container(id)?.root;
        let destination = if Path::new(destination).is_absolute() {
            PathBuf::from(destination)
        } else {
            root.join(destination)
        };
        copy_dir_recursive(source, &destination)
            .map_err(|err| BackendError::Permanent(format!("copy failed: {}", err)))
    }

    async fn remove(&self, id: &str, _cancel: CancellationToken) -> Result<(), BackendError> {
        if let Some((_, container)) = self.containers.remove(id) {
            let _ = std::fs::remove_dir_all(&container.root);
        }
        Ok(())
    }

    async fn create_network(
        &self,
        _name: &str,
        _cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn remove_network(
        &self,
        _name: &str,
        _cancel: CancellationToken,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}

fn copy_dir_recursive(source: &Path, destination: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(destination)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn exec_spec(command: &[&str]) -> ExecSpec {
        ExecSpec {
            command: command.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            working_directory: None,
        }
    }

    #[tokio::test]
    async fn test_create_exec_remove() {
        let backend = HostBackend::new();
        let id = backend
            .create(&ContainerSpec::default(), CancellationToken::new())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let code = backend
            .exec(&id, exec_spec(&["echo", "hello"]), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
        let line = rx.recv().await.unwrap();
        assert_eq!(line.data, "hello");

        backend.remove(&id, CancellationToken::new()).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(backend
            .exec(&id, exec_spec(&["true"]), tx, CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_exec_env_layering() {
        let backend = HostBackend::new();
        let mut base_env = HashMap::new();
        base_env.insert("BASE".to_string(), "1".to_string());
        base_env.insert("OVERRIDE".to_string(), "base".to_string());
        let id = backend
            .create(
                &ContainerSpec {
                    env: base_env,
                    ..ContainerSpec::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut step_env = HashMap::new();
        step_env.insert("OVERRIDE".to_string(), "step".to_string());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spec = ExecSpec {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo $BASE/$OVERRIDE".to_string(),
            ],
            env: step_env,
            working_directory: None,
        };
        backend.exec(&id, spec, tx, CancellationToken::new()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().data, "1/step");
        backend.remove(&id, CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_dir_in() {
        let backend = HostBackend::new();
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir(source.path().join("nested")).unwrap();
        std::fs::write(source.path().join("nested/file.txt"), "data").unwrap();

        let id = backend
            .create(&ContainerSpec::default(), CancellationToken::new())
            .await
            .unwrap();
        let dest = std::env::temp_dir().join("gale").join(&id).join("workspace");
        backend
            .copy_dir_in(&id, source.path(), dest.to_str().unwrap(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("nested/file.txt")).unwrap(),
            "data"
        );
        backend.remove(&id, CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_build_image_unsupported() {
        let backend = HostBackend::new();
        assert!(backend
            .build_image(Path::new("/tmp"), "tag", CancellationToken::new())
            .await
            .is_err());
    }
}
