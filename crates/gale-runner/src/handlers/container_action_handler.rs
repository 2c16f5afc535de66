// Handles docker-image steps: `uses: docker://image` and actions with
// `runs.using: docker`. The image runs to completion on the job's network
// with the workspace mounted and inputs projected as INPUT_* variables.

use async_trait::async_trait;
use anyhow::Result;

use crate::action_command_manager::ActionCommandManager;
use crate::config::PullPolicy;
use crate::container::{ContainerBackend, ContainerSpec};
use crate::errors::{BackendError, StepError};
use crate::execution_context::ExecutionContext;
use crate::expressions::interpolate;
use crate::handlers::handler::{
    input_environment, process_output_lines, Handler, HandlerData,
};

pub struct ContainerActionHandler;

impl ContainerActionHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for ContainerActionHandler {
    async fn run(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()> {
        let (backend, network, on_host) = {
            let global = context.global();
            let container = global.container.as_ref().ok_or_else(|| StepError::DockerExec {
                step: data.step_key.clone(),
                message: "no job container allocated".to_string(),
            })?;
            (
                container.backend.clone(),
                global.config.run_id.clone(),
                container.on_host,
            )
        };
        if on_host {
            return Err(StepError::DockerExec {
                step: data.step_key.clone(),
                message: "docker steps are not supported on host platforms".to_string(),
            }
            .into());
        }
        let cancel = context.cancel_token();

        // Resolve the image: a direct docker:// url, a prebuilt image from
        // the manifest, or a Dockerfile build in the action directory.
        let mut entrypoint = None;
        let mut args = Vec::new();
        let mut action_env = std::collections::HashMap::new();
        let mut built_locally = false;

        let image = if let Some(definition) = &data.action.definition {
            let runs = &definition.runs;
            entrypoint = runs.entrypoint.clone();
            for arg in &runs.args {
                let value = interpolate(arg, &data.eval).map_err(|err| StepError::ExpressionEval {
                    step: data.step_key.clone(),
                    message: err.to_string(),
                })?;
                args.push(value);
            }
            for (key, value) in &runs.env {
                let value =
                    interpolate(value, &data.eval).map_err(|err| StepError::ExpressionEval {
                        step: data.step_key.clone(),
                        message: err.to_string(),
                    })?;
                action_env.insert(key.clone(), value);
            }

            let image_ref = runs.image.clone().unwrap_or_default();
            if let Some(image) = image_ref.strip_prefix("docker://") {
                image.to_string()
            } else {
                // A Dockerfile relative to the action directory.
                let action_dir =
                    data.action.directory_host.clone().ok_or_else(|| {
                        StepError::DockerExec {
                            step: data.step_key.clone(),
                            message: "docker action has no resolved directory".to_string(),
                        }
                    })?;
                let tag = format!("gale-action-{}:latest", uuid::Uuid::new_v4().as_simple());
                backend
                    .build_image(&action_dir, &tag, cancel.clone())
                    .await
                    .map_err(|err| StepError::DockerExec {
                        step: data.step_key.clone(),
                        message: err.to_string(),
                    })?;
                built_locally = true;
                tag
            }
        } else {
            // `uses: docker://image`: the reference is the image itself.
            data.action.reference.clone().unwrap_or_default()
        };

        if !built_locally {
            pull_if_needed(context, &backend, &image, &data.step_key).await?;
        }

        // Compose the action container: inputs and step env on top of the
        // job environment, workspace and state mounts, the job network.
        let mut env = context.effective_environment();
        env.extend(action_env);
        env.extend(input_environment(&data.inputs));

        let (workspace_mount, state_mount, workspace_step) = {
            let global = context.global();
            (
                format!(
                    "{}:{}",
                    global.config.workdir.display(),
                    global.workspace_directory
                ),
                format!(
                    "{}:{}",
                    global.config.state_dir.display(),
                    global.state_dir_step
                ),
                global.workspace_directory.clone(),
            )
        };

        let spec = ContainerSpec {
            name: format!("gale-step-{}", uuid::Uuid::new_v4().as_simple()),
            image,
            env,
            volumes: vec![workspace_mount, state_mount],
            entrypoint,
            cmd: args,
            network: Some(network),
            working_directory: Some(workspace_step),
            ..ContainerSpec::default()
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let exit_code = backend.run_container(&spec, tx, cancel).await;

        let mut commands = ActionCommandManager::new();
        process_output_lines(context, &mut commands, &mut rx);

        let exit_code = match exit_code {
            Ok(code) => code,
            Err(BackendError::Cancelled) => {
                return Err(StepError::Cancelled {
                    step: data.step_key.clone(),
                }
                .into())
            }
            Err(err) => {
                return Err(StepError::DockerExec {
                    step: data.step_key.clone(),
                    message: err.to_string(),
                }
                .into())
            }
        };

        if exit_code != 0 {
            return Err(StepError::ScriptExitNonZero {
                step: data.step_key.clone(),
                code: exit_code,
            }
            .into());
        }
        Ok(())
    }
}

/// Pull the image according to the configured policy.
async fn pull_if_needed(
    context: &ExecutionContext,
    backend: &std::sync::Arc<dyn ContainerBackend>,
    image: &str,
    step_key: &str,
) -> Result<()> {
    let policy = context.global().config.pull_policy;
    let cancel = context.cancel_token();
    let pull = match policy {
        PullPolicy::Always => true,
        PullPolicy::Never => false,
        PullPolicy::IfMissing => !backend
            .image_exists(image, cancel.clone())
            .await
            .unwrap_or(false),
    };
    if pull {
        crate::errors::with_transient_retry(|| backend.pull_image(image, cancel.clone()))
            .await
            .map_err(|err| StepError::DockerExec {
                step: step_key.to_string(),
                message: err.to_string(),
            })?;
    }
    Ok(())
}
