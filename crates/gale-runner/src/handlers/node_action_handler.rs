// Handles JavaScript actions (`runs.using: node*`): executes the entry
// point with node inside the job container, with inputs projected as
// INPUT_* variables.

use async_trait::async_trait;
use anyhow::Result;

use crate::action_command_manager::ActionCommandManager;
use crate::container::{ContainerBackend as _, ExecSpec};
use crate::errors::{BackendError, StepError};
use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{
    input_environment, process_output_lines, Handler, HandlerData,
};

pub struct NodeActionHandler;

impl NodeActionHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for NodeActionHandler {
    async fn run(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()> {
        let definition = data.action.definition.as_ref().ok_or_else(|| {
            StepError::DockerExec {
                step: data.step_key.clone(),
                message: "node action has no manifest".to_string(),
            }
        })?;
        let main = definition.runs.main.clone().ok_or_else(|| {
            StepError::DockerExec {
                step: data.step_key.clone(),
                message: format!("action '{}' declares no 'main' entry point", definition.name),
            }
        })?;
        let action_dir = data.action.directory_step.clone().ok_or_else(|| {
            StepError::DockerExec {
                step: data.step_key.clone(),
                message: "node action has no resolved directory".to_string(),
            }
        })?;

        // Default inputs fill the gaps the step's `with:` leaves.
        let mut inputs = data.inputs.clone();
        for (name, input) in &definition.inputs {
            if !inputs.contains_key(name) {
                if let Some(default) = &input.default {
                    let value = crate::expressions::interpolate(default, &data.eval)
                        .map_err(|err| StepError::ExpressionEval {
                            step: data.step_key.clone(),
                            message: err.to_string(),
                        })?;
                    inputs.insert(name.clone(), value);
                }
            }
        }

        let mut env = context.effective_environment();
        env.extend(input_environment(&inputs));

        let (backend, container_id, workspace) = {
            let global = context.global();
            let container = global.container.as_ref().ok_or_else(|| {
                StepError::DockerExec {
                    step: data.step_key.clone(),
                    message: "no job container allocated".to_string(),
                }
            })?;
            (
                container.backend.clone(),
                container.id.clone(),
                global.workspace_directory.clone(),
            )
        };

        let exec = ExecSpec {
            command: vec![
                "node".to_string(),
                format!("{}/{}", action_dir.trim_end_matches('/'), main),
            ],
            env,
            working_directory: Some(workspace),
        };

        context.debug(&format!("Running node action entry {}", main));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let exit_code = backend
            .exec(&container_id, exec, tx, context.cancel_token())
            .await;

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
