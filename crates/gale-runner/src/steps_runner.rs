// The step loop: evaluates conditions and guards against a fresh context
// snapshot, executes each step with its timeout, applies file commands, and
// records outcome/conclusion under the continue-on-error policy. Composite
// actions reuse the same loop on a child context.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use gale_common::TaskResult;
use gale_model::workflow::{Step, StepExec};

use crate::action_manager::ActionManager;
use crate::action_manifest::{ActionDefinition, ActionKind};
use crate::errors::StepError;
use crate::execution_context::ExecutionContext;
use crate::expressions::{evaluate_condition, interpolate, interpolate_map, StatusFunctions};
use crate::file_command_manager::FileCommandManager;
use crate::handlers::composite_handler::CompositeActionHandler;
use crate::handlers::container_action_handler::ContainerActionHandler;
use crate::handlers::node_action_handler::NodeActionHandler;
use crate::handlers::script_handler::ScriptHandler;
use crate::handlers::{ActionContext, Handler, HandlerData};

/// Default step timeout when `timeout-minutes` is absent.
const DEFAULT_STEP_TIMEOUT_MINUTES: u64 = 360;

/// Executes a list of steps, in order, against an execution context.
pub struct StepsRunner;

impl StepsRunner {
    /// Run all steps. The context's aggregate result reflects the run;
    /// `Err` is reserved for infrastructure failures, not step failures.
    pub async fn run_steps(context: &mut ExecutionContext, steps: &[Step]) -> Result<()> {
        for (index, step) in steps.iter().enumerate() {
            let step_key = step
                .id
                .clone()
                .unwrap_or_else(|| format!("__step_{}", index));
            let display = step.display_name();
            let cancel = context.cancel_token();

            // Cancellation is terminal: nothing else starts, not even
            // always() steps.
            if cancel.is_cancelled() {
                context.info(&format!("Skipping '{}': run cancelled.", display));
                context.merge_result(TaskResult::Canceled);
                break;
            }

            let status = context.status_functions();
            let eval = context.build_expression_context(status);
            let condition = step.condition.as_deref().unwrap_or("");
            let should_run = match evaluate_condition(condition, &eval) {
                Ok(should_run) => should_run,
                Err(err) => {
                    let error = StepError::ExpressionEval {
                        step: step_key.clone(),
                        message: err.to_string(),
                    };
                    context.error(&error.to_string());
                    let conclusion = if step.continue_on_error {
                        TaskResult::Succeeded
                    } else {
                        TaskResult::Failed
                    };
                    context.steps_context_mut().record(
                        &step_key,
                        TaskResult::Failed,
                        conclusion,
                        HashMap::new(),
                    );
                    context.merge_result(conclusion);
                    continue;
                }
            };

            if !should_run {
                context.info(&format!("Skipping '{}' (condition is false).", display));
                context.steps_context_mut().record(
                    &step_key,
                    TaskResult::Skipped,
                    TaskResult::Skipped,
                    HashMap::new(),
                );
                continue;
            }

            context.section(&display);
            let started = std::time::Instant::now();
            let mut step_context =
                context.create_step_context(step_key.clone(), display.clone());
            FileCommandManager::initialize(&mut step_context);

            let timeout_minutes = step
                .timeout_minutes
                .unwrap_or(DEFAULT_STEP_TIMEOUT_MINUTES);
            let timeout = Duration::from_secs(timeout_minutes * 60);

            let result = {
                let body = execute_step_body(&mut step_context, step, &step_key, status);
                tokio::pin!(body);
                tokio::select! {
                    result = &mut body => result,
                    _ = tokio::time::sleep(timeout) => Err(StepError::Timeout {
                        step: step_key.clone(),
                        minutes: timeout_minutes,
                    }
                    .into()),
                    _ = cancel.cancelled() => Err(StepError::Cancelled {
                        step: step_key.clone(),
                    }
                    .into()),
                }
            };

            // Env-file and output-file contents apply after the step's
            // terminal transition, visible to subsequent steps only.
            FileCommandManager::process(&mut step_context);

            let (outcome, conclusion) = match &result {
                Ok(()) => (TaskResult::Succeeded, TaskResult::Succeeded),
                Err(err) if is_cancellation(err) => (TaskResult::Canceled, TaskResult::Canceled),
                Err(err) => {
                    context.error(&format!("{:#}", err));
                    // Timeouts are hard failures; continue-on-error only
                    // covers ordinary step failures.
                    let conclusion = if step.continue_on_error && !is_timeout(err) {
                        context.info("Step failed, continuing because continue-on-error is set.");
                        TaskResult::Succeeded
                    } else {
                        TaskResult::Failed
                    };
                    (TaskResult::Failed, conclusion)
                }
            };

            context.steps_context_mut().record(
                &step_key,
                outcome,
                conclusion,
                step_context.outputs.clone(),
            );
            for (key, value) in step_context.state.drain() {
                context.state.insert(key, value);
            }
            context.merge_result(conclusion);
            context.end_section();
            context.info(&format!(
                "Finished '{}': outcome={}, conclusion={} ({:.1?})",
                display,
                outcome,
                conclusion,
                started.elapsed()
            ));

            if outcome == TaskResult::Canceled {
                break;
            }
        }
        Ok(())
    }
}

/// Prepare and dispatch one step to its handler: interpolate `env:` and
/// `with:` against the snapshot, resolve the action if any, run.
pub(crate) async fn execute_step_body(
    context: &mut ExecutionContext,
    step: &Step,
    step_key: &str,
    status: StatusFunctions,
) -> Result<()> {
    let expr_err = |err: crate::expressions::EvalError| StepError::ExpressionEval {
        step: step_key.to_string(),
        message: err.to_string(),
    };

    // Step env joins the overlay first so `with:` values can reference it.
    let eval = context.build_expression_context(status);
    let step_env = interpolate_map(&step.env, &eval).map_err(expr_err)?;
    for (key, value) in step_env {
        context.step_environment.insert(key, value);
    }
    let eval = context.build_expression_context(status);
    let mut inputs = interpolate_map(&step.with, &eval).map_err(expr_err)?;

    let (handler, action): (Box<dyn Handler>, ActionContext) = match &step.exec {
        StepExec::Run {
            script,
            shell,
            working_directory,
        } => {
            inputs.insert(
                "script".to_string(),
                interpolate(script, &eval).map_err(expr_err)?,
            );
            if let Some(shell) = shell {
                inputs.insert("shell".to_string(), shell.clone());
            }
            if let Some(dir) = working_directory {
                inputs.insert(
                    "working-directory".to_string(),
                    interpolate(dir, &eval).map_err(expr_err)?,
                );
            }
            (Box::new(ScriptHandler::new()), ActionContext::default())
        }

        StepExec::UsesDockerUrl { image } => {
            let image = interpolate(image, &eval).map_err(expr_err)?;
            context.info(&format!("Using docker image {}", image));
            (
                Box::new(ContainerActionHandler::new()),
                ActionContext {
                    reference: Some(image),
                    ..ActionContext::default()
                },
            )
        }

        StepExec::UsesLocalAction { path } => {
            let (workdir, workspace) = {
                let global = context.global();
                (
                    global.config.workdir.clone(),
                    global.workspace_directory.clone(),
                )
            };
            let directory_host = ActionManager::resolve_local(&workdir, path);
            let relative = path.trim_start_matches("./").trim_start_matches(".\\");
            let directory_step =
                format!("{}/{}", workspace.trim_end_matches('/'), relative);
            let definition = ActionDefinition::load(&directory_host)?;
            resolve_action_handler(
                definition,
                path.clone(),
                directory_host,
                directory_step,
            )?
        }

        StepExec::UsesRemoteAction { reference } => {
            context.info(&format!("Using action {}", reference));
            let (actions, state_dir, state_dir_step) = {
                let global = context.global();
                (
                    global.actions.clone(),
                    global.config.state_dir.clone(),
                    global.state_dir_step.clone(),
                )
            };
            let directory_host = actions
                .resolve_remote(reference, context.cancel_token())
                .await?;
            let relative = directory_host
                .strip_prefix(&state_dir)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| directory_host.to_string_lossy().to_string());
            let directory_step = format!(
                "{}/{}",
                state_dir_step.trim_end_matches('/'),
                relative.trim_start_matches('/')
            );
            let definition = ActionDefinition::load(&directory_host)?;
            resolve_action_handler(
                definition,
                reference.to_string(),
                directory_host,
                directory_step,
            )?
        }
    };

    let data = HandlerData {
        step_key: step_key.to_string(),
        inputs,
        eval,
        action,
    };
    handler.run(context, &data).await
}

/// Pick the handler for a loaded action manifest.
fn resolve_action_handler(
    definition: ActionDefinition,
    reference: String,
    directory_host: std::path::PathBuf,
    directory_step: String,
) -> Result<(Box<dyn Handler>, ActionContext)> {
    let handler: Box<dyn Handler> = match definition.runs.kind()? {
        ActionKind::Node => Box::new(NodeActionHandler::new()),
        ActionKind::Docker => Box::new(ContainerActionHandler::new()),
        ActionKind::Composite => Box::new(CompositeActionHandler::new()),
    };
    Ok((
        handler,
        ActionContext {
            reference: Some(reference),
            directory_host: Some(directory_host),
            directory_step: Some(directory_step),
            definition: Some(definition),
        },
    ))
}

/// Whether the error chain contains a step timeout.
fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StepError>(),
            Some(StepError::Timeout { .. })
        )
    })
}

/// Whether the error chain bottoms out in a cancellation.
fn is_cancellation(err: &anyhow::Error) -> bool {
    if gale_common::executor::is_cancellation(err) {
        return true;
    }
    err.chain().any(|cause| {
        cause
            .downcast_ref::<StepError>()
            .map(StepError::is_cancelled)
            .unwrap_or(false)
    })
}
