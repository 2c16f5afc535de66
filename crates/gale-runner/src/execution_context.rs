// ExecutionContext: the central mutable state for a running job. Holds the
// cumulative environment, step outputs and state, the expression contexts,
// logging, and cancellation. Step contexts share the job's Global through
// an Arc and snapshot the rest.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use gale_common::{RunLogger, SecretMasker, TaskResult};
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::action_manager::ActionManager;
use crate::config::RunnerConfig;
use crate::container::ContainerBackend;
use crate::expressions::{EvaluationContext, StatusFunctions};
use crate::github_context::GitHubContext;
use crate::runner_context::RunnerContext;
use crate::steps_context::StepsContext;

/// Default PATH inside job containers when none has been set yet.
const CONTAINER_DEFAULT_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// The job's container, once allocated.
pub struct JobContainer {
    pub backend: Arc<dyn ContainerBackend>,
    pub id: String,
    /// True when the "container" is the host itself.
    pub on_host: bool,
}

/// A started service container.
pub struct ServiceContainer {
    pub name: String,
    pub id: String,
}

/// State shared by every context of one job run.
pub struct Global {
    pub config: Arc<RunnerConfig>,
    pub actions: Arc<ActionManager>,
    /// Cumulative environment: runner-provided, workflow, job, then dynamic
    /// `GITHUB_ENV` additions. Step env layers on top per step.
    pub environment: HashMap<String, String>,
    /// Paths prepended to PATH by `add-path` / `GITHUB_PATH`.
    pub prepend_path: Vec<String>,
    /// The workspace as steps see it.
    pub workspace_directory: String,
    /// Host-side directory holding this run's env files and scripts.
    pub envs_dir_host: PathBuf,
    /// The same directory as steps see it.
    pub envs_dir_step: String,
    /// The invocation state root as steps see it (action cache, event
    /// payload).
    pub state_dir_step: String,
    pub cancel_token: CancellationToken,
    pub write_debug: bool,
    pub job_id: String,
    pub job_display_name: String,
    pub run_key: String,
    pub matrix: Value,
    pub strategy: Value,
    pub needs: Value,
    pub github: GitHubContext,
    pub runner: RunnerContext,
    pub container: Option<JobContainer>,
    pub services: Vec<ServiceContainer>,
    pub default_shell: Option<String>,
    pub default_working_directory: Option<String>,
    pub masker: SecretMasker,
    pub logger: Option<Arc<RunLogger>>,
}

/// Execution context for a job or a single step within it.
pub struct ExecutionContext {
    global: Arc<RwLock<Global>>,
    display_name: String,
    current_step_id: Option<String>,
    result: Option<TaskResult>,
    /// Outputs collected by this (step) context.
    pub outputs: HashMap<String, String>,
    /// State saved via `save-state` / `GITHUB_STATE`.
    pub state: HashMap<String, String>,
    /// Step-level environment overlay.
    pub step_environment: HashMap<String, String>,
    /// File command name -> (host path, step-visible path).
    pub file_command_paths: HashMap<String, (PathBuf, String)>,
    /// The `inputs` context, set inside composite actions.
    pub inputs: Option<Value>,
    steps_context: StepsContext,
    depth: u32,
}

impl ExecutionContext {
    /// Create the root context for a job run.
    pub fn new_root(global: Global, display_name: String) -> Self {
        Self {
            global: Arc::new(RwLock::new(global)),
            display_name,
            current_step_id: None,
            result: None,
            outputs: HashMap::new(),
            state: HashMap::new(),
            step_environment: HashMap::new(),
            file_command_paths: HashMap::new(),
            inputs: None,
            steps_context: StepsContext::new(),
            depth: 0,
        }
    }

    /// Create a step-scoped context sharing the job's global state. The
    /// steps context is snapshotted; the parent records results after the
    /// step terminates.
    pub fn create_step_context(&self, step_id: String, display_name: String) -> Self {
        Self {
            global: Arc::clone(&self.global),
            display_name,
            current_step_id: Some(step_id),
            result: None,
            outputs: HashMap::new(),
            state: HashMap::new(),
            step_environment: self.step_environment.clone(),
            file_command_paths: HashMap::new(),
            inputs: self.inputs.clone(),
            steps_context: self.steps_context.clone(),
            depth: self.depth,
        }
    }

    /// Create a child context for a composite action's inner steps: fresh
    /// steps context, its own `inputs`, one level deeper.
    pub fn create_composite_child(&self, display_name: String, inputs: Value) -> Self {
        Self {
            global: Arc::clone(&self.global),
            display_name,
            current_step_id: self.current_step_id.clone(),
            result: None,
            outputs: HashMap::new(),
            state: HashMap::new(),
            step_environment: self.step_environment.clone(),
            file_command_paths: HashMap::new(),
            inputs: Some(inputs),
            steps_context: StepsContext::new(),
            depth: self.depth + 1,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn current_step_id(&self) -> Option<&str> {
        self.current_step_id.as_deref()
    }

    pub fn global(&self) -> parking_lot::RwLockReadGuard<'_, Global> {
        self.global.read()
    }

    pub fn global_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Global> {
        self.global.write()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.global.read().cancel_token.clone()
    }

    pub fn result(&self) -> Option<TaskResult> {
        self.result
    }

    pub fn set_result(&mut self, result: TaskResult) {
        self.result = Some(result);
    }

    /// Merge an incoming result into this context's aggregate.
    pub fn merge_result(&mut self, incoming: TaskResult) {
        self.result = Some(TaskResult::merge(self.result, incoming));
    }

    pub fn steps_context(&self) -> &StepsContext {
        &self.steps_context
    }

    pub fn steps_context_mut(&mut self) -> &mut StepsContext {
        &mut self.steps_context
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    // -----------------------------------------------------------------------
    // Environment
    // -----------------------------------------------------------------------

    /// The environment a step's process receives: cumulative env, step
    /// overlay, file command paths, and PATH prepending.
    pub fn effective_environment(&self) -> HashMap<String, String> {
        let global = self.global.read();
        let mut env = global.environment.clone();
        for (key, value) in &self.step_environment {
            env.insert(key.clone(), value.clone());
        }
        for (name, (_, step_path)) in &self.file_command_paths {
            env.insert(name.clone(), step_path.clone());
        }

        if !global.prepend_path.is_empty() {
            let base = env.get("PATH").cloned().unwrap_or_else(|| {
                let on_host = global
                    .container
                    .as_ref()
                    .map(|c| c.on_host)
                    .unwrap_or(true);
                if on_host {
                    std::env::var("PATH").unwrap_or_default()
                } else {
                    CONTAINER_DEFAULT_PATH.to_string()
                }
            });
            // Most recently added paths take precedence.
            let mut parts: Vec<String> =
                global.prepend_path.iter().rev().cloned().collect();
            parts.push(base);
            env.insert("PATH".to_string(), parts.join(":"));
        }

        env
    }

    // -----------------------------------------------------------------------
    // Expression context
    // -----------------------------------------------------------------------

    /// Build the frozen snapshot for this step's expression evaluation.
    pub fn build_expression_context(&self, status: StatusFunctions) -> EvaluationContext {
        let global = self.global.read();
        let mut ctx = EvaluationContext::new();

        ctx.set("github", global.github.to_value());
        ctx.set("runner", global.runner.to_value());
        ctx.set("steps", self.steps_context.to_value());
        ctx.set("matrix", global.matrix.clone());
        ctx.set("strategy", global.strategy.clone());
        ctx.set("needs", global.needs.clone());

        let mut env = global.environment.clone();
        for (key, value) in &self.step_environment {
            env.insert(key.clone(), value.clone());
        }
        ctx.set(
            "env",
            serde_json::to_value(&env).unwrap_or(Value::Null),
        );

        ctx.set(
            "secrets",
            serde_json::to_value(&global.config.secrets).unwrap_or(Value::Null),
        );

        let mut job = serde_json::Map::new();
        job.insert(
            "status".to_string(),
            Value::String(self.job_status_str().to_string()),
        );
        if let Some(container) = &global.container {
            job.insert(
                "container".to_string(),
                serde_json::json!({ "id": container.id.clone() }),
            );
        }
        if !global.services.is_empty() {
            let mut services = serde_json::Map::new();
            for service in &global.services {
                services.insert(
                    service.name.clone(),
                    serde_json::json!({ "id": service.id.clone() }),
                );
            }
            job.insert("services".to_string(), Value::Object(services));
        }
        ctx.set("job", Value::Object(job));

        if let Some(inputs) = &self.inputs {
            ctx.set("inputs", inputs.clone());
        }

        ctx.set_status(status);
        ctx.set_workspace(&global.config.workdir);
        ctx
    }

    /// The status functions for the next step, derived from the aggregate
    /// job result so far.
    pub fn status_functions(&self) -> StatusFunctions {
        let cancelled = self.cancel_token().is_cancelled();
        let success = self.result.map(|r| r.is_success()).unwrap_or(true);
        StatusFunctions {
            success: success && !cancelled,
            failure: self.result == Some(TaskResult::Failed),
            cancelled,
        }
    }

    fn job_status_str(&self) -> &'static str {
        match self.result {
            Some(TaskResult::Failed) => "failure",
            Some(TaskResult::Canceled) => "cancelled",
            _ => "success",
        }
    }

    // -----------------------------------------------------------------------
    // Logging
    // -----------------------------------------------------------------------

    pub fn write(&self, message: &str) {
        let global = self.global.read();
        let masked = global.masker.mask(message);
        if let Some(logger) = &global.logger {
            logger.write_line(&masked);
        }
        tracing::info!(target: "step", "[{}] {}", self.display_name, masked);
    }

    pub fn info(&self, message: &str) {
        self.write(message);
    }

    pub fn debug(&self, message: &str) {
        let global = self.global.read();
        if !global.write_debug {
            return;
        }
        let masked = global.masker.mask(message);
        if let Some(logger) = &global.logger {
            logger.write_line(&format!("[debug] {}", masked));
        }
        tracing::debug!(target: "step", "[{}] {}", self.display_name, masked);
    }

    pub fn warning(&self, message: &str) {
        let global = self.global.read();
        let masked = global.masker.mask(message);
        if let Some(logger) = &global.logger {
            logger.write_line(&format!("[warning] {}", masked));
        }
        tracing::warn!(target: "step", "[{}] {}", self.display_name, masked);
    }

    pub fn error(&self, message: &str) {
        let global = self.global.read();
        let masked = global.masker.mask(message);
        if let Some(logger) = &global.logger {
            logger.write_line(&format!("[error] {}", masked));
        }
        tracing::error!(target: "step", "[{}] {}", self.display_name, masked);
    }

    /// Begin a collapsible output group.
    pub fn section(&self, title: &str) {
        self.write(&format!("::group::{}", title));
    }

    pub fn end_section(&self) {
        self.write("::endgroup::");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::action_manager::{ActionSource, GitCliSource};

    /// A context wired to throwaway directories, for module tests.
    pub fn context() -> (ExecutionContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = dir.path().join("work");
        let envs = dir.path().join("envs");
        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::create_dir_all(&envs).unwrap();

        let mut config = RunnerConfig::new(&workdir, "push");
        config.state_dir = dir.path().join("state");

        let source: Arc<dyn ActionSource> = Arc::new(GitCliSource::new("github.com"));
        let actions = Arc::new(ActionManager::new(source, config.actions_dir()));
        let config = Arc::new(config);

        let github = GitHubContext::new(
            &config,
            "test-workflow",
            "test-job",
            serde_json::json!({}),
            workdir.display().to_string(),
            String::new(),
        );

        let global = Global {
            config,
            actions,
            environment: HashMap::new(),
            prepend_path: Vec::new(),
            workspace_directory: workdir.display().to_string(),
            envs_dir_host: envs.clone(),
            envs_dir_step: envs.display().to_string(),
            state_dir_step: dir.path().join("state").display().to_string(),
            cancel_token: CancellationToken::new(),
            write_debug: true,
            job_id: "test-job".to_string(),
            job_display_name: "test-job".to_string(),
            run_key: "test-job".to_string(),
            matrix: Value::Null,
            strategy: Value::Null,
            needs: Value::Null,
            github,
            runner: RunnerContext::for_host("gale-test"),
            container: None,
            services: Vec::new(),
            default_shell: None,
            default_working_directory: None,
            masker: SecretMasker::new(),
            logger: None,
        };

        (
            ExecutionContext::new_root(global, "test-job".to_string()),
            dir,
        )
    }
}
