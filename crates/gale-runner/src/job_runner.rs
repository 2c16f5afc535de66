// The job runtime: composes the container from runs-on and the platform
// mapping, starts services on the plan network, stages the working tree,
// seeds the runner environment, drives the step loop, evaluates job
// outputs, and tears everything down.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use gale_common::{RunLogger, SecretMasker, TaskResult};
use gale_model::planner::Run;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::action_manager::ActionManager;
use crate::config::RunnerConfig;
use crate::container::{ContainerBackend, ContainerSpec};
use crate::errors::with_transient_retry;
use crate::execution_context::{
    ExecutionContext, Global, JobContainer, ServiceContainer,
};
use crate::expressions::{
    evaluate_condition, interpolate, interpolate_map, EvaluationContext, StatusFunctions,
};
use crate::github_context::GitHubContext;
use crate::runner_context::RunnerContext;
use crate::steps_runner::StepsRunner;

/// Workspace path inside job containers.
const CONTAINER_WORKSPACE: &str = "/github/workspace";
/// State-layout mount point inside job containers.
const CONTAINER_STATE_DIR: &str = "/var/run/gale";

/// The terminal state of one Run.
pub struct JobOutcome {
    pub conclusion: TaskResult,
    pub outputs: HashMap<String, String>,
}

impl JobOutcome {
    fn skipped() -> Self {
        Self {
            conclusion: TaskResult::Skipped,
            outputs: HashMap::new(),
        }
    }

    fn failed() -> Self {
        Self {
            conclusion: TaskResult::Failed,
            outputs: HashMap::new(),
        }
    }
}

/// Executes single Runs from a plan.
pub struct JobRunner {
    pub config: Arc<RunnerConfig>,
    pub docker: Arc<dyn ContainerBackend>,
    pub host: Arc<dyn ContainerBackend>,
    pub actions: Arc<ActionManager>,
}

impl JobRunner {
    /// Execute one Run to its terminal state. Infrastructure failures are
    /// converted into a failed outcome; `Err` is reserved for invariants.
    pub async fn run(
        &self,
        run: &Run,
        needs: Value,
        event: Value,
        network: &str,
        cancel: CancellationToken,
    ) -> JobOutcome {
        match self.run_inner(run, needs, event, network, cancel.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if cancel.is_cancelled() {
                    tracing::warn!(target: "plan", "job '{}' cancelled: {:#}", run.job_id, err);
                    JobOutcome {
                        conclusion: TaskResult::Canceled,
                        outputs: HashMap::new(),
                    }
                } else {
                    tracing::error!(target: "plan", "job '{}' failed: {:#}", run.job_id, err);
                    JobOutcome::failed()
                }
            }
        }
    }

    async fn run_inner(
        &self,
        run: &Run,
        needs: Value,
        event: Value,
        network: &str,
        cancel: CancellationToken,
    ) -> Result<JobOutcome> {
        let job = run.job();
        let run_key = run.run_key();
        let matrix_value = run
            .matrix
            .as_ref()
            .map(|m| m.to_json())
            .unwrap_or(Value::Null);

        // Pre-container snapshot for job-level expressions (`if:`,
        // `runs-on: ${{ matrix.os }}`, container image, env).
        let mut job_eval = EvaluationContext::new();
        job_eval.set("matrix", matrix_value.clone());
        job_eval.set("needs", needs.clone());
        job_eval.set(
            "github",
            serde_json::json!({
                "event_name": self.config.event_name.clone(),
                "event": event.clone(),
            }),
        );
        let mut pre_env = self.config.env.clone();
        pre_env.extend(run.workflow.env.clone());
        job_eval.set("env", serde_json::to_value(&pre_env).unwrap_or(Value::Null));
        job_eval.set(
            "secrets",
            serde_json::to_value(&self.config.secrets).unwrap_or(Value::Null),
        );

        // Job-level `if:`.
        if let Some(condition) = &job.condition {
            let should_run = evaluate_condition(condition, &job_eval)
                .with_context(|| format!("job '{}': invalid 'if' expression", job.id))?;
            if !should_run {
                tracing::info!(target: "plan", "skipping job '{}' (condition is false)", run.display_name());
                return Ok(JobOutcome::skipped());
            }
        }

        // Resolve the image: explicit container wins over the platform map.
        let labels: Vec<String> = job
            .runs_on
            .iter()
            .map(|label| interpolate(label, &job_eval))
            .collect::<Result<_, _>>()
            .map_err(|err| anyhow::anyhow!("job '{}': runs-on: {}", job.id, err))?;
        let image = match &job.container {
            Some(container) => interpolate(&container.image, &job_eval)
                .map_err(|err| anyhow::anyhow!("job '{}': container image: {}", job.id, err))?,
            None => self.config.image_for_labels(&labels).unwrap_or_default(),
        };
        let on_host = image.is_empty();
        let backend: Arc<dyn ContainerBackend> = if on_host {
            Arc::clone(&self.host)
        } else {
            Arc::clone(&self.docker)
        };

        tracing::info!(
            target: "plan",
            "starting job '{}' on {} ({})",
            run.display_name(),
            backend.name(),
            if on_host { "host" } else { image.as_str() }
        );

        // Paths as steps will see them.
        let envs_dir_host = self.config.envs_dir(&run_key);
        std::fs::create_dir_all(&envs_dir_host)?;
        let envs_relative = envs_dir_host
            .strip_prefix(&self.config.state_dir)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let (workspace, state_dir_step, envs_dir_step, event_path_step, runner_context) =
            if on_host {
                (
                    self.config.workdir.display().to_string(),
                    self.config.state_dir.display().to_string(),
                    envs_dir_host.display().to_string(),
                    self.config.event_json_path().display().to_string(),
                    RunnerContext::for_host("gale"),
                )
            } else {
                (
                    CONTAINER_WORKSPACE.to_string(),
                    CONTAINER_STATE_DIR.to_string(),
                    format!("{}/{}", CONTAINER_STATE_DIR, envs_relative),
                    format!("{}/workflow/event.json", CONTAINER_STATE_DIR),
                    RunnerContext::for_container("gale", "/tmp"),
                )
            };

        let github = GitHubContext::new(
            &self.config,
            run.workflow.name.as_deref().unwrap_or(""),
            &job.id,
            event,
            workspace.clone(),
            event_path_step,
        );

        // Environment layering: runner-provided, invocation, workflow, job.
        let mut environment: HashMap<String, String> = HashMap::new();
        for (key, value) in github.to_environment() {
            environment.insert(key, value);
        }
        for (key, value) in runner_context.to_environment() {
            environment.insert(key, value);
        }
        environment.extend(self.config.env.clone());
        environment.extend(run.workflow.env.clone());
        let job_env = interpolate_map(&job.env, &job_eval)
            .map_err(|err| anyhow::anyhow!("job '{}': env: {}", job.id, err))?;
        environment.extend(job_env);

        let masker = SecretMasker::new();
        for value in self.config.secrets.values() {
            masker.add_value(value);
        }

        // Allocate containers.
        let state_mount = format!(
            "{}:{}",
            self.config.state_dir.display(),
            CONTAINER_STATE_DIR
        );
        let mut services = Vec::new();
        let container_id;

        if on_host {
            let spec = ContainerSpec {
                working_directory: Some(workspace.clone()),
                ..ContainerSpec::default()
            };
            container_id = backend.create(&spec, cancel.clone()).await?;
            backend.start(&container_id, cancel.clone()).await?;
        } else {
            self.pull(&backend, &image, cancel.clone()).await?;

            // Services first: the job container resolves them by key.
            for (service_key, service_spec) in &job.services {
                let service_image = interpolate(&service_spec.image, &job_eval)
                    .map_err(|err| anyhow::anyhow!("service '{}': {}", service_key, err))?;
                self.pull(&backend, &service_image, cancel.clone()).await?;
                let spec = ContainerSpec {
                    name: format!("gale-{}-{}", self.config.run_id, service_key),
                    image: service_image,
                    env: service_spec.env.clone(),
                    volumes: service_spec.volumes.clone(),
                    ports: service_spec.ports.clone(),
                    network: Some(network.to_string()),
                    network_alias: Some(service_key.clone()),
                    options: service_spec.options.clone(),
                    ..ContainerSpec::default()
                };
                let id = backend.create(&spec, cancel.clone()).await?;
                backend.start(&id, cancel.clone()).await?;
                services.push(ServiceContainer {
                    name: service_key.clone(),
                    id,
                });
            }

            let mut volumes = vec![state_mount.clone()];
            if self.config.bind_workdir {
                volumes.push(format!(
                    "{}:{}",
                    self.config.workdir.display(),
                    workspace
                ));
            }
            if let Some(container) = &job.container {
                volumes.extend(container.volumes.clone());
            }

            let spec = ContainerSpec {
                name: format!("gale-{}-{}", self.config.run_id, sanitize(&run_key)),
                image: image.clone(),
                env: job
                    .container
                    .as_ref()
                    .map(|c| c.env.clone())
                    .unwrap_or_default(),
                volumes,
                ports: job
                    .container
                    .as_ref()
                    .map(|c| c.ports.clone())
                    .unwrap_or_default(),
                // Keep the container alive; steps arrive via exec.
                entrypoint: Some("tail".to_string()),
                cmd: vec!["-f".to_string(), "/dev/null".to_string()],
                network: Some(network.to_string()),
                network_alias: Some(sanitize(&job.id)),
                options: job.container.as_ref().and_then(|c| c.options.clone()),
                working_directory: Some(workspace.clone()),
            };
            container_id = backend.create(&spec, cancel.clone()).await?;
            backend.start(&container_id, cancel.clone()).await?;

            if !self.config.bind_workdir {
                backend
                    .copy_dir_in(&container_id, &self.config.workdir, &workspace, cancel.clone())
                    .await?;
            }
        }

        // Merged run defaults: job-level wins over workflow-level.
        let default_shell = job
            .defaults
            .as_ref()
            .and_then(|d| d.shell.clone())
            .or_else(|| run.workflow.defaults.as_ref().and_then(|d| d.shell.clone()));
        let default_working_directory = job
            .defaults
            .as_ref()
            .and_then(|d| d.working_directory.clone())
            .or_else(|| {
                run.workflow
                    .defaults
                    .as_ref()
                    .and_then(|d| d.working_directory.clone())
            });

        let logger = Arc::new(RunLogger::create(&self.config.logs_dir(), &run_key)?);
        let strategy_value = job
            .strategy
            .as_ref()
            .map(|s| {
                serde_json::json!({
                    "fail-fast": s.fail_fast,
                    "max-parallel": s.max_parallel,
                })
            })
            .unwrap_or(Value::Null);

        let global = Global {
            config: Arc::clone(&self.config),
            actions: Arc::clone(&self.actions),
            environment,
            prepend_path: Vec::new(),
            workspace_directory: workspace,
            envs_dir_host,
            envs_dir_step,
            state_dir_step,
            cancel_token: cancel.clone(),
            write_debug: self.config.write_debug,
            job_id: job.id.clone(),
            job_display_name: job.display_name().to_string(),
            run_key: run_key.clone(),
            matrix: matrix_value,
            strategy: strategy_value,
            needs,
            github,
            runner: runner_context,
            container: Some(JobContainer {
                backend: Arc::clone(&backend),
                id: container_id.clone(),
                on_host,
            }),
            services: services
                .iter()
                .map(|s| ServiceContainer {
                    name: s.name.clone(),
                    id: s.id.clone(),
                })
                .collect(),
            default_shell,
            default_working_directory,
            masker,
            logger: Some(logger),
        };

        let mut context = ExecutionContext::new_root(global, run.display_name());

        // Drive the steps, optionally under the job-level timeout.
        let steps_result = match job.timeout_minutes {
            Some(minutes) => {
                let deadline = std::time::Duration::from_secs(minutes * 60);
                let body = StepsRunner::run_steps(&mut context, &job.steps);
                match tokio::time::timeout(deadline, body).await {
                    Ok(result) => result,
                    Err(_) => {
                        context.error(&format!(
                            "Job exceeded the maximum execution time of {} minutes.",
                            minutes
                        ));
                        context.merge_result(TaskResult::Failed);
                        Ok(())
                    }
                }
            }
            None => StepsRunner::run_steps(&mut context, &job.steps).await,
        };

        let mut conclusion = context.result().unwrap_or(TaskResult::Succeeded);
        if let Err(err) = steps_result {
            context.error(&format!("{:#}", err));
            conclusion = TaskResult::merge(Some(conclusion), TaskResult::Failed);
        }
        if conclusion == TaskResult::Skipped {
            conclusion = TaskResult::Succeeded;
        }

        // Job outputs; an evaluation failure fails the job.
        let mut outputs = HashMap::new();
        if conclusion == TaskResult::Succeeded && !job.outputs.is_empty() {
            let eval = context.build_expression_context(StatusFunctions::default());
            for (name, expression) in &job.outputs {
                match interpolate(expression, &eval) {
                    Ok(value) => {
                        outputs.insert(name.clone(), value);
                    }
                    Err(err) => {
                        context.error(&format!(
                            "Failed to evaluate job output '{}': {}",
                            name, err
                        ));
                        conclusion = TaskResult::Failed;
                        outputs.clear();
                        break;
                    }
                }
            }
        }

        // Teardown, best effort.
        if !self.config.reuse_containers {
            let teardown_cancel = CancellationToken::new();
            for service in &services {
                if let Err(err) = backend.remove(&service.id, teardown_cancel.clone()).await {
                    tracing::warn!(target: "docker", "failed to remove service '{}': {}", service.name, err);
                }
            }
            if let Err(err) = backend.remove(&container_id, teardown_cancel).await {
                tracing::warn!(target: "docker", "failed to remove job container: {}", err);
            }
        }

        Ok(JobOutcome {
            conclusion,
            outputs,
        })
    }

    async fn pull(
        &self,
        backend: &Arc<dyn ContainerBackend>,
        image: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let pull = match self.config.pull_policy {
            crate::config::PullPolicy::Always => true,
            crate::config::PullPolicy::Never => false,
            crate::config::PullPolicy::IfMissing => {
                !backend.image_exists(image, cancel.clone()).await?
            }
        };
        if pull {
            with_transient_retry(|| backend.pull_image(image, cancel.clone()))
                .await
                .with_context(|| format!("failed to pull image '{}'", image))?;
        }
        Ok(())
    }
}

fn sanitize(value: &str) -> String {
    gale_common::logging::sanitize_file_name(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_manager::GitCliSource;
    use crate::container::HostBackend;
    use gale_model::Planner;

    fn job_runner(workdir: &std::path::Path, state: &std::path::Path) -> JobRunner {
        let mut config = RunnerConfig::new(workdir, "push");
        config.state_dir = state.to_path_buf();
        config.ensure_state_layout().unwrap();
        // Route every platform to the host for tests.
        config.platforms.insert("ubuntu-latest".to_string(), String::new());
        let config = Arc::new(config);
        let host: Arc<dyn ContainerBackend> = Arc::new(HostBackend::new());
        JobRunner {
            docker: Arc::clone(&host),
            host,
            actions: Arc::new(ActionManager::new(
                Arc::new(GitCliSource::new("github.com")),
                config.actions_dir(),
            )),
            config,
        }
    }

    fn single_run(source: &str) -> Run {
        let planner =
            Planner::from_sources(vec![("test.yml".to_string(), source.to_string())]).unwrap();
        let plan = planner.plan_event("push").unwrap();
        plan.stages[0].runs[0].clone()
    }

    #[tokio::test]
    async fn test_job_runs_and_produces_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("work");
        std::fs::create_dir_all(&workdir).unwrap();
        let runner = job_runner(&workdir, &dir.path().join("state"));

        let run = single_run(concat!(
            "on: push\n",
            "jobs:\n",
            "  produce:\n",
            "    runs-on: ubuntu-latest\n",
            "    outputs:\n",
            "      o1: ${{ steps.s1.outputs.k }}\n",
            "    steps:\n",
            "      - id: s1\n",
            "        run: echo \"::set-output name=k::v\"\n",
        ));

        let outcome = runner
            .run(
                &run,
                Value::Null,
                serde_json::json!({}),
                "gale-test-net",
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.conclusion, TaskResult::Succeeded);
        assert_eq!(outcome.outputs.get("o1").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_job_failure_conclusion() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("work");
        std::fs::create_dir_all(&workdir).unwrap();
        let runner = job_runner(&workdir, &dir.path().join("state"));

        let run = single_run(concat!(
            "on: push\n",
            "jobs:\n",
            "  broken:\n",
            "    runs-on: ubuntu-latest\n",
            "    steps:\n",
            "      - run: exit 1\n",
        ));
        let outcome = runner
            .run(
                &run,
                Value::Null,
                serde_json::json!({}),
                "gale-test-net",
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.conclusion, TaskResult::Failed);
    }

    #[tokio::test]
    async fn test_job_condition_skips_without_container() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("work");
        std::fs::create_dir_all(&workdir).unwrap();
        let runner = job_runner(&workdir, &dir.path().join("state"));

        let run = single_run(concat!(
            "on: push\n",
            "jobs:\n",
            "  gated:\n",
            "    runs-on: ubuntu-latest\n",
            "    if: github.event_name == 'release'\n",
            "    steps:\n",
            "      - run: exit 1\n",
        ));
        let outcome = runner
            .run(
                &run,
                Value::Null,
                serde_json::json!({}),
                "gale-test-net",
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.conclusion, TaskResult::Skipped);
    }

    #[tokio::test]
    async fn test_needs_context_visible_to_job() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("work");
        std::fs::create_dir_all(&workdir).unwrap();
        let runner = job_runner(&workdir, &dir.path().join("state"));

        let run = single_run(concat!(
            "on: push\n",
            "jobs:\n",
            "  consume:\n",
            "    runs-on: ubuntu-latest\n",
            "    steps:\n",
            "      - run: \"[ \\\"${{ needs.producer.outputs.o1 }}\\\" = \\\"v\\\" ]\"\n",
        ));
        let needs = serde_json::json!({
            "producer": { "outputs": { "o1": "v" }, "result": "success" }
        });
        let outcome = runner
            .run(
                &run,
                needs,
                serde_json::json!({}),
                "gale-test-net",
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome.conclusion, TaskResult::Succeeded);
    }

    #[tokio::test]
    async fn test_matrix_context_in_steps() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("work");
        std::fs::create_dir_all(&workdir).unwrap();
        let runner = job_runner(&workdir, &dir.path().join("state"));

        let planner = Planner::from_sources(vec![(
            "m.yml".to_string(),
            concat!(
                "on: push\n",
                "jobs:\n",
                "  m:\n",
                "    runs-on: ubuntu-latest\n",
                "    strategy:\n",
                "      matrix:\n",
                "        word: [alpha, beta]\n",
                "    steps:\n",
                "      - run: \"[ -n \\\"${{ matrix.word }}\\\" ]\"\n",
            )
            .to_string(),
        )])
        .unwrap();
        let plan = planner.plan_event("push").unwrap();
        assert_eq!(plan.stages[0].runs.len(), 2);

        for run in &plan.stages[0].runs {
            let outcome = runner
                .run(
                    run,
                    Value::Null,
                    serde_json::json!({}),
                    "gale-test-net",
                    CancellationToken::new(),
                )
                .await;
            assert_eq!(outcome.conclusion, TaskResult::Succeeded);
        }
    }
}
