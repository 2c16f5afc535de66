// The plan executor: wires a Plan into a single cancellable composition of
// executor combinators. Stages chain with `then`, runs within a stage fan
// out, matrix siblings share a fail-fast scope, and `finally` tears down
// the plan network and emits the per-run summary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use gale_common::{Executor, Scope, TaskResult};
use gale_model::planner::{Plan, Run, Stage};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::action_manager::{ActionManager, ActionSource, GitCliSource};
use crate::config::RunnerConfig;
use crate::container::{ContainerBackend, DockerCliBackend, HostBackend};
use crate::job_runner::JobRunner;

/// Aggregated result of one job, visible to dependents as `needs.<job>`.
#[derive(Debug, Clone, Default)]
struct JobAggregate {
    outputs: HashMap<String, String>,
    result: Option<TaskResult>,
}

/// One line of the end-of-plan summary.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job_id: String,
    pub matrix: Option<String>,
    pub conclusion: TaskResult,
    pub duration: Duration,
}

/// Executes plans produced by the planner.
pub struct Runner {
    config: Arc<RunnerConfig>,
    docker: Arc<dyn ContainerBackend>,
    host: Arc<dyn ContainerBackend>,
    actions: Arc<ActionManager>,
    event: Value,
    summaries: Arc<Mutex<Vec<RunSummary>>>,
}

impl Runner {
    /// Create a runner with the stock backends: docker CLI for container
    /// jobs, host execution for label mappings without an image.
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let docker: Arc<dyn ContainerBackend> = Arc::new(DockerCliBackend::new());
        let host: Arc<dyn ContainerBackend> = Arc::new(HostBackend::new());
        let source: Arc<dyn ActionSource> =
            Arc::new(GitCliSource::new(config.github_instance.clone()));
        Self::with_backends(config, docker, host, source)
    }

    /// Create a runner with injected backends and action source.
    pub fn with_backends(
        mut config: RunnerConfig,
        docker: Arc<dyn ContainerBackend>,
        host: Arc<dyn ContainerBackend>,
        source: Arc<dyn ActionSource>,
    ) -> Result<Self> {
        config.ensure_state_layout()?;

        // Load the event payload and persist it into the state layout where
        // steps will read it back through GITHUB_EVENT_PATH.
        let event: Value = match &config.event_path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read event payload {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("event payload {} is not valid JSON", path.display()))?
            }
            None => serde_json::json!({}),
        };
        std::fs::write(
            config.event_json_path(),
            serde_json::to_string_pretty(&event)?,
        )?;

        // No explicit event name: infer it from the payload's shape.
        if config.event_name.is_empty() {
            match gale_model::event::event_name_from_payload(&event) {
                Some(name) => {
                    tracing::info!(target: "plan", "detected event '{}' from payload", name);
                    config.event_name = name;
                }
                None => anyhow::bail!(
                    "no event name given and the payload matches no known event type"
                ),
            }
        }

        let actions = Arc::new(ActionManager::new(source, config.actions_dir()));
        Ok(Self {
            config: Arc::new(config),
            docker,
            host,
            actions,
            event,
            summaries: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// The per-run summaries recorded by the last plan execution.
    pub fn summaries(&self) -> Vec<RunSummary> {
        self.summaries.lock().clone()
    }

    /// Compose the plan into a single deferred execution. Nothing runs
    /// until the returned executor is invoked with a scope.
    pub fn new_plan_executor(&self, plan: Plan) -> Executor {
        if plan.is_empty() {
            tracing::warn!(
                target: "plan",
                "no jobs planned for event '{}'",
                self.config.event_name
            );
            return Executor::nop();
        }

        let job_runner = Arc::new(JobRunner {
            config: Arc::clone(&self.config),
            docker: Arc::clone(&self.docker),
            host: Arc::clone(&self.host),
            actions: Arc::clone(&self.actions),
        });
        let network = format!("gale-{}", self.config.run_id);
        let results: Arc<RwLock<HashMap<String, JobAggregate>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let summaries = Arc::clone(&self.summaries);
        summaries.lock().clear();

        let needs_network = plan_uses_containers(&plan, &self.config);
        let docker = Arc::clone(&self.docker);
        let reuse = self.config.reuse_containers;

        // Network setup, skipped for dry runs and all-host plans.
        let network_for_create = network.clone();
        let docker_for_create = Arc::clone(&docker);
        let mut composed = Executor::unless(
            move |scope: &Scope| scope.dryrun() || !needs_network,
            Executor::new(move |scope: Scope| async move {
                docker_for_create
                    .create_network(&network_for_create, scope.cancellation())
                    .await
                    .map_err(|err| anyhow::anyhow!("failed to create network: {}", err))
            }),
        );

        for stage in plan.stages {
            composed = composed.then(self.stage_executor(
                stage,
                Arc::clone(&job_runner),
                Arc::clone(&results),
                Arc::clone(&summaries),
                network.clone(),
            ));
        }

        // Teardown and summary run regardless of the plan's outcome.
        let network_for_remove = network;
        let summaries_for_report = Arc::clone(&self.summaries);
        composed.finally(Executor::new(move |scope: Scope| async move {
            if needs_network && !reuse && !scope.dryrun() {
                if let Err(err) = docker
                    .remove_network(&network_for_remove, scope.cancellation())
                    .await
                {
                    tracing::warn!(target: "docker", "failed to remove network: {}", err);
                }
            }
            report_summaries(&summaries_for_report.lock());
            Ok(())
        }))
    }

    /// One stage: all runs fan out through [`Executor::parallel`]. Runs of
    /// the same matrix job share a fail-fast scope and a max-parallel
    /// semaphore; runs of different jobs never cancel each other, so each
    /// branch records its outcome instead of erroring. The stage fails only
    /// after every run has reached a terminal state.
    fn stage_executor(
        &self,
        stage: Stage,
        job_runner: Arc<JobRunner>,
        results: Arc<RwLock<HashMap<String, JobAggregate>>>,
        summaries: Arc<Mutex<Vec<RunSummary>>>,
        network: String,
    ) -> Executor {
        let event = self.event.clone();
        Executor::new(move |scope: Scope| async move {
            let stage_outcomes: Arc<Mutex<Vec<(String, TaskResult, bool)>>> =
                Arc::new(Mutex::new(Vec::new()));
            let mut branches = Vec::new();

            for (_, runs) in group_runs_by_job(stage.runs) {
                let strategy = runs[0].job().strategy.clone().unwrap_or_default();
                let group_cancel = scope.cancellation().child_token();
                let permits = Arc::new(
                    strategy
                        .max_parallel
                        .map(|limit| Semaphore::new(limit.max(1))),
                );

                for run in runs {
                    let job_runner = Arc::clone(&job_runner);
                    let results = Arc::clone(&results);
                    let summaries = Arc::clone(&summaries);
                    let stage_outcomes = Arc::clone(&stage_outcomes);
                    let event = event.clone();
                    let network = network.clone();
                    let group_cancel = group_cancel.clone();
                    let permits = Arc::clone(&permits);
                    let fail_fast = strategy.fail_fast;

                    branches.push(Executor::new(move |_scope: Scope| async move {
                        let _permit = match permits.as_ref() {
                            Some(semaphore) => Some(
                                semaphore
                                    .acquire()
                                    .await
                                    .expect("semaphore never closed"),
                            ),
                            None => None,
                        };

                        let display = run.display_name();
                        let allow_failure = run.job().continue_on_error;

                        // A fail-fast sibling already failed: this run is
                        // cancelled without starting.
                        if group_cancel.is_cancelled() {
                            record_outcome(
                                &results,
                                &summaries,
                                &run,
                                TaskResult::Canceled,
                                HashMap::new(),
                                Duration::ZERO,
                            );
                            stage_outcomes.lock().push((
                                display,
                                TaskResult::Canceled,
                                allow_failure,
                            ));
                            return Ok(());
                        }

                        let needs = needs_context(&results, &run);
                        let started = std::time::Instant::now();
                        let outcome = job_runner
                            .run(&run, needs, event, &network, group_cancel.clone())
                            .await;
                        let duration = started.elapsed();

                        record_outcome(
                            &results,
                            &summaries,
                            &run,
                            outcome.conclusion,
                            outcome.outputs,
                            duration,
                        );
                        stage_outcomes.lock().push((
                            display,
                            outcome.conclusion,
                            allow_failure,
                        ));

                        if outcome.conclusion == TaskResult::Failed
                            && !allow_failure
                            && fail_fast
                        {
                            group_cancel.cancel();
                        }
                        Ok(())
                    }));
                }
            }

            Executor::parallel(branches).execute(scope).await?;

            // Aggregate the recorded outcomes into the stage's error.
            let outcomes = stage_outcomes.lock();
            for (display, conclusion, allow_failure) in outcomes.iter() {
                match conclusion {
                    TaskResult::Failed if !*allow_failure => {
                        anyhow::bail!("Job '{}' failed", display)
                    }
                    TaskResult::Canceled => {
                        anyhow::bail!("Job '{}' cancelled", display)
                    }
                    _ => {}
                }
            }
            Ok(())
        })
    }
}

/// Group a stage's runs by job id, preserving order.
fn group_runs_by_job(runs: Vec<Run>) -> Vec<(String, Vec<Run>)> {
    let mut groups: Vec<(String, Vec<Run>)> = Vec::new();
    for run in runs {
        match groups.iter_mut().find(|(id, _)| *id == run.job_id) {
            Some((_, group)) => group.push(run),
            None => groups.push((run.job_id.clone(), vec![run])),
        }
    }
    groups
}

/// The `needs` context for a run: aggregated outputs and result of each
/// needed job.
fn needs_context(results: &RwLock<HashMap<String, JobAggregate>>, run: &Run) -> Value {
    let results = results.read();
    let mut needs = serde_json::Map::new();
    for need in &run.job().needs {
        let aggregate = results.get(need).cloned().unwrap_or_default();
        needs.insert(
            need.clone(),
            serde_json::json!({
                "outputs": aggregate.outputs,
                "result": aggregate
                    .result
                    .unwrap_or(TaskResult::Succeeded)
                    .status_str(),
            }),
        );
    }
    Value::Object(needs)
}

fn record_outcome(
    results: &RwLock<HashMap<String, JobAggregate>>,
    summaries: &Mutex<Vec<RunSummary>>,
    run: &Run,
    conclusion: TaskResult,
    outputs: HashMap<String, String>,
    duration: Duration,
) {
    {
        let mut results = results.write();
        let aggregate = results.entry(run.job_id.clone()).or_default();
        aggregate.outputs.extend(outputs);
        aggregate.result = Some(TaskResult::merge(aggregate.result, conclusion));
    }
    summaries.lock().push(RunSummary {
        job_id: run.job_id.clone(),
        matrix: run.matrix.as_ref().map(|m| m.describe()),
        conclusion,
        duration,
    });
}

/// Whether any run in the plan needs a container (and thus the network).
fn plan_uses_containers(plan: &Plan, config: &RunnerConfig) -> bool {
    plan.stages.iter().any(|stage| {
        stage.runs.iter().any(|run| {
            let job = run.job();
            if job.container.is_some() || !job.services.is_empty() {
                return true;
            }
            match config.image_for_labels(&job.runs_on) {
                Some(image) => !image.is_empty(),
                // Expression labels resolve at run time; assume a container.
                None => job.runs_on.iter().any(|l| l.contains("${{")),
            }
        })
    })
}

fn report_summaries(summaries: &[RunSummary]) {
    if summaries.is_empty() {
        return;
    }
    tracing::info!(target: "plan", "run summary:");
    for summary in summaries {
        match &summary.matrix {
            Some(matrix) => tracing::info!(
                target: "plan",
                "  {} ({}) -> {} in {:.1?}",
                summary.job_id,
                matrix,
                summary.conclusion,
                summary.duration
            ),
            None => tracing::info!(
                target: "plan",
                "  {} -> {} in {:.1?}",
                summary.job_id,
                summary.conclusion,
                summary.duration
            ),
        }
    }
}
