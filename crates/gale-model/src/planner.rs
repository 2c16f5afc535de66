// Planner: turns loaded workflows plus an event (or job) name into a Plan
// of Stages of Runs. Stage construction is strictly topological over
// `needs`; matrix jobs expand into one Run per surviving assignment.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::matrix::MatrixAssignment;
use crate::workflow::{read_workflow, Job, Workflow};

/// An ordered list of stages to run in series.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub stages: Vec<Stage>,
}

/// A set of runs to execute in parallel.
#[derive(Debug, Clone, Default)]
pub struct Stage {
    pub runs: Vec<Run>,
}

/// A single job execution instance: job plus optional matrix assignment.
#[derive(Debug, Clone)]
pub struct Run {
    pub workflow: Arc<Workflow>,
    pub job_id: String,
    pub matrix: Option<MatrixAssignment>,
}

impl Run {
    pub fn job(&self) -> &Job {
        self.workflow
            .get_job(&self.job_id)
            .expect("run references a job present in its workflow")
    }

    /// `job` or `job (k=v, k2=v2)` for logs and summaries.
    pub fn display_name(&self) -> String {
        let base = self.job().display_name().to_string();
        match &self.matrix {
            Some(matrix) if !matrix.is_empty() => format!("{} ({})", base, matrix.describe()),
            _ => base,
        }
    }

    /// A stable key for log files and env directories.
    pub fn run_key(&self) -> String {
        match &self.matrix {
            Some(matrix) if !matrix.is_empty() => {
                format!("{}-{}", self.job_id, matrix.describe().replace(", ", "-"))
            }
            _ => self.job_id.clone(),
        }
    }
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(|s| s.runs.is_empty())
    }

    /// Total number of runs across all stages.
    pub fn run_count(&self) -> usize {
        self.stages.iter().map(|s| s.runs.len()).sum()
    }

    /// Merge another set of stages index-wise: stage k of the plan gains the
    /// runs of stage k of `stages`.
    pub fn merge(&mut self, stages: Vec<Stage>) {
        let target_len = self.stages.len().max(stages.len());
        self.stages.resize_with(target_len, Stage::default);
        for (index, stage) in stages.into_iter().enumerate() {
            self.stages[index].runs.extend(stage.runs);
        }
    }
}

impl Stage {
    pub fn job_ids(&self) -> Vec<&str> {
        self.runs.iter().map(|r| r.job_id.as_str()).collect()
    }
}

/// Loads workflows and produces plans for events or single jobs.
#[derive(Debug)]
pub struct Planner {
    workflows: Vec<(String, Arc<Workflow>)>,
}

impl Planner {
    /// Load every `.yml` / `.yaml` file in a directory (or a single file).
    /// Any load error in any file is fatal and reported with its position.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut sources = Vec::new();
        if path.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(path)
                .with_context(|| format!("Failed to read workflow directory {}", path.display()))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yml") | Some("yaml")
                    )
                })
                .collect();
            entries.sort();
            for file in entries {
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read workflow {}", file.display()))?;
                sources.push((file.display().to_string(), text));
            }
        } else {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read workflow {}", path.display()))?;
            sources.push((path.display().to_string(), text));
        }
        Self::from_sources(sources)
    }

    /// Build a planner from in-memory workflow sources.
    pub fn from_sources(sources: Vec<(String, String)>) -> Result<Self> {
        let mut workflows = Vec::new();
        let mut problems = Vec::new();

        for (name, text) in sources {
            match read_workflow(&text) {
                Ok(workflow) => workflows.push((name, Arc::new(workflow))),
                Err(errors) => {
                    for error in errors {
                        problems.push(format!("{}: {}", name, error));
                    }
                }
            }
        }

        if !problems.is_empty() {
            bail!("workflow load failed:\n{}", problems.join("\n"));
        }
        if workflows.is_empty() {
            bail!("no workflow files found");
        }

        Ok(Self { workflows })
    }

    /// Plan every workflow that declares the given event.
    ///
    /// Only the event *name* is matched; `branches:`/`paths:` filters on the
    /// event are not consulted. An event that matches no workflow yields an
    /// empty plan.
    pub fn plan_event(&self, event_name: &str) -> Result<Plan> {
        let mut plan = Plan::default();
        for (file, workflow) in &self.workflows {
            if workflow.triggers_on(event_name) {
                tracing::debug!(target: "plan", "planning workflow '{}' for event '{}'", file, event_name);
                let job_ids = workflow.job_ids();
                plan.merge(create_stages(workflow, &job_ids)?);
            }
        }
        if plan.is_empty() {
            tracing::debug!(target: "plan", "no workflows match event '{}'", event_name);
        }
        Ok(plan)
    }

    /// Plan a single job (plus its transitive needs), ignoring event
    /// declarations, across all loaded workflows.
    pub fn plan_job(&self, job_id: &str) -> Result<Plan> {
        let mut plan = Plan::default();
        let mut found = false;
        for (_, workflow) in &self.workflows {
            if workflow.get_job(job_id).is_some() {
                found = true;
                plan.merge(create_stages(workflow, &[job_id.to_string()])?);
            }
        }
        if !found {
            bail!("unknown job '{}'", job_id);
        }
        Ok(plan)
    }

    /// All event names declared by the loaded workflows, sorted and deduped.
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .workflows
            .iter()
            .flat_map(|(_, w)| w.on.iter().map(|e| e.name.clone()))
            .collect();
        events.sort();
        events.dedup();
        events
    }
}

/// Build the stage list for the requested jobs of one workflow.
///
/// Collects the reverse closure over `needs`, assigns each job the smallest
/// stage index greater than all of its needs, then expands matrices.
fn create_stages(workflow: &Arc<Workflow>, job_ids: &[String]) -> Result<Vec<Stage>> {
    // Reverse closure: every requested job plus everything it needs.
    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
    let mut frontier: Vec<String> = job_ids.to_vec();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for id in frontier {
            if dependencies.contains_key(&id) {
                continue;
            }
            let job = workflow
                .get_job(&id)
                .with_context(|| format!("unknown job '{}'", id))?;
            for need in &job.needs {
                if workflow.get_job(need).is_none() {
                    bail!("job '{}' needs unknown job '{}'", id, need);
                }
            }
            dependencies.insert(id.clone(), job.needs.clone());
            next.extend(job.needs.iter().cloned());
        }
        frontier = next;
    }

    // Smallest stage index >= max(stage of needs) + 1.
    let mut levels: HashMap<String, usize> = HashMap::new();
    while levels.len() < dependencies.len() {
        let mut progressed = false;
        for (id, needs) in &dependencies {
            if levels.contains_key(id) {
                continue;
            }
            if needs.iter().all(|n| levels.contains_key(n)) {
                let level = needs
                    .iter()
                    .map(|n| levels[n] + 1)
                    .max()
                    .unwrap_or(0);
                levels.insert(id.clone(), level);
                progressed = true;
            }
        }
        if !progressed {
            let mut remaining: Vec<&str> = dependencies
                .keys()
                .filter(|id| !levels.contains_key(*id))
                .map(String::as_str)
                .collect();
            remaining.sort();
            bail!(
                "cyclic 'needs' dependency between jobs: {}",
                remaining.join(", ")
            );
        }
    }

    let stage_count = levels.values().copied().max().map(|m| m + 1).unwrap_or(0);
    let mut stages: Vec<Stage> = (0..stage_count).map(|_| Stage::default()).collect();

    // Keep workflow declaration order within each stage.
    for job in &workflow.jobs {
        let Some(&level) = levels.get(&job.id) else {
            continue;
        };
        for matrix in expand_job_matrix(job) {
            stages[level].runs.push(Run {
                workflow: Arc::clone(workflow),
                job_id: job.id.clone(),
                matrix,
            });
        }
    }

    Ok(stages)
}

/// One Run per matrix point; a job without a matrix yields a single Run
/// with no assignment.
fn expand_job_matrix(job: &Job) -> Vec<Option<MatrixAssignment>> {
    match job.strategy.as_ref().and_then(|s| s.matrix.as_ref()) {
        Some(matrix) => {
            let expanded = matrix.expand();
            if expanded.is_empty() {
                vec![None]
            } else {
                expanded.into_iter().map(Some).collect()
            }
        }
        None => vec![None],
    }
}
