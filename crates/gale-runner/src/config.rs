// Runner configuration and the on-host state layout for one invocation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gale_common::logging::sanitize_file_name;

/// Image pull policy for job and service containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfMissing,
    Never,
}

/// Configuration for a runner invocation.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// The working tree that becomes the job workspace.
    pub workdir: PathBuf,
    /// Bind-mount the working tree instead of copying it into the container.
    pub bind_workdir: bool,
    /// The triggering event name.
    pub event_name: String,
    /// Path to the event payload JSON, if any.
    pub event_path: Option<PathBuf>,
    /// Keep containers and networks around after the run.
    pub reuse_containers: bool,
    /// Platform label -> image. An empty image means host execution.
    pub platforms: HashMap<String, String>,
    pub pull_policy: PullPolicy,
    /// Extra environment applied below the workflow layer.
    pub env: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    /// Root of the per-invocation state layout.
    pub state_dir: PathBuf,
    /// GitHub instance hostname used for action resolution.
    pub github_instance: String,
    pub actor: String,
    /// Unique id of this invocation (`GITHUB_RUN_ID`).
    pub run_id: String,
    pub write_debug: bool,
}

impl RunnerConfig {
    /// A configuration with the stock platform mapping and a fresh state
    /// directory under the system temp dir.
    pub fn new(workdir: impl Into<PathBuf>, event_name: impl Into<String>) -> Self {
        let run_id = uuid::Uuid::new_v4().as_simple().to_string();
        Self {
            workdir: workdir.into(),
            bind_workdir: false,
            event_name: event_name.into(),
            event_path: None,
            reuse_containers: false,
            platforms: Self::default_platforms("node:16-buster-slim"),
            pull_policy: PullPolicy::IfMissing,
            env: HashMap::new(),
            secrets: HashMap::new(),
            state_dir: std::env::temp_dir().join("gale").join(&run_id),
            github_instance: "github.com".to_string(),
            actor: "gale".to_string(),
            run_id,
            write_debug: false,
        }
    }

    /// The stock label -> image mapping. Windows and macOS labels map to the
    /// empty image, which means host execution.
    pub fn default_platforms(base_image: &str) -> HashMap<String, String> {
        let mut platforms = HashMap::new();
        platforms.insert("ubuntu-latest".to_string(), base_image.to_string());
        platforms.insert("ubuntu-22.04".to_string(), "node:16-bullseye-slim".to_string());
        platforms.insert("ubuntu-20.04".to_string(), "node:16-buster-slim".to_string());
        platforms.insert("ubuntu-18.04".to_string(), "node:16-buster-slim".to_string());
        for host_label in [
            "windows-latest",
            "windows-2022",
            "windows-2019",
            "macos-latest",
            "macos-12",
            "macos-11",
        ] {
            platforms.insert(host_label.to_string(), String::new());
        }
        platforms
    }

    /// Apply `label=image` override strings on top of the current mapping.
    pub fn apply_platform_overrides(&mut self, overrides: &[String]) {
        for entry in overrides {
            match entry.split_once('=') {
                Some((label, image)) => {
                    self.platforms
                        .insert(label.trim().to_string(), image.trim().to_string());
                }
                None => {
                    tracing::warn!(
                        target: "plan",
                        "ignoring malformed platform override '{}' (expected label=image)",
                        entry
                    );
                }
            }
        }
    }

    /// Image for a job's `runs-on` labels: the first label with a mapping
    /// wins. `None` means no mapping exists; an empty string means run on
    /// the host.
    pub fn image_for_labels(&self, labels: &[String]) -> Option<String> {
        labels
            .iter()
            .find_map(|label| self.platforms.get(label).cloned())
    }

    // -----------------------------------------------------------------------
    // State layout
    // -----------------------------------------------------------------------

    /// `<state>/workflow/event.json`
    pub fn event_json_path(&self) -> PathBuf {
        self.state_dir.join("workflow").join("event.json")
    }

    /// `<state>/workflow/envs/<run-key>/`
    pub fn envs_dir(&self, run_key: &str) -> PathBuf {
        self.state_dir
            .join("workflow")
            .join("envs")
            .join(sanitize_file_name(run_key))
    }

    /// `<state>/actions/`
    pub fn actions_dir(&self) -> PathBuf {
        self.state_dir.join("actions")
    }

    /// `<state>/actions/<owner>/<repo>/<sha>/`
    pub fn action_dir(&self, owner: &str, repo: &str, sha: &str) -> PathBuf {
        self.actions_dir().join(owner).join(repo).join(sha)
    }

    /// `<state>/logs/`, one log file per Run.
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Create the state layout directories.
    pub fn ensure_state_layout(&self) -> anyhow::Result<()> {
        for dir in [
            self.state_dir.join("workflow").join("envs"),
            self.actions_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Resolve a step working directory against the workspace.
pub fn resolve_working_directory(workspace: &str, relative: Option<&str>) -> String {
    match relative {
        Some(dir) if Path::new(dir).is_absolute() => dir.to_string(),
        Some(dir) => format!("{}/{}", workspace.trim_end_matches('/'), dir),
        None => workspace.to_string(),
    }
}
