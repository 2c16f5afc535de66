// The `github.*` expression context and the GITHUB_* environment it
// projects into every step.

use serde_json::Value;

use crate::config::RunnerConfig;

/// The `github` context available to expressions.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GitHubContext {
    pub workflow: String,
    pub run_id: String,
    pub actor: String,
    pub repository: String,
    pub repository_owner: String,
    pub event_name: String,
    /// The event payload document.
    pub event: Value,
    /// Path to the payload file as seen by steps.
    pub event_path: String,
    pub sha: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub ref_name: String,
    pub ref_type: String,
    pub head_ref: String,
    pub base_ref: String,
    pub server_url: String,
    pub api_url: String,
    pub graphql_url: String,
    pub workspace: String,
    pub job: String,
    pub action: String,
    pub token: String,
}

impl GitHubContext {
    /// Build the context from the runner configuration, the event payload,
    /// and the job being run. `workspace` and `event_path` are the paths
    /// steps will see (container-side for containerised jobs).
    pub fn new(
        config: &RunnerConfig,
        workflow_name: &str,
        job_id: &str,
        event: Value,
        workspace: String,
        event_path: String,
    ) -> Self {
        let get = |key: &str, fallback: &str| -> String {
            config
                .env
                .get(key)
                .cloned()
                .unwrap_or_else(|| fallback.to_string())
        };

        let repository = config.env.get("GITHUB_REPOSITORY").cloned().unwrap_or_else(|| {
            event
                .pointer("/repository/full_name")
                .and_then(|v| v.as_str())
                .unwrap_or("local/repository")
                .to_string()
        });
        let repository_owner = repository
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let sha = config.env.get("GITHUB_SHA").cloned().unwrap_or_else(|| {
            event
                .get("after")
                .and_then(|v| v.as_str())
                .unwrap_or("0000000000000000000000000000000000000000")
                .to_string()
        });

        let git_ref = config.env.get("GITHUB_REF").cloned().unwrap_or_else(|| {
            event
                .get("ref")
                .and_then(|v| v.as_str())
                .unwrap_or("refs/heads/main")
                .to_string()
        });

        let server_url = get("GITHUB_SERVER_URL", "https://github.com");
        let (api_url, graphql_url) = if server_url == "https://github.com" {
            (
                "https://api.github.com".to_string(),
                "https://api.github.com/graphql".to_string(),
            )
        } else {
            (
                format!("{}/api/v3", server_url),
                format!("{}/api/graphql", server_url),
            )
        };

        Self {
            workflow: workflow_name.to_string(),
            run_id: config.run_id.clone(),
            actor: config.actor.clone(),
            repository,
            repository_owner,
            event_name: config.event_name.clone(),
            event,
            event_path,
            sha,
            ref_name: extract_ref_name(&git_ref),
            ref_type: extract_ref_type(&git_ref),
            git_ref,
            head_ref: get("GITHUB_HEAD_REF", ""),
            base_ref: get("GITHUB_BASE_REF", ""),
            server_url,
            api_url,
            graphql_url,
            workspace,
            job: job_id.to_string(),
            action: String::new(),
            token: config.secrets.get("GITHUB_TOKEN").cloned().unwrap_or_default(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    /// The GITHUB_* environment this context provides to every step.
    pub fn to_environment(&self) -> Vec<(String, String)> {
        vec![
            ("CI".to_string(), "true".to_string()),
            ("GITHUB_ACTIONS".to_string(), "true".to_string()),
            ("GITHUB_WORKFLOW".to_string(), self.workflow.clone()),
            ("GITHUB_RUN_ID".to_string(), self.run_id.clone()),
            ("GITHUB_ACTION".to_string(), self.action.clone()),
            ("GITHUB_ACTOR".to_string(), self.actor.clone()),
            ("GITHUB_REPOSITORY".to_string(), self.repository.clone()),
            ("GITHUB_EVENT_NAME".to_string(), self.event_name.clone()),
            ("GITHUB_EVENT_PATH".to_string(), self.event_path.clone()),
            ("GITHUB_WORKSPACE".to_string(), self.workspace.clone()),
            ("GITHUB_SHA".to_string(), self.sha.clone()),
            ("GITHUB_REF".to_string(), self.git_ref.clone()),
            ("GITHUB_HEAD_REF".to_string(), self.head_ref.clone()),
            ("GITHUB_BASE_REF".to_string(), self.base_ref.clone()),
            ("GITHUB_SERVER_URL".to_string(), self.server_url.clone()),
            ("GITHUB_API_URL".to_string(), self.api_url.clone()),
            ("GITHUB_GRAPHQL_URL".to_string(), self.graphql_url.clone()),
        ]
    }
}

/// `refs/heads/main` -> `main`, `refs/tags/v1.0` -> `v1.0`.
fn extract_ref_name(git_ref: &str) -> String {
    git_ref
        .strip_prefix("refs/heads/")
        .or_else(|| git_ref.strip_prefix("refs/tags/"))
        .or_else(|| git_ref.strip_prefix("refs/pull/"))
        .unwrap_or(git_ref)
        .to_string()
}

fn extract_ref_type(git_ref: &str) -> String {
    if git_ref.starts_with("refs/heads/") {
        "branch".to_string()
    } else if git_ref.starts_with("refs/tags/") {
        "tag".to_string()
    } else {
        String::new()
    }
}
