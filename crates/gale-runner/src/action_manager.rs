// Action resolution: local paths resolve against the working tree, remote
// references resolve to an immutable commit id through an ActionSource and
// cache under actions/<owner>/<repo>/<sha>/. A latch per cache key keeps
// concurrent fetches of the same action down to one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use gale_common::process_invoker::ProcessInvoker;
use gale_model::workflow::ActionReference;
use once_cell::sync::Lazy;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Provider of remote action sources.
#[async_trait]
pub trait ActionSource: Send + Sync {
    /// Resolve a symbolic ref (branch, tag) to an immutable commit id.
    async fn resolve_sha(
        &self,
        reference: &ActionReference,
        cancel: CancellationToken,
    ) -> Result<String>;

    /// Materialise the repository tree at `sha` into `destination`.
    async fn fetch(
        &self,
        reference: &ActionReference,
        sha: &str,
        destination: &Path,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Resolves and caches actions for one invocation.
pub struct ActionManager {
    source: Arc<dyn ActionSource>,
    cache_dir: PathBuf,
    latches: DashMap<String, Arc<OnceCell<PathBuf>>>,
}

impl ActionManager {
    pub fn new(source: Arc<dyn ActionSource>, cache_dir: PathBuf) -> Self {
        Self {
            source,
            cache_dir,
            latches: DashMap::new(),
        }
    }

    /// Resolve a local `./path` action against the working tree.
    pub fn resolve_local(workdir: &Path, path: &str) -> PathBuf {
        workdir.join(path.trim_start_matches("./"))
    }

    /// Resolve a remote action to its cached directory, fetching at most
    /// once per `owner/repo@sha` across concurrent callers.
    pub async fn resolve_remote(
        &self,
        reference: &ActionReference,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        let sha = self
            .source
            .resolve_sha(reference, cancel.clone())
            .await
            .with_context(|| format!("failed to resolve action '{}'", reference))?;

        let key = format!("{}/{}@{}", reference.owner, reference.repo, sha);
        let latch = self
            .latches
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let repo_dir = self
            .cache_dir
            .join(&reference.owner)
            .join(&reference.repo)
            .join(&sha);

        let cached = latch
            .get_or_try_init(|| async {
                if !repo_dir.join(".gale-complete").exists() {
                    tracing::info!(target: "plan", "fetching action {} ({})", reference, sha);
                    // Fetch into a staging path, then mark complete, so a
                    // torn earlier fetch is never trusted.
                    if repo_dir.exists() {
                        let _ = std::fs::remove_dir_all(&repo_dir);
                    }
                    std::fs::create_dir_all(&repo_dir)?;
                    self.source
                        .fetch(reference, &sha, &repo_dir, cancel.clone())
                        .await?;
                    std::fs::write(repo_dir.join(".gale-complete"), &sha)?;
                } else {
                    tracing::debug!(target: "plan", "action cache hit for {}", key);
                }
                Ok::<PathBuf, anyhow::Error>(repo_dir.clone())
            })
            .await?
            .clone();

        Ok(match &reference.path {
            Some(subdir) => cached.join(subdir),
            None => cached,
        })
    }
}

// ---------------------------------------------------------------------------
// Git CLI source
// ---------------------------------------------------------------------------

static FULL_SHA: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"^[0-9a-f]{40}$").expect("valid sha regex"));

/// Fetches actions by shelling out to `git`.
pub struct GitCliSource {
    instance: String,
}

impl GitCliSource {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    fn clone_url(&self, reference: &ActionReference) -> String {
        format!(
            "https://{}/{}/{}.git",
            self.instance, reference.owner, reference.repo
        )
    }

    async fn git(
        args: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<String> {
        let (code, output) =
            ProcessInvoker::execute_captured(None, "git", &args, None, cancel).await?;
        if code != 0 {
            bail!("git {} failed with exit code {}", args.join(" "), code);
        }
        Ok(output)
    }
}

#[async_trait]
impl ActionSource for GitCliSource {
    async fn resolve_sha(
        &self,
        reference: &ActionReference,
        cancel: CancellationToken,
    ) -> Result<String> {
        if FULL_SHA.is_match(&reference.git_ref) {
            return Ok(reference.git_ref.clone());
        }

        let url = self.clone_url(reference);
        let output = Self::git(
            vec![
                "ls-remote".to_string(),
                url.clone(),
                reference.git_ref.clone(),
                format!("refs/tags/{}", reference.git_ref),
                format!("refs/heads/{}", reference.git_ref),
            ],
            cancel,
        )
        .await?;

        output
            .lines()
            .find_map(|line| line.split_whitespace().next())
            .map(String::from)
            .with_context(|| {
                format!("ref '{}' not found in {}", reference.git_ref, url)
            })
    }

    async fn fetch(
        &self,
        reference: &ActionReference,
        sha: &str,
        destination: &Path,
        cancel: CancellationToken,
    ) -> Result<()> {
        let url = self.clone_url(reference);
        let dest = destination.display().to_string();

        Self::git(
            vec!["clone".to_string(), "--quiet".to_string(), url, dest.clone()],
            cancel.clone(),
        )
        .await?;
        Self::git(
            vec![
                "-C".to_string(),
                dest.clone(),
                "checkout".to_string(),
                "--quiet".to_string(),
                sha.to_string(),
            ],
            cancel,
        )
        .await?;

        // The checkout is immutable content now; the metadata only wastes
        // space in the cache.
        let _ = std::fs::remove_dir_all(destination.join(".git"));
        Ok(())
    }
}
