// Error taxonomy for step execution and container backends. Step errors
// carry their kind and the step identity; backend errors distinguish
// transient failures (retried once) from permanent ones.

use std::time::Duration;

/// A structured step failure.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step '{step}': expression evaluation failed: {message}")]
    ExpressionEval { step: String, message: String },

    #[error("step '{step}': exit with `FAILURE`: {code}")]
    ScriptExitNonZero { step: String, code: i32 },

    #[error("step '{step}': docker exec failed: {message}")]
    DockerExec { step: String, message: String },

    #[error("step '{step}': exceeded the maximum execution time of {minutes} minutes")]
    Timeout { step: String, minutes: u64 },

    #[error("step '{step}': cancelled")]
    Cancelled { step: String },
}

impl StepError {
    /// The identity of the failing step.
    pub fn step(&self) -> &str {
        match self {
            StepError::ExpressionEval { step, .. }
            | StepError::ScriptExitNonZero { step, .. }
            | StepError::DockerExec { step, .. }
            | StepError::Timeout { step, .. }
            | StepError::Cancelled { step } => step,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled { .. })
    }
}

/// A container-backend failure.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The engine was momentarily unavailable; the operation may be retried.
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// Delay before the single retry of a transient backend failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Run a backend operation, retrying exactly once (after a short backoff)
/// when the failure is transient.
pub async fn with_transient_retry<T, F, Fut>(operation: F) -> Result<T, BackendError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, BackendError>>,
{
    match operation().await {
        Err(err) if err.is_transient() => {
            tracing::warn!(target: "docker", "transient backend failure, retrying once: {}", err);
            tokio::time::sleep(RETRY_BACKOFF).await;
            operation().await
        }
        other => other,
    }
}
