// TaskResult: terminal status of a step, job run, or plan element.
// The same enum serves as both "outcome" (raw) and "conclusion"
// (continue-on-error adjusted); the two are recorded separately.

/// Terminal status of a unit of work.
///
/// Ordering is by severity: a later variant never downgrades an earlier one
/// when results are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskResult {
    Succeeded,
    Failed,
    Canceled,
    Skipped,
}

impl TaskResult {
    /// The GitHub Actions status string used in the `steps` and `needs`
    /// expression contexts.
    pub fn status_str(self) -> &'static str {
        match self {
            TaskResult::Succeeded => "success",
            TaskResult::Failed => "failure",
            TaskResult::Canceled => "cancelled",
            TaskResult::Skipped => "skipped",
        }
    }

    /// Whether this result counts as a success for implicit step guards.
    pub fn is_success(self) -> bool {
        matches!(self, TaskResult::Succeeded | TaskResult::Skipped)
    }

    /// Merge an incoming result into the current aggregate, keeping the
    /// worst of the two. Cancellation is sticky; a skipped unit never
    /// degrades the aggregate.
    pub fn merge(current: Option<TaskResult>, incoming: TaskResult) -> TaskResult {
        match current {
            None => incoming,
            Some(TaskResult::Canceled) => TaskResult::Canceled,
            Some(current) => {
                if incoming == TaskResult::Skipped {
                    return current;
                }
                if incoming > current {
                    incoming
                } else {
                    current
                }
            }
        }
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.status_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(TaskResult::Succeeded.status_str(), "success");
        assert_eq!(TaskResult::Failed.status_str(), "failure");
        assert_eq!(TaskResult::Canceled.status_str(), "cancelled");
        assert_eq!(TaskResult::Skipped.status_str(), "skipped");
    }

    #[test]
    fn test_merge_none() {
        assert_eq!(
            TaskResult::merge(None, TaskResult::Succeeded),
            TaskResult::Succeeded
        );
    }

    #[test]
    fn test_merge_failure_wins() {
        assert_eq!(
            TaskResult::merge(Some(TaskResult::Succeeded), TaskResult::Failed),
            TaskResult::Failed
        );
        assert_eq!(
            TaskResult::merge(Some(TaskResult::Failed), TaskResult::Succeeded),
            TaskResult::Failed
        );
    }

    #[test]
    fn test_merge_cancelled_sticky() {
        assert_eq!(
            TaskResult::merge(Some(TaskResult::Canceled), TaskResult::Failed),
            TaskResult::Canceled
        );
    }

    #[test]
    fn test_merge_skipped_does_not_degrade() {
        assert_eq!(
            TaskResult::merge(Some(TaskResult::Succeeded), TaskResult::Skipped),
            TaskResult::Succeeded
        );
        assert_eq!(
            TaskResult::merge(Some(TaskResult::Failed), TaskResult::Skipped),
            TaskResult::Failed
        );
    }
}
