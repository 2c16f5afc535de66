// The `steps.*` expression context: outcome, conclusion, and outputs of
// every step that has reached a terminal state in the current run.

use std::collections::HashMap;

use gale_common::TaskResult;

/// Recorded result for a single step.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepResult {
    /// Status before `continue-on-error` adjustment.
    pub outcome: String,
    /// Status after `continue-on-error` adjustment.
    pub conclusion: String,
    pub outputs: HashMap<String, String>,
}

/// Accumulates step results in execution order.
#[derive(Debug, Clone, Default)]
pub struct StepsContext {
    results: Vec<(String, StepResult)>,
}

impl StepsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a step's terminal state. The entry becomes visible to
    /// expressions immediately.
    pub fn record(
        &mut self,
        step_id: &str,
        outcome: TaskResult,
        conclusion: TaskResult,
        outputs: HashMap<String, String>,
    ) {
        let result = StepResult {
            outcome: outcome.status_str().to_string(),
            conclusion: conclusion.status_str().to_string(),
            outputs,
        };
        if let Some(entry) = self.results.iter_mut().find(|(id, _)| id == step_id) {
            entry.1 = result;
        } else {
            self.results.push((step_id.to_string(), result));
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.results
            .iter()
            .find(|(id, _)| id == step_id)
            .map(|(_, r)| r)
    }

    pub fn get_output(&self, step_id: &str, name: &str) -> Option<&str> {
        self.get(step_id)
            .and_then(|r| r.outputs.get(name))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The `steps` context object for expression evaluation.
    pub fn to_value(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (id, result) in &self.results {
            let mut outputs = serde_json::Map::new();
            for (key, value) in &result.outputs {
                outputs.insert(key.clone(), serde_json::Value::String(value.clone()));
            }
            let mut step = serde_json::Map::new();
            step.insert(
                "outcome".to_string(),
                serde_json::Value::String(result.outcome.clone()),
            );
            step.insert(
                "conclusion".to_string(),
                serde_json::Value::String(result.conclusion.clone()),
            );
            step.insert("outputs".to_string(), serde_json::Value::Object(outputs));
            map.insert(id.clone(), serde_json::Value::Object(step));
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let mut ctx = StepsContext::new();
        let mut outputs = HashMap::new();
        outputs.insert("k".to_string(), "v".to_string());
        ctx.record("s1", TaskResult::Succeeded, TaskResult::Succeeded, outputs);

        assert_eq!(ctx.get("s1").unwrap().outcome, "success");
        assert_eq!(ctx.get_output("s1", "k"), Some("v"));
        assert_eq!(ctx.get_output("s1", "missing"), None);
        assert!(ctx.get("other").is_none());
    }

    #[test]
    fn test_outcome_conclusion_divergence() {
        let mut ctx = StepsContext::new();
        ctx.record(
            "flaky",
            TaskResult::Failed,
            TaskResult::Succeeded,
            HashMap::new(),
        );
        let result = ctx.get("flaky").unwrap();
        assert_eq!(result.outcome, "failure");
        assert_eq!(result.conclusion, "success");
    }

    #[test]
    fn test_to_value_shape() {
        let mut ctx = StepsContext::new();
        let mut outputs = HashMap::new();
        outputs.insert("k".to_string(), "v".to_string());
        ctx.record("s1", TaskResult::Succeeded, TaskResult::Succeeded, outputs);

        let value = ctx.to_value();
        assert_eq!(value["s1"]["outcome"], "success");
        assert_eq!(value["s1"]["conclusion"], "success");
        assert_eq!(value["s1"]["outputs"]["k"], "v");
    }

    #[test]
    fn test_skipped_step_recorded() {
        let mut ctx = StepsContext::new();
        ctx.record("s", TaskResult::Skipped, TaskResult::Skipped, HashMap::new());
        assert_eq!(ctx.get("s").unwrap().conclusion, "skipped");
    }
}
