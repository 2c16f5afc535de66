// The Handler contract shared by all step variants, plus the helpers all
// handlers use: INPUT_* projection and output-line processing.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use gale_common::process_invoker::OutputLine;

use crate::action_command_manager::ActionCommandManager;
use crate::action_manifest::ActionDefinition;
use crate::execution_context::ExecutionContext;
use crate::expressions::EvaluationContext;

/// Everything a handler needs to execute one step.
pub struct HandlerData {
    /// Step identity for errors and logs.
    pub step_key: String,
    /// Evaluated `with:` inputs.
    pub inputs: HashMap<String, String>,
    /// The frozen expression snapshot the step was prepared against.
    pub eval: EvaluationContext,
    /// Resolved action information, for `uses:` steps.
    pub action: ActionContext,
}

/// The resolved action behind a `uses:` step.
#[derive(Default)]
pub struct ActionContext {
    /// The original reference, for display.
    pub reference: Option<String>,
    /// Action directory on the host.
    pub directory_host: Option<PathBuf>,
    /// The same directory as steps inside the job container see it.
    pub directory_step: Option<String>,
    /// The parsed manifest.
    pub definition: Option<ActionDefinition>,
}

/// A step execution strategy. Returns `Ok(())` on success and a
/// [`crate::errors::StepError`] on failure.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(
        &self,
        context: &mut ExecutionContext,
        data: &HandlerData,
    ) -> anyhow::Result<()>;
}

/// Project step inputs as `INPUT_<UPPER_NAME>` variables, the contract
/// every action runtime expects.
pub fn input_environment(inputs: &HashMap<String, String>) -> HashMap<String, String> {
    inputs
        .iter()
        .map(|(name, value)| {
            (
                format!("INPUT_{}", name.to_uppercase().replace([' ', '-'], "_")),
                value.clone(),
            )
        })
        .collect()
}

/// Drain buffered output lines: workflow commands mutate the context, plain
/// lines go to the log. Ordering within each stream is preserved.
pub fn process_output_lines(
    context: &mut ExecutionContext,
    commands: &mut ActionCommandManager,
    receiver: &mut tokio::sync::mpsc::UnboundedReceiver<OutputLine>,
) {
    while let Ok(line) = receiver.try_recv() {
        if !commands.try_process_command(context, &line.data) {
            context.write(&line.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_environment_naming() {
        let mut inputs = HashMap::new();
        inputs.insert("who-to-greet".to_string(), "World".to_string());
        inputs.insert("fetch depth".to_string(), "1".to_string());

        let env = input_environment(&inputs);
        assert_eq!(
            env.get("INPUT_WHO_TO_GREET").map(String::as_str),
            Some("World")
        );
        assert_eq!(env.get("INPUT_FETCH_DEPTH").map(String::as_str), Some("1"));
    }
}
