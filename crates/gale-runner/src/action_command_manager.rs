// Processes workflow commands (`::name k=v::data`) found in step output.
// Lines that are not commands are returned to the caller for plain logging.

use std::collections::HashSet;

use gale_common::ActionCommand;
use once_cell::sync::Lazy;

use crate::execution_context::ExecutionContext;

static REGISTERED_COMMANDS: Lazy<HashSet<String>> = Lazy::new(|| {
    [
        "set-output",
        "set-env",
        "add-path",
        "add-mask",
        "save-state",
        "stop-commands",
        "debug",
        "notice",
        "warning",
        "error",
        "group",
        "endgroup",
        "echo",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
});

/// Environment names a step is never allowed to set dynamically.
const PROTECTED_ENV: &[&str] = &["github_env", "github_path", "github_output", "github_state"];

/// Per-step workflow command processor.
pub struct ActionCommandManager {
    /// While set, all commands except the matching resume token are inert.
    stop_token: Option<String>,
    echo_commands: bool,
}

impl ActionCommandManager {
    pub fn new() -> Self {
        Self {
            stop_token: None,
            echo_commands: false,
        }
    }

    /// Process one output line. Returns `true` when the line was consumed
    /// as a command; `false` means it is plain output.
    pub fn try_process_command(&mut self, context: &mut ExecutionContext, line: &str) -> bool {
        if line.is_empty() {
            return false;
        }

        // While stopped, only the resume token line is recognised.
        if let Some(token) = self.stop_token.clone() {
            let resume: HashSet<String> = [token.clone()].into_iter().collect();
            if let Some(command) = ActionCommand::try_parse(line, &resume) {
                if command.command == token {
                    self.stop_token = None;
                    context.debug("Resuming workflow commands.");
                    return true;
                }
            }
            return false;
        }

        let Some(command) = ActionCommand::try_parse(line, &REGISTERED_COMMANDS) else {
            return false;
        };

        if self.echo_commands {
            context.write(line);
        }
        self.dispatch(context, &command);
        true
    }

    fn dispatch(&mut self, context: &mut ExecutionContext, command: &ActionCommand) {
        match command.command.as_str() {
            "set-output" => self.handle_set_output(context, command),
            "set-env" => self.handle_set_env(context, command),
            "add-path" => self.handle_add_path(context, command),
            "add-mask" => self.handle_add_mask(context, command),
            "save-state" => self.handle_save_state(context, command),
            "stop-commands" => self.handle_stop_commands(context, command),
            "debug" => context.debug(&command.data),
            "notice" => context.info(&format!("Notice: {}", annotation(command))),
            "warning" => context.warning(&annotation(command)),
            "error" => context.error(&annotation(command)),
            "group" => context.section(&command.data),
            "endgroup" => context.end_section(),
            "echo" => self.handle_echo(context, command),
            unknown => context.warning(&format!("Unknown workflow command: {}", unknown)),
        }
    }

    fn handle_set_output(&self, context: &mut ExecutionContext, command: &ActionCommand) {
        let Some(name) = non_empty_property(command, "name") else {
            context.warning("'set-output' requires a 'name' property.");
            return;
        };
        context.debug(&format!("Set output {}={}", name, command.data));
        context.outputs.insert(name, command.data.clone());
    }

    fn handle_set_env(&self, context: &mut ExecutionContext, command: &ActionCommand) {
        let Some(name) = non_empty_property(command, "name") else {
            context.warning("'set-env' requires a 'name' property.");
            return;
        };
        if PROTECTED_ENV.iter().any(|p| name.eq_ignore_ascii_case(p)) {
            context.warning(&format!("Setting '{}' is not allowed.", name));
            return;
        }
        context.debug(&format!("Set env {}={}", name, command.data));
        context
            .global_mut()
            .environment
            .insert(name, command.data.clone());
    }

    fn handle_add_path(&self, context: &mut ExecutionContext, command: &ActionCommand) {
        let path = command.data.trim().to_string();
        if path.is_empty() {
            context.warning("'add-path' requires a non-empty path.");
            return;
        }
        context.debug(&format!("Prepending PATH: {}", path));
        context.global_mut().prepend_path.push(path);
    }

    fn handle_add_mask(&self, context: &mut ExecutionContext, command: &ActionCommand) {
        let value = command.data.trim().to_string();
        if value.is_empty() {
            context.debug("'add-mask' received an empty value, ignoring.");
            return;
        }
        context.global().masker.add_value(&value);
        context.debug("Registered a new secret mask.");
    }

    fn handle_save_state(&self, context: &mut ExecutionContext, command: &ActionCommand) {
        let Some(name) = non_empty_property(command, "name") else {
            context.warning("'save-state' requires a 'name' property.");
            return;
        };
        context.debug(&format!("Saved state {}={}", name, command.data));
        context.state.insert(name, command.data.clone());
    }

    fn handle_stop_commands(&mut self, context: &mut ExecutionContext, command: &ActionCommand) {
        let token = command.data.trim().to_string();
        if token.is_empty() {
            context.warning("'stop-commands' requires a resume token.");
            return;
        }
        context.debug(&format!("Workflow commands stopped until '{}'.", token));
        self.stop_token = Some(token);
    }

    fn handle_echo(&mut self, context: &mut ExecutionContext, command: &ActionCommand) {
        match command.data.trim().to_lowercase().as_str() {
            "on" => self.echo_commands = true,
            "off" => self.echo_commands = false,
            other => context.warning(&format!("'echo' expects on/off, got '{}'", other)),
        }
    }
}

impl Default for ActionCommandManager {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty_property(command: &ActionCommand, name: &str) -> Option<String> {
    command
        .properties
        .get(name)
        .filter(|v| !v.is_empty())
        .cloned()
}

/// Format an annotation message with its file/line properties, when given.
fn annotation(command: &ActionCommand) -> String {
    let mut location = Vec::new();
    for key in ["file", "line", "col"] {
        if let Some(value) = command.properties.get(key) {
            if !value.is_empty() {
                location.push(format!("{}={}", key, value));
            }
        }
    }
    if location.is_empty() {
        command.data.clone()
    } else {
        format!("{}: {}", location.join(","), command.data)
    }
}
