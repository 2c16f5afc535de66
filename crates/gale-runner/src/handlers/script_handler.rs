// Executes `run:` steps: the script is materialised to a host-side file in
// the run's env directory (which the container sees through its mount),
// then invoked via the shell command template.

use async_trait::async_trait;
use anyhow::{Context as _, Result};

use gale_model::workflow::shell_command_template;

use crate::action_command_manager::ActionCommandManager;
use crate::config::resolve_working_directory;
use crate::container::{ContainerBackend as _, ExecSpec};
use crate::errors::{BackendError, StepError};
use crate::execution_context::ExecutionContext;
use crate::handlers::handler::{process_output_lines, Handler, HandlerData};

pub struct ScriptHandler;

impl ScriptHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for ScriptHandler {
    async fn run(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()> {
        let script = data.inputs.get("script").cloned().unwrap_or_default();
        if script.trim().is_empty() {
            context.debug("Script body is empty, nothing to run.");
            return Ok(());
        }

        let shell = data
            .inputs
            .get("shell")
            .cloned()
            .filter(|s| !s.is_empty())
            .or_else(|| context.global().default_shell.clone())
            .unwrap_or_default();
        let template = shell_command_template(&shell);

        // Materialise the script next to the env files; the container sees
        // it through the same mount.
        let file_name = format!(
            "script_{}.{}",
            uuid::Uuid::new_v4().as_simple(),
            script_extension(&shell)
        );
        let (host_path, step_path) = {
            let global = context.global();
            (
                global.envs_dir_host.join(&file_name),
                format!(
                    "{}/{}",
                    global.envs_dir_step.trim_end_matches('/'),
                    file_name
                ),
            )
        };

        let body = if script.ends_with('\n') {
            script.clone()
        } else {
            format!("{}\n", script)
        };
        std::fs::write(&host_path, body)
            .with_context(|| format!("failed to write script {}", host_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(0o755));
        }

        let command = build_command_line(&template, &step_path);
        context.debug(&format!("Shell command: {}", command.join(" ")));

        let working_directory = {
            let global = context.global();
            let relative = data
                .inputs
                .get("working-directory")
                .cloned()
                .filter(|s| !s.is_empty())
                .or_else(|| global.default_working_directory.clone());
            resolve_working_directory(&global.workspace_directory, relative.as_deref())
        };

        let exec = ExecSpec {
            command,
            env: context.effective_environment(),
            working_directory: Some(working_directory),
        };

        let (backend, container_id) = {
            let global = context.global();
            let container = global.container.as_ref().ok_or_else(|| {
                StepError::DockerExec {
                    step: data.step_key.clone(),
                    message: "no job container allocated".to_string(),
                }
            })?;
            (container.backend.clone(), container.id.clone())
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let exit_code = backend
            .exec(&container_id, exec, tx, context.cancel_token())
            .await;

        let mut commands = ActionCommandManager::new();
        process_output_lines(context, &mut commands, &mut rx);
        let _ = std::fs::remove_file(&host_path);

        let exit_code = match exit_code {
            Ok(code) => code,
            Err(BackendError::Cancelled) => {
                return Err(StepError::Cancelled {
                    step: data.step_key.clone(),
                }
                .into())
            }
            Err(err) => {
                return Err(StepError::DockerExec {
                    step: data.step_key.clone(),
                    message: err.to_string(),
                }
                .into())
            }
        };

        if exit_code != 0 {
            context.error(&format!("Process completed with exit code {}.", exit_code));
            return Err(StepError::ScriptExitNonZero {
                step: data.step_key.clone(),
                code: exit_code,
            }
            .into());
        }
        Ok(())
    }
}

/// Substitute `{0}` in the shell template and split into argv, dropping
/// quotes that wrapped the placeholder.
fn build_command_line(template: &str, script_path: &str) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| {
            let substituted = token.replace("{0}", script_path);
            strip_matching_quotes(&substituted)
        })
        .collect()
}

fn strip_matching_quotes(token: &str) -> String {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return token[1..token.len() - 1].to_string();
        }
    }
    token.to_string()
}

/// File extension for the script, by shell.
fn script_extension(shell: &str) -> &'static str {
    let base = shell.split_whitespace().next().unwrap_or("");
    let base = std::path::Path::new(base)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(base);
    match base.to_lowercase().as_str() {
        "" | "bash" | "sh" | "zsh" => "sh",
        "pwsh" | "powershell" => "ps1",
        "python" | "python3" => "py",
        "cmd" => "cmd",
        "node" => "js",
        _ => "sh",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command_line_bash() {
        let command = build_command_line(
            "bash --noprofile --norc -e -o pipefail {0}",
            "/var/run/gale/envs/script.sh",
        );
        assert_eq!(
            command,
            vec![
                "bash",
                "--noprofile",
                "--norc",
                "-e",
                "-o",
                "pipefail",
                "/var/run/gale/envs/script.sh"
            ]
        );
    }

    #[test]
    fn test_build_command_line_quoted_placeholder() {
        let command = build_command_line("pwsh -command . '{0}'", "/tmp/s.ps1");
        assert_eq!(command, vec!["pwsh", "-command", ".", "/tmp/s.ps1"]);
    }

    #[test]
    fn test_build_command_line_custom_shell() {
        let command = build_command_line("zsh -l {0}", "/tmp/s.sh");
        assert_eq!(command, vec!["zsh", "-l", "/tmp/s.sh"]);
    }

    #[test]
    fn test_script_extension() {
        assert_eq!(script_extension(""), "sh");
        assert_eq!(script_extension("bash"), "sh");
        assert_eq!(script_extension("python"), "py");
        assert_eq!(script_extension("pwsh"), "ps1");
        assert_eq!(script_extension("/usr/bin/python3"), "py");
        assert_eq!(script_extension("ruby -e"), "sh");
    }
}
