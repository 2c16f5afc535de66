// File-based workflow commands: each step receives GITHUB_ENV, GITHUB_PATH,
// GITHUB_OUTPUT, and GITHUB_STATE files. After the step terminates the
// files are parsed (single-line `K=V` and heredoc `K<<DELIM` forms) and
// applied to the run's cumulative state.

use std::path::Path;

use crate::execution_context::ExecutionContext;

/// The file commands every step receives.
const FILE_COMMANDS: &[&str] = &["GITHUB_ENV", "GITHUB_PATH", "GITHUB_OUTPUT", "GITHUB_STATE"];

pub struct FileCommandManager;

impl FileCommandManager {
    /// Create the command files for a step and record their paths. The
    /// environment variables pointing at them are injected by
    /// [`ExecutionContext::effective_environment`].
    pub fn initialize(context: &mut ExecutionContext) {
        let (host_dir, step_dir) = {
            let global = context.global();
            (global.envs_dir_host.clone(), global.envs_dir_step.clone())
        };

        for &name in FILE_COMMANDS {
            let file_name = format!(
                "{}_{}",
                name.to_lowercase(),
                uuid::Uuid::new_v4().as_simple()
            );
            let host_path = host_dir.join(&file_name);
            if let Err(err) = std::fs::write(&host_path, "") {
                context.warning(&format!(
                    "Failed to create {} file at {}: {}",
                    name,
                    host_path.display(),
                    err
                ));
                continue;
            }
            let step_path = format!("{}/{}", step_dir.trim_end_matches('/'), file_name);
            context
                .file_command_paths
                .insert(name.to_string(), (host_path, step_path));
        }
    }

    /// Parse and apply every file command, then delete the files. Applying
    /// an empty file is the identity.
    pub fn process(context: &mut ExecutionContext) {
        let paths = std::mem::take(&mut context.file_command_paths);
        for (name, (host_path, _)) in &paths {
            match name.as_str() {
                "GITHUB_ENV" => {
                    for (key, value) in Self::read_entries(context, host_path) {
                        context.debug(&format!("GITHUB_ENV: {}={}", key, value));
                        context.global_mut().environment.insert(key, value);
                    }
                }
                "GITHUB_PATH" => Self::apply_path_file(context, host_path),
                "GITHUB_OUTPUT" => {
                    for (key, value) in Self::read_entries(context, host_path) {
                        context.debug(&format!("GITHUB_OUTPUT: {}={}", key, value));
                        context.outputs.insert(key, value);
                    }
                }
                "GITHUB_STATE" => {
                    for (key, value) in Self::read_entries(context, host_path) {
                        context.debug(&format!("GITHUB_STATE: {}={}", key, value));
                        context.state.insert(key, value);
                    }
                }
                other => context.debug(&format!("Unknown file command: {}", other)),
            }
            let _ = std::fs::remove_file(host_path);
        }
    }

    /// Parse `KEY=VALUE` and `KEY<<DELIM ... DELIM` entries, in order.
    fn read_entries(context: &ExecutionContext, path: &Path) -> Vec<(String, String)> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                context.debug(&format!("Failed to read {}: {}", path.display(), err));
                return Vec::new();
            }
        };
        parse_key_value_file(&content)
    }

    fn apply_path_file(context: &mut ExecutionContext, path: &Path) {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                context.debug(&format!("Failed to read {}: {}", path.display(), err));
                return;
            }
        };
        for line in content.lines() {
            let entry = line.trim();
            if !entry.is_empty() {
                context.debug(&format!("GITHUB_PATH: prepending {}", entry));
                context.global_mut().prepend_path.push(entry.to_string());
            }
        }
    }
}

/// Shared parser for the env-file format.
pub fn parse_key_value_file(content: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }

        if let Some(heredoc_pos) = line.find("<<") {
            let name = line[..heredoc_pos].trim().to_string();
            let delimiter = line[heredoc_pos + 2..].trim().to_string();
            if name.is_empty() || delimiter.is_empty() {
                continue;
            }
            let mut value_lines = Vec::new();
            for value_line in lines.by_ref() {
                if value_line.trim() == delimiter {
                    break;
                }
                value_lines.push(value_line);
            }
            entries.push((name, value_lines.join("\n")));
        } else if let Some(eq_pos) = line.find('=') {
            let name = line[..eq_pos].trim().to_string();
            if name.is_empty() {
                continue;
            }
            entries.push((name, line[eq_pos + 1..].trim().to_string()));
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_context::testing;

    #[test]
    fn test_parse_simple_entries() {
        let entries = parse_key_value_file("FOO=bar\nBAZ = qux \n");
        assert_eq!(
            entries,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "qux".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_heredoc() {
        let entries = parse_key_value_file("NOTES<<EOF\nline1\nline2\nEOF\nAFTER=1\n");
        assert_eq!(
            entries,
            vec![
                ("NOTES".to_string(), "line1\nline2".to_string()),
                ("AFTER".to_string(), "1".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_empty_is_identity() {
        assert!(parse_key_value_file("").is_empty());
        assert!(parse_key_value_file("\n\n  \n").is_empty());
    }

    #[test]
    fn test_initialize_creates_files() {
        let (mut ctx, _dir) = testing::context();
        FileCommandManager::initialize(&mut ctx);

        assert_eq!(ctx.file_command_paths.len(), 4);
        for name in ["GITHUB_ENV", "GITHUB_PATH", "GITHUB_OUTPUT", "GITHUB_STATE"] {
            let (host_path, step_path) = ctx.file_command_paths.get(name).unwrap();
            assert!(host_path.exists());
            assert!(step_path.contains(&name.to_lowercase()));
        }

        // The paths surface as environment variables for the step.
        let env = ctx.effective_environment();
        assert!(env.contains_key("GITHUB_ENV"));
        assert!(env.contains_key("GITHUB_OUTPUT"));
    }

    #[test]
    fn test_process_env_and_path_files() {
        let (mut ctx, _dir) = testing::context();
        FileCommandManager::initialize(&mut ctx);

        let (env_file, _) = ctx.file_command_paths.get("GITHUB_ENV").unwrap().clone();
        std::fs::write(&env_file, "FOO=bar\nMULTI<<EOF\na\nb\nEOF\n").unwrap();
        let (path_file, _) = ctx.file_command_paths.get("GITHUB_PATH").unwrap().clone();
        std::fs::write(&path_file, "/opt/mine\n").unwrap();

        FileCommandManager::process(&mut ctx);

        assert_eq!(
            ctx.global().environment.get("FOO").map(String::as_str),
            Some("bar")
        );
        assert_eq!(
            ctx.global().environment.get("MULTI").map(String::as_str),
            Some("a\nb")
        );
        assert_eq!(ctx.global().prepend_path, vec!["/opt/mine"]);
        assert!(!env_file.exists());
        assert!(ctx.file_command_paths.is_empty());
    }

    #[test]
    fn test_process_output_and_state_files() {
        let (mut ctx, _dir) = testing::context();
        FileCommandManager::initialize(&mut ctx);

        let (output_file, _) = ctx.file_command_paths.get("GITHUB_OUTPUT").unwrap().clone();
        std::fs::write(&output_file, "k=v\n").unwrap();
        let (state_file, _) = ctx.file_command_paths.get("GITHUB_STATE").unwrap().clone();
        std::fs::write(&state_file, "post=cleanup\n").unwrap();

        FileCommandManager::process(&mut ctx);
        assert_eq!(ctx.outputs.get("k").map(String::as_str), Some("v"));
        assert_eq!(ctx.state.get("post").map(String::as_str), Some("cleanup"));
    }

    #[test]
    fn test_process_empty_files_is_identity() {
        let (mut ctx, _dir) = testing::context();
        ctx.global_mut()
            .environment
            .insert("EXISTING".to_string(), "1".to_string());
        FileCommandManager::initialize(&mut ctx);
        FileCommandManager::process(&mut ctx);

        assert_eq!(ctx.global().environment.len(), 1);
        assert!(ctx.outputs.is_empty());
        assert!(ctx.global().prepend_path.is_empty());
    }
}
