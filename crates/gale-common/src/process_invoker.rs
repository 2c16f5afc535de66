// Process invocation: spawns a child process, streams stdout/stderr as line
// events over a channel, and kills the process tree on cancellation.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::executor::Cancelled;

/// Which stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A single line of process output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub data: String,
}

/// Sender half of the output channel handed to process / container exec.
pub type OutputSender = mpsc::UnboundedSender<OutputLine>;

/// Spawns processes and multiplexes their output by line.
pub struct ProcessInvoker;

impl ProcessInvoker {
    /// Run `file_name` with `arguments`, forwarding each output line to
    /// `output`. Environment entries are overlaid on the inherited process
    /// environment. Returns the exit code; a cancelled token kills the
    /// process and yields a [`Cancelled`] error.
    pub async fn execute(
        working_directory: Option<&Path>,
        file_name: &str,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        output: OutputSender,
        cancel: CancellationToken,
    ) -> Result<i32> {
        let mut cmd = Command::new(file_name);
        cmd.args(arguments);

        if let Some(dir) = working_directory {
            if dir.is_dir() {
                cmd.current_dir(dir);
            }
        }

        if let Some(env) = environment {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        // A dropped future (step timeout) must not leak the child.
        cmd.kill_on_drop(true);

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to start process '{}' with arguments {:?}",
                file_name, arguments
            )
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::debug!(target: "process", "started '{}' (pid {})", file_name, pid);

        let stdout = child.stdout.take();
        let stdout_tx = output.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stdout_tx.send(OutputLine {
                        stream: OutputStream::Stdout,
                        data: line,
                    });
                }
            }
        });

        let stderr = child.stderr.take();
        let stderr_tx = output;
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stderr_tx.send(OutputLine {
                        stream: OutputStream::Stderr,
                        data: line,
                    });
                }
            }
        });

        let exit_code;
        let was_cancelled;

        tokio::select! {
            status = child.wait() => {
                was_cancelled = false;
                exit_code = status.context("Failed to wait for process")?.code().unwrap_or(-1);
            }
            _ = cancel.cancelled() => {
                was_cancelled = true;
                tracing::debug!(target: "process", "cancellation requested, killing pid {}", pid);
                let _ = child.kill().await;
                exit_code = child.wait().await.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);
            }
        }

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        tracing::debug!(
            target: "process",
            "pid {} exited with code {} after {:.2?}",
            pid,
            exit_code,
            start.elapsed()
        );

        if was_cancelled {
            return Err(Cancelled.into());
        }

        Ok(exit_code)
    }

    /// Run a process and collect its stdout into a string, for short
    /// non-streaming invocations (e.g. CLI queries).
    pub async fn execute_captured(
        working_directory: Option<&Path>,
        file_name: &str,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        cancel: CancellationToken,
    ) -> Result<(i32, String)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let exit_code = Self::execute(
            working_directory,
            file_name,
            arguments,
            environment,
            tx,
            cancel,
        )
        .await?;

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            if line.stream == OutputStream::Stdout {
                lines.push(line.data);
            }
        }
        Ok((exit_code, lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_execute_captures_stdout() {
        let (code, output) = ProcessInvoker::execute_captured(
            None,
            "echo",
            &args(&["hello"]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let (code, _) = ProcessInvoker::execute_captured(
            None,
            "sh",
            &args(&["-c", "exit 3"]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_execute_env_override() {
        let mut env = HashMap::new();
        env.insert("GALE_TEST_VAR".to_string(), "value-123".to_string());
        let (code, output) = ProcessInvoker::execute_captured(
            None,
            "sh",
            &args(&["-c", "echo $GALE_TEST_VAR"]),
            Some(&env),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
        assert_eq!(output, "value-123");
    }

    #[tokio::test]
    async fn test_execute_nonexistent_program() {
        let result = ProcessInvoker::execute_captured(
            None,
            "gale-does-not-exist-xyz",
            &[],
            None,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let result = ProcessInvoker::execute_captured(
            None,
            "sleep",
            &args(&["30"]),
            None,
            cancel,
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.chain().any(|c| c.is::<Cancelled>()));
    }

    #[tokio::test]
    async fn test_stderr_lines_are_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let code = ProcessInvoker::execute(
            None,
            "sh",
            &args(&["-c", "echo out; echo err >&2"]),
            None,
            tx,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let mut streams = Vec::new();
        while let Ok(line) = rx.try_recv() {
            streams.push((line.stream, line.data));
        }
        assert!(streams.contains(&(OutputStream::Stdout, "out".to_string())));
        assert!(streams.contains(&(OutputStream::Stderr, "err".to_string())));
    }
}
