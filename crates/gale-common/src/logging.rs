// Per-run log files. Each Run gets one file under the invocation's state
// directory; lines are timestamped and already secret-masked by the caller.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;

/// Appends log lines for a single Run to its log file.
#[derive(Debug)]
pub struct RunLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLogger {
    /// Create (or truncate) the log file for a Run under `dir`. The file is
    /// named after the run key with a `.log` extension.
    pub fn create(dir: &Path, run_key: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let path = dir.join(format!("{}.log", sanitize_file_name(run_key)));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line, prefixed with a UTC timestamp.
    pub fn write_line(&self, line: &str) {
        let stamped = format!(
            "{} {}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            line
        );
        let mut file = self.file.lock();
        if let Err(err) = file.write_all(stamped.as_bytes()) {
            tracing::warn!(target: "log", "failed to write run log: {}", err);
        }
    }
}

/// Replace characters that are awkward in file names.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
