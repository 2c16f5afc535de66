// The `runner.*` expression context and the RUNNER_* environment.

use serde_json::Value;

/// The `runner` context available to expressions.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RunnerContext {
    /// "Linux", "Windows", or "macOS".
    pub os: String,
    /// "X64", "ARM64", ...
    pub arch: String,
    pub name: String,
    /// Temp directory as seen by steps.
    pub temp: String,
    /// Tool cache directory as seen by steps.
    pub tool_cache: String,
}

impl RunnerContext {
    /// A context for a containerised Linux job with the given temp dir.
    pub fn for_container(name: &str, temp: &str) -> Self {
        Self {
            os: "Linux".to_string(),
            arch: detect_arch(),
            name: name.to_string(),
            temp: temp.to_string(),
            tool_cache: "/opt/hostedtoolcache".to_string(),
        }
    }

    /// A context for host execution.
    pub fn for_host(name: &str) -> Self {
        Self {
            os: detect_os(),
            arch: detect_arch(),
            name: name.to_string(),
            temp: std::env::temp_dir().to_string_lossy().to_string(),
            tool_cache: std::env::temp_dir()
                .join("gale-tool-cache")
                .to_string_lossy()
                .to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }

    pub fn to_environment(&self) -> Vec<(String, String)> {
        vec![
            ("RUNNER_NAME".to_string(), self.name.clone()),
            ("RUNNER_OS".to_string(), self.os.clone()),
            ("RUNNER_ARCH".to_string(), self.arch.clone()),
            ("RUNNER_TEMP".to_string(), self.temp.clone()),
            ("RUNNER_TOOL_CACHE".to_string(), self.tool_cache.clone()),
        ]
    }
}

fn detect_os() -> String {
    match std::env::consts::OS {
        "linux" => "Linux".to_string(),
        "macos" => "macOS".to_string(),
        "windows" => "Windows".to_string(),
        other => other.to_string(),
    }
}

fn detect_arch() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "X64".to_string(),
        "aarch64" => "ARM64".to_string(),
        "arm" => "ARM".to_string(),
        "x86" => "X86".to_string(),
        other => other.to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_context() {
        let ctx = RunnerContext::for_container("gale-worker", "/tmp/step");
        assert_eq!(ctx.os, "Linux");
        assert_eq!(ctx.temp, "/tmp/step");
        assert_eq!(ctx.tool_cache, "/opt/hostedtoolcache");
    }

    #[test]
    fn test_host_context() {
        let ctx = RunnerContext::for_host("gale-worker");
        assert!(!ctx.os.is_empty());
        assert!(!ctx.arch.is_empty());
        assert!(!ctx.temp.is_empty());
    }

    #[test]
    fn test_environment_variables() {
        let env = RunnerContext::for_container("w", "/tmp").to_environment();
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "RUNNER_NAME",
                "RUNNER_OS",
                "RUNNER_ARCH",
                "RUNNER_TEMP",
                "RUNNER_TOOL_CACHE"
            ]
        );
    }
}
