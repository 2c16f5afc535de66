// Secret masking: a thread-safe store of secret values replaced with `***`
// in every line before it reaches a log sink.

use parking_lot::RwLock;
use std::sync::Arc;

const MASK: &str = "***";

/// Replaces registered secret values in arbitrary strings with `***`.
///
/// Cloning shares the underlying store, so masks added mid-run (via
/// `add-mask` workflow commands) apply everywhere immediately.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    inner: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value to be masked. Empty and whitespace-only values are
    /// ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }
        let mut secrets = self.inner.write();
        if !secrets.iter().any(|s| s == trimmed) {
            secrets.push(trimmed.to_string());
            // Longest first, so a secret that contains another is masked
            // whole rather than partially.
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    /// Replace every registered secret in `input` with `***`.
    pub fn mask(&self, input: &str) -> String {
        let secrets = self.inner.read();
        if secrets.is_empty() {
            return input.to_string();
        }
        let mut result = input.to_string();
        for secret in secrets.iter() {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }

    pub fn secret_count(&self) -> usize {
        self.inner.read().len()
    }
}
