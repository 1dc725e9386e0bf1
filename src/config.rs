//! Service tunables.

use std::time::Duration;

/// Fallback deadline applied when `max_runtime` is zero.
pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(300);

/// Configuration for the execution service and its background loop.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Shared secret clients must present. `None` disables auth.
    pub auth_token: Option<String>,
    /// Initial command verbs. Empty allows everything.
    pub whitelist: Vec<String>,
    /// Requests per window per session id. `<= 0` disables limiting.
    pub rate_limit: i64,
    pub rate_window: Duration,
    /// Deadline for batch and streamed executions.
    pub max_runtime: Duration,
    /// Batch output cap in bytes. Zero means unlimited.
    pub max_output: usize,
    /// Reject command lines containing `|`, `&&`, `||` or `;`.
    pub block_chaining: bool,
    /// Permit `InteractiveShell`. A raw shell bypasses the chaining-block,
    /// so this is an explicit opt-in.
    pub allow_interactive: bool,
    /// Idle time after which the cleanup loop evicts a session.
    pub session_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Capacity of the bounded channel behind a streamed execution.
    pub stream_buffer: usize,
    /// Host shell prefix; the command line is appended as the last argument.
    pub shell: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            whitelist: Vec::new(),
            rate_limit: 60,
            rate_window: Duration::from_secs(60),
            max_runtime: DEFAULT_MAX_RUNTIME,
            max_output: 256 * 1024,
            block_chaining: true,
            allow_interactive: false,
            session_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            stream_buffer: 100,
            shell: default_shell(),
        }
    }
}

impl ServiceConfig {
    pub fn effective_max_runtime(&self) -> Duration {
        if self.max_runtime.is_zero() {
            DEFAULT_MAX_RUNTIME
        } else {
            self.max_runtime
        }
    }
}

#[cfg(windows)]
fn default_shell() -> Vec<String> {
    vec!["cmd".to_string(), "/c".to_string()]
}

#[cfg(not(windows))]
fn default_shell() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_runtime_falls_back_to_default() {
        let config = ServiceConfig {
            max_runtime: Duration::ZERO,
            ..ServiceConfig::default()
        };
        assert_eq!(config.effective_max_runtime(), DEFAULT_MAX_RUNTIME);
    }
}
