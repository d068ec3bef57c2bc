/// Execution results and the error taxonomy shared by every runner.
///
/// Callers get a structured `ExecutionResult`; the legacy string contract
/// (`"Timeout!!! "` prefix, `"CritERROR!!!"` sentinel) is only rendered at the
/// edge via `legacy_text()`.
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Prefix marking an abandoned (timed out) invocation in the legacy contract.
pub const TIMEOUT_MARKER: &str = "Timeout!!! ";

/// Sentinel returned in place of output when a synchronous launch or read failed.
pub const CRIT_ERROR_SENTINEL: &str = "CritERROR!!!";

/// Terminal status of a supervised invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The child exited on its own before the budget ran out.
    Completed {
        /// Exit code (None if killed by signal).
        exit_code: Option<i32>,
    },
    /// The timeout budget ran out; the child was terminated.
    TimedOut,
    /// A background task faulted (read error, wait error, task panic).
    Failed { reason: String },
}

/// Result of a supervised invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    #[serde(flatten)]
    pub status: ExecutionStatus,
    /// Captured merged output (lossy UTF-8).
    pub output: String,
    /// Child PID (for logging/diagnostics).
    pub pid: Option<u32>,
    /// Wall-clock duration of the invocation in milliseconds.
    pub duration_ms: u64,
    /// True if output beyond the buffer cap was dropped.
    pub truncated: bool,
    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.status, ExecutionStatus::Completed { .. })
    }

    pub fn is_timed_out(&self) -> bool {
        self.status == ExecutionStatus::TimedOut
    }

    /// Render the result the way legacy callers expect it: the captured text,
    /// prefixed with `TIMEOUT_MARKER` when the invocation was abandoned.
    pub fn legacy_text(&self) -> String {
        match self.status {
            ExecutionStatus::TimedOut => format!("{TIMEOUT_MARKER}{}", self.output),
            _ => self.output.clone(),
        }
    }
}

/// Errors that abort an invocation before a result exists.
#[derive(Debug)]
pub enum ExecError {
    /// The argv was empty or named an empty program.
    InvalidCommand { reason: String },
    /// The child process could not be spawned.
    Launch {
        program: String,
        source: std::io::Error,
    },
    /// Reading the child's output or waiting on it failed.
    Io { source: std::io::Error },
    /// A background task died before reporting (panic or cancellation).
    Interrupted { task: &'static str, reason: String },
}

impl ExecError {
    /// Legacy string form of any error.
    pub fn legacy_text(&self) -> &'static str {
        CRIT_ERROR_SENTINEL
    }
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::InvalidCommand { reason } => write!(f, "invalid command: {}", reason),
            ExecError::Launch { program, source } => {
                write!(f, "failed to launch {}: {}", program, source)
            }
            ExecError::Io { source } => write!(f, "I/O error during execution: {}", source),
            ExecError::Interrupted { task, reason } => {
                write!(f, "{} task interrupted: {}", task, reason)
            }
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::Launch { source, .. } => Some(source),
            ExecError::Io { source } => Some(source),
            ExecError::InvalidCommand { .. } | ExecError::Interrupted { .. } => None,
        }
    }
}
