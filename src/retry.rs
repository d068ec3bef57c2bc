use crate::command::CommandSpec;
use crate::config::{EscalationConfig, InstallerConfig, RunnerConfig};
use crate::outcome::{ExecError, ExecutionResult};
use crate::session::run_with_timeout;
use crate::sink::SharedSink;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

/// Decision returned by the escalation policy after evaluating an attempt's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationDecision {
    /// Output looks fine; keep this attempt.
    Accept,
    /// Output carries the failure marker; re-run with elevated privileges.
    Escalate,
}

/// Single-step escalation policy.
///
/// The primary attempt is accepted unless its output contains
/// `failure_marker`, in which case the elevated variant gets exactly one try.
/// There is no backoff and no further escalation.
pub struct EscalationPolicy {
    failure_marker: String,
}

impl EscalationPolicy {
    pub fn new(failure_marker: impl Into<String>) -> Self {
        Self {
            failure_marker: failure_marker.into(),
        }
    }

    pub fn from_config(config: &EscalationConfig) -> Self {
        Self::new(config.failure_marker.clone())
    }

    /// Evaluate the primary attempt's output.
    ///
    /// An empty marker never escalates.
    pub fn evaluate(&self, output: &str) -> EscalationDecision {
        if !self.failure_marker.is_empty() && output.contains(&self.failure_marker) {
            warn!(
                marker = %self.failure_marker,
                "failure marker found, escalating to elevated command"
            );
            EscalationDecision::Escalate
        } else {
            EscalationDecision::Accept
        }
    }
}

/// Outcome of an escalating invocation: the last attempt that ran.
#[derive(Debug, Clone, Serialize)]
pub struct Escalated {
    /// 1 if the primary attempt was kept, 2 if the elevated attempt ran.
    pub attempts: u32,
    pub elevated: bool,
    pub result: ExecutionResult,
}

/// Run `primary` with a fixed timeout; if the policy says so, run `elevated`
/// with the same timeout and return that instead.
pub async fn run_escalating(
    primary: &CommandSpec,
    elevated: &CommandSpec,
    timeout: Duration,
    policy: &EscalationPolicy,
    runner: &RunnerConfig,
    sink: SharedSink,
) -> Result<Escalated, ExecError> {
    let first = run_with_timeout(primary, timeout, runner, sink.clone()).await?;

    let escalated = match policy.evaluate(&first.output) {
        EscalationDecision::Accept => Escalated {
            attempts: 1,
            elevated: false,
            result: first,
        },
        EscalationDecision::Escalate => {
            let second = run_with_timeout(elevated, timeout, runner, sink.clone()).await?;
            Escalated {
                attempts: 2,
                elevated: true,
                result: second,
            }
        }
    };

    sink.line(&escalated.result.legacy_text());
    Ok(escalated)
}

/// The native installer tool and its elevated twin.
pub struct Installer {
    installer: InstallerConfig,
    escalation: EscalationConfig,
    runner: RunnerConfig,
}

impl Installer {
    pub fn new(
        installer: InstallerConfig,
        escalation: EscalationConfig,
        runner: RunnerConfig,
    ) -> Self {
        Self {
            installer,
            escalation,
            runner,
        }
    }

    /// Primary and elevated command lines for the given installer arguments.
    pub fn commands(&self, args: &[String]) -> Result<(CommandSpec, CommandSpec), ExecError> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.installer.program_path());
        argv.extend(args.iter().cloned());
        let primary = CommandSpec::new(argv)?;
        let elevated = primary.with_program(self.installer.elevated_program_path())?;
        Ok((primary, elevated))
    }

    /// Send one command to the installer, escalating once on failure.
    pub async fn send(
        &self,
        args: &[String],
        timeout: Option<Duration>,
        sink: SharedSink,
    ) -> Result<Escalated, ExecError> {
        let (primary, elevated) = self.commands(args)?;
        let policy = EscalationPolicy::from_config(&self.escalation);
        let timeout = timeout.unwrap_or_else(|| self.escalation.timeout());
        run_escalating(&primary, &elevated, timeout, &policy, &self.runner, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryLog;
    use std::sync::Arc;

    #[test]
    fn test_accept_when_no_marker() {
        let policy = EscalationPolicy::new(" failed");
        assert_eq!(policy.evaluate("1 matching device(s) found."), EscalationDecision::Accept);
        assert_eq!(policy.evaluate(""), EscalationDecision::Accept);
    }

    #[test]
    fn test_escalate_when_marker_present() {
        let policy = EscalationPolicy::new(" failed");
        assert_eq!(
            policy.evaluate("Updating drivers...\nUpdate failed\n"),
            EscalationDecision::Escalate
        );
    }

    #[test]
    fn test_marker_is_case_sensitive_substring() {
        let policy = EscalationPolicy::new(" failed");
        // No leading space
        assert_eq!(policy.evaluate("failed"), EscalationDecision::Accept);
        assert_eq!(policy.evaluate("it FAILED"), EscalationDecision::Accept);
    }

    #[test]
    fn test_empty_marker_never_escalates() {
        let policy = EscalationPolicy::new("");
        assert_eq!(policy.evaluate("anything failed"), EscalationDecision::Accept);
    }

    #[test]
    fn test_installer_commands_share_args() {
        let installer = Installer::new(
            InstallerConfig {
                tool_dir: Some("/opt/cadi".into()),
                program: "driver_x64.exe".to_string(),
                elevated_program: "driver_x64_elevate.exe".to_string(),
            },
            EscalationConfig::default(),
            RunnerConfig::default(),
        );
        let args = vec!["find".to_string(), "USB*".to_string()];
        let (primary, elevated) = installer.commands(&args).unwrap();
        assert_eq!(primary.program(), "/opt/cadi/driver_x64.exe");
        assert_eq!(elevated.program(), "/opt/cadi/driver_x64_elevate.exe");
        assert_eq!(primary.args(), args.as_slice());
        assert_eq!(elevated.args(), args.as_slice());
    }

    #[tokio::test]
    async fn test_primary_success_runs_once() {
        let log = MemoryLog::new();
        let primary = CommandSpec::new(["echo", "all good"]).unwrap();
        let elevated = CommandSpec::new(["echo", "elevated"]).unwrap();
        let out = run_escalating(
            &primary,
            &elevated,
            Duration::from_secs(5),
            &EscalationPolicy::new(" failed"),
            &RunnerConfig::default(),
            Arc::new(log.clone()),
        )
        .await
        .unwrap();

        assert_eq!(out.attempts, 1);
        assert!(!out.elevated);
        assert_eq!(out.result.output, "all good\n");
        assert!(log.contains("all good"));
    }

    #[tokio::test]
    async fn test_failure_marker_escalates_exactly_once() {
        let log = MemoryLog::new();
        let primary = CommandSpec::new(["echo", "update failed"]).unwrap();
        // Elevated attempt fails too; there is no third attempt
        let elevated = CommandSpec::new(["echo", "elevated update failed"]).unwrap();
        let out = run_escalating(
            &primary,
            &elevated,
            Duration::from_secs(5),
            &EscalationPolicy::new(" failed"),
            &RunnerConfig::default(),
            Arc::new(log.clone()),
        )
        .await
        .unwrap();

        assert_eq!(out.attempts, 2);
        assert!(out.elevated);
        assert_eq!(out.result.output, "elevated update failed\n");
        assert_eq!(log.read().matches("###executing timeout command").count(), 2);
    }

    #[tokio::test]
    async fn test_primary_launch_error_propagates() {
        let primary = CommandSpec::new(["nonexistent-binary-xyz"]).unwrap();
        let elevated = CommandSpec::new(["echo", "never"]).unwrap();
        let err = run_escalating(
            &primary,
            &elevated,
            Duration::from_secs(5),
            &EscalationPolicy::new(" failed"),
            &RunnerConfig::default(),
            Arc::new(MemoryLog::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_installer_send_escalates_to_elevated_program() {
        let installer = Installer::new(
            InstallerConfig {
                tool_dir: None,
                program: "echo".to_string(),
                elevated_program: "true".to_string(),
            },
            EscalationConfig::default(),
            RunnerConfig::default(),
        );
        let args = vec!["rescan".to_string(), "failed".to_string()];
        let out = installer
            .send(&args, None, Arc::new(MemoryLog::new()))
            .await
            .unwrap();
        assert!(out.elevated);
        assert_eq!(out.attempts, 2);
        assert!(out.result.is_completed());
        assert_eq!(out.result.output, "");
    }
}
