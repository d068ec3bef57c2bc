/// Supervised execution: launch the child, run the reader/monitor/watchdog
/// tasks against one shared state, wait for a terminal phase, and build the
/// result.
///
/// Two runners are provided:
/// - `run_with_timeout`: fixed wall-clock budget, line-oriented capture.
/// - `run_with_watchdog`: resettable budget, extended whenever a configured
///   keyword shows up in the output.
///
/// Either way, a child that runs out of budget is terminated together with
/// its process group before the call returns.
use crate::command::CommandSpec;
use crate::config::{RunnerConfig, WatchdogConfig};
use crate::launcher::launch;
use crate::monitor::Monitor;
use crate::outcome::{ExecError, ExecutionResult, ExecutionStatus};
use crate::reader::{spawn_reader, ReadMode, ReaderContext};
use crate::sink::SharedSink;
use crate::state::{ExecutionState, Phase};
use crate::watchdog::{spawn_watchdog, KeywordMatcher, WatchdogHandle};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How a supervision is set up.
struct Plan<'a> {
    mode: ReadMode,
    keywords: &'a [String],
    realtime: bool,
    watchdog_timeout: Option<Duration>,
}

/// The live tasks of one invocation.
struct Supervision {
    state: Arc<ExecutionState>,
    reader: JoinHandle<()>,
    monitor: Monitor,
    watchdog: Option<(WatchdogHandle, JoinHandle<()>)>,
    pid: Option<u32>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Supervision {
    fn start(
        spec: &CommandSpec,
        runner: &RunnerConfig,
        plan: Plan<'_>,
        sink: &SharedSink,
    ) -> Result<Self, ExecError> {
        let started = Instant::now();
        let started_at = Utc::now();

        let mut child = launch(spec, sink.as_ref())?;
        let pid = child.pid();
        let output = child.take_output().ok_or_else(|| ExecError::Io {
            source: std::io::Error::other("child output stream unavailable"),
        })?;

        let state = Arc::new(ExecutionState::new(runner.max_output_bytes));
        let watchdog = plan
            .watchdog_timeout
            .map(|timeout| spawn_watchdog(timeout, Arc::clone(&state)));
        let watchdog_handle = watchdog.as_ref().map(|(handle, _)| handle.clone());

        let keywords = KeywordMatcher::new(plan.keywords);
        if plan.watchdog_timeout.is_some() && keywords.is_empty() {
            tracing::debug!("no keywords configured, watchdog will never be reset");
        }
        let reader = spawn_reader(
            output,
            ReaderContext {
                state: Arc::clone(&state),
                mode: plan.mode,
                keywords,
                watchdog: watchdog_handle.clone(),
                realtime: plan.realtime,
                sink: Arc::clone(sink),
            },
        );
        let monitor = Monitor::spawn(child, Arc::clone(&state), watchdog_handle);

        Ok(Self {
            state,
            reader,
            monitor,
            watchdog,
            pid,
            started,
            started_at,
        })
    }

    /// Tear down the tasks for a terminal `phase` and assemble the result.
    ///
    /// After a normal exit the reader may drain until `drain_until`; if the
    /// stream is still open by then, the process group is killed to release
    /// it. After a timeout or failure the child is killed immediately.
    async fn conclude(
        self,
        phase: Phase,
        drain_until: Instant,
        spec: &CommandSpec,
        sink: &SharedSink,
    ) -> ExecutionResult {
        let Supervision {
            state,
            mut reader,
            monitor,
            watchdog,
            pid,
            started,
            started_at,
        } = self;

        if let Some((handle, _)) = &watchdog {
            handle.stop();
        }

        let monitor_end = match &phase {
            Phase::Completed { .. } => {
                if tokio::time::timeout_at(drain_until, &mut reader).await.is_ok() {
                    monitor.join().await
                } else {
                    tracing::warn!(
                        pid = ?pid,
                        "output still open after child exit, killing process group"
                    );
                    reader.abort();
                    monitor.terminate().await
                }
            }
            _ => {
                let end = monitor.terminate().await;
                reader.abort();
                end
            }
        };
        if let Err(e) = monitor_end {
            tracing::error!(error = %e, "process monitor did not finish cleanly");
            sink.line(&e.to_string());
        }

        let status = match phase {
            Phase::Completed { exit_code } => ExecutionStatus::Completed { exit_code },
            Phase::TimedOut => ExecutionStatus::TimedOut,
            Phase::Failed { reason } => {
                sink.line(&format!("@problemWhileExecutingCommand {spec}: {reason}"));
                ExecutionStatus::Failed { reason }
            }
            Phase::Running => ExecutionStatus::Failed {
                reason: "invocation concluded while still running".to_string(),
            },
        };

        let (output, truncated) = state.output();
        let duration = started.elapsed();
        tracing::info!(
            command = %spec.program(),
            status = ?status,
            output_bytes = output.len(),
            duration_ms = duration.as_millis() as u64,
            "invocation finished"
        );

        ExecutionResult {
            status,
            output,
            pid,
            duration_ms: duration.as_millis() as u64,
            truncated,
            started_at,
        }
    }
}

/// Run `spec` with a fixed wall-clock budget.
///
/// Output is captured line by line. If the budget elapses first, the child is
/// terminated and the partial output is returned with a `TimedOut` status.
pub async fn run_with_timeout(
    spec: &CommandSpec,
    timeout: Duration,
    runner: &RunnerConfig,
    sink: SharedSink,
) -> Result<ExecutionResult, ExecError> {
    tracing::info!(
        command = %spec,
        timeout_ms = timeout.as_millis() as u64,
        "running with fixed timeout"
    );
    sink.line(&format!("###executing timeout command: {}###", spec.program()));

    let supervision = Supervision::start(
        spec,
        runner,
        Plan {
            mode: ReadMode::Lines,
            keywords: &[],
            realtime: false,
            watchdog_timeout: None,
        },
        &sink,
    )?;

    let deadline = supervision.started + timeout;
    let phase = match tokio::time::timeout_at(deadline, supervision.state.wait_terminal()).await {
        Ok(phase) => phase,
        Err(_) => {
            supervision.state.finish(Phase::TimedOut);
            supervision.state.phase()
        }
    };

    if phase == Phase::TimedOut {
        tracing::warn!(
            command = %spec.program(),
            timeout_ms = timeout.as_millis() as u64,
            "fixed timeout elapsed"
        );
        sink.line(&format!(
            "TimeOut on {} after {}ms. Returning what was received.",
            spec.program(),
            timeout.as_millis()
        ));
    }

    Ok(supervision.conclude(phase, deadline, spec, &sink).await)
}

/// Run `spec` under a watchdog that is reset by keywords in the output.
///
/// The budget restarts from `watchdog.timeout()` every time one of
/// `watchdog.keywords` appears in the output. If it ever runs out, the child
/// is terminated and the partial output is returned with a `TimedOut` status.
pub async fn run_with_watchdog(
    spec: &CommandSpec,
    watchdog: &WatchdogConfig,
    runner: &RunnerConfig,
    sink: SharedSink,
) -> Result<ExecutionResult, ExecError> {
    tracing::info!(
        command = %spec,
        timeout_ms = watchdog.timeout_ms,
        keywords = ?watchdog.keywords,
        "running under watchdog"
    );
    sink.line(&format!("###executing watchdog command: {}###", spec.program()));

    let supervision = Supervision::start(
        spec,
        runner,
        Plan {
            mode: ReadMode::Chunks,
            keywords: &watchdog.keywords,
            realtime: watchdog.realtime,
            watchdog_timeout: Some(watchdog.timeout()),
        },
        &sink,
    )?;

    let phase = supervision.state.wait_terminal().await;
    if phase == Phase::TimedOut {
        sink.line(&format!(
            "Watchdog triggered! {} made no progress for {}ms.",
            spec.program(),
            watchdog.timeout_ms
        ));
    }

    let drain_until = Instant::now() + runner.drain_grace();
    Ok(supervision.conclude(phase, drain_until, spec, &sink).await)
}
