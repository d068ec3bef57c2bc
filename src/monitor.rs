/// Process monitor: owns the child, waits for it to exit, and marks the
/// invocation completed. Also the only place the child gets killed, on request
/// from the coordinator.
use crate::launcher::ChildHandle;
use crate::outcome::ExecError;
use crate::state::{ExecutionState, Phase};
use crate::watchdog::WatchdogHandle;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How the monitored child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEnd {
    /// Exited on its own (code is None if killed by a signal).
    Exited(Option<i32>),
    /// Terminated at the coordinator's request.
    Terminated,
    /// Waiting on the child failed; the invocation was marked failed.
    WaitFailed,
}

pub struct Monitor {
    kill_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<ChildEnd>,
}

impl Monitor {
    /// Start watching `child`. On exit the watchdog (if any) is stopped and
    /// the invocation moves to `Completed`.
    pub fn spawn(
        mut child: ChildHandle,
        state: Arc<ExecutionState>,
        watchdog: Option<WatchdogHandle>,
    ) -> Self {
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut kill_rx = kill_rx;
            // Set once the sender is gone without a kill request
            let mut released = false;
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    request = &mut kill_rx, if !released => match request {
                        Ok(()) => {
                            terminate_logged(&mut child).await;
                            return ChildEnd::Terminated;
                        }
                        Err(_) => released = true,
                    },
                }
            };

            let end = match status {
                Ok(status) => {
                    if let Some(watchdog) = &watchdog {
                        watchdog.stop();
                    }
                    let exit_code = status.code();
                    if state.finish(Phase::Completed { exit_code }) {
                        tracing::info!(
                            pid = ?child.pid(),
                            exit_code = ?exit_code,
                            "child process exited"
                        );
                    }
                    ChildEnd::Exited(exit_code)
                }
                Err(e) => {
                    tracing::error!(
                        pid = ?child.pid(),
                        error = %e,
                        "failed waiting on child process"
                    );
                    state.finish(Phase::Failed {
                        reason: format!("waiting on child failed: {e}"),
                    });
                    terminate_logged(&mut child).await;
                    return ChildEnd::WaitFailed;
                }
            };

            // The child is gone, but something it forked may still hold the
            // output stream open. The coordinator can ask for the process
            // group to be cleaned up; dropping the sender means no.
            if !released && kill_rx.await.is_ok() {
                terminate_logged(&mut child).await;
            }
            end
        });

        Self {
            kill_tx: Some(kill_tx),
            task,
        }
    }

    /// Kill the child and its process group (even if the child itself has
    /// already exited) and wait for the monitor to finish.
    pub async fn terminate(mut self) -> Result<ChildEnd, ExecError> {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Wait for the child to exit on its own. Never kills it.
    pub async fn join(mut self) -> Result<ChildEnd, ExecError> {
        self.kill_tx.take();
        let result = (&mut self.task).await;
        result.map_err(|e| ExecError::Interrupted {
            task: "monitor",
            reason: e.to_string(),
        })
    }
}

async fn terminate_logged(child: &mut ChildHandle) {
    match child.terminate().await {
        Ok(()) => tracing::info!(
            pid = ?child.pid(),
            program = %child.program(),
            "child process terminated"
        ),
        Err(e) => tracing::warn!(
            pid = ?child.pid(),
            error = %e,
            "failed to terminate child process"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use crate::launcher::launch;
    use crate::sink::NullSink;
    use std::time::Duration;

    #[tokio::test]
    async fn test_monitor_marks_completed_with_exit_code() {
        let state = Arc::new(ExecutionState::new(1024));
        let spec = CommandSpec::new(["sh", "-c", "exit 42"]).unwrap();
        let child = launch(&spec, &NullSink).unwrap();
        let monitor = Monitor::spawn(child, Arc::clone(&state), None);

        let phase = state.wait_terminal().await;
        assert_eq!(phase, Phase::Completed { exit_code: Some(42) });
        assert_eq!(monitor.join().await.unwrap(), ChildEnd::Exited(Some(42)));
    }

    #[tokio::test]
    async fn test_monitor_terminate_kills_child() {
        let state = Arc::new(ExecutionState::new(1024));
        let child = launch(&CommandSpec::new(["sleep", "10"]).unwrap(), &NullSink).unwrap();
        let monitor = Monitor::spawn(child, Arc::clone(&state), None);

        let end = tokio::time::timeout(Duration::from_secs(5), monitor.terminate())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, ChildEnd::Terminated);
        // Termination is not a normal completion
        assert_eq!(state.phase(), Phase::Running);
    }

    #[tokio::test]
    async fn test_monitor_stops_watchdog_on_exit() {
        let state = Arc::new(ExecutionState::new(1024));
        let (watchdog, timer) =
            crate::watchdog::spawn_watchdog(Duration::from_secs(30), Arc::clone(&state));
        let child = launch(&CommandSpec::new(["true"]).unwrap(), &NullSink).unwrap();
        let monitor = Monitor::spawn(child, Arc::clone(&state), Some(watchdog));

        monitor.join().await.unwrap();
        // Timer task ends promptly because it was disarmed
        tokio::time::timeout(Duration::from_secs(2), timer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(state.phase(), Phase::Completed { .. }));
    }

    #[tokio::test]
    async fn test_join_waits_for_running_child_without_killing() {
        let state = Arc::new(ExecutionState::new(1024));
        let child = launch(&CommandSpec::new(["sleep", "0.3"]).unwrap(), &NullSink).unwrap();
        let monitor = Monitor::spawn(child, Arc::clone(&state), None);

        let start = std::time::Instant::now();
        let end = tokio::time::timeout(Duration::from_secs(5), monitor.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, ChildEnd::Exited(Some(0)));
        assert_eq!(state.phase(), Phase::Completed { exit_code: Some(0) });
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
