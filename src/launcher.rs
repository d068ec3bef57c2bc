/// Process launching: spawn a child with null stdin and its stdout+stderr
/// merged into a single chunk stream.
///
/// The child is placed in its own process group (unix) so `terminate()` can
/// take down anything it forked as well.
use crate::command::CommandSpec;
use crate::outcome::ExecError;
use crate::sink::LogSink;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Read size for each pump.
const CHUNK_SIZE: usize = 8 * 1024;

/// Chunks in flight between the pumps and the reader.
const CHANNEL_DEPTH: usize = 64;

/// The child's stdout and stderr, interleaved in arrival order.
///
/// Yields `None` once both streams have closed.
pub struct MergedOutput {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
}

impl MergedOutput {
    pub async fn next_chunk(&mut self) -> Option<io::Result<Vec<u8>>> {
        self.rx.recv().await
    }

    /// A stream fed by hand instead of by a child's pipes.
    #[cfg(test)]
    pub(crate) fn channel() -> (mpsc::Sender<io::Result<Vec<u8>>>, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        (tx, Self { rx })
    }
}

/// A running child process.
pub struct ChildHandle {
    child: Child,
    pid: Option<u32>,
    program: String,
    output: Option<MergedOutput>,
}

impl ChildHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Take the merged output stream. Returns `None` on the second call.
    pub fn take_output(&mut self) -> Option<MergedOutput> {
        self.output.take()
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Forcibly terminate the child (and its process group) and reap it.
    pub async fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                kill_process_group(pid);
            }
        }

        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already exited and reaped
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Build the OS command: null stdin, piped stdout/stderr.
pub(crate) fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(spec.program());
    cmd.args(spec.args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0); // New process group for clean kill
    cmd
}

pub(crate) fn launch_error(spec: &CommandSpec, source: io::Error, sink: &dyn LogSink) -> ExecError {
    tracing::error!(program = %spec.program(), error = %source, "failed to launch process");
    sink.line(&format!("@problemWhileExecutingCommand {spec}: {source}"));
    ExecError::Launch {
        program: spec.program().to_string(),
        source,
    }
}

/// Spawn the child with its output streams merged.
pub fn launch(spec: &CommandSpec, sink: &dyn LogSink) -> Result<ChildHandle, ExecError> {
    let mut child = build_command(spec)
        .spawn()
        .map_err(|e| launch_error(spec, e, sink))?;

    let pid = child.id();
    tracing::info!(pid = ?pid, command = %spec, "child process started");

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    if let Some(stdout) = child.stdout.take() {
        spawn_pump(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_pump(stderr, tx);
    }

    Ok(ChildHandle {
        child,
        pid,
        program: spec.program().to_string(),
        output: Some(MergedOutput { rx }),
    })
}

/// Forward one stream into the merged channel until EOF, error, or the
/// receiving side goes away.
fn spawn_pump<R>(mut stream: R, tx: mpsc::Sender<io::Result<Vec<u8>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "failed to kill process group"),
    }
}
