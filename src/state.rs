/// Per-invocation shared state: the execution phase and the captured output,
/// behind a single mutex, plus a notifier for the coordinator.
///
/// Terminal transitions are first-writer-wins. The notifier is only fired
/// while the lock is held and after the phase has been written, and waiters
/// register before they inspect the phase, so a transition can never be missed.
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// Where an invocation currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Running,
    TimedOut,
    Completed { exit_code: Option<i32> },
    Failed { reason: String },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Phase::Running)
    }

    /// Output is still accepted while running and while draining after a
    /// normal exit. After a timeout or fault the reader must stop.
    fn accepts_output(&self) -> bool {
        matches!(self, Phase::Running | Phase::Completed { .. })
    }
}

/// Append-only byte buffer with a hard cap.
#[derive(Debug)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            truncated: false,
        }
    }

    /// Append as much of `chunk` as fits. Returns the number of bytes kept.
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        let room = self.cap.saturating_sub(self.bytes.len());
        let kept = chunk.len().min(room);
        self.bytes.extend_from_slice(&chunk[..kept]);
        if kept < chunk.len() {
            self.truncated = true;
        }
        kept
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// What happened to an appended chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Bytes actually stored (less than the chunk once the cap is hit).
    pub kept: usize,
    /// True if the invocation was still running when the chunk arrived.
    pub while_running: bool,
    /// True if this append was the first to hit the cap.
    pub newly_truncated: bool,
}

struct Inner {
    phase: Phase,
    buffer: OutputBuffer,
}

pub struct ExecutionState {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl ExecutionState {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Running,
                buffer: OutputBuffer::new(max_output_bytes),
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase.clone()
    }

    /// Move out of `Running` into a terminal phase.
    ///
    /// Returns `true` if this call performed the transition, `false` if another
    /// writer got there first (the existing terminal phase is kept).
    pub fn finish(&self, phase: Phase) -> bool {
        debug_assert!(phase.is_terminal());
        let mut inner = self.lock();
        if inner.phase.is_terminal() {
            return false;
        }
        inner.phase = phase;
        self.notify.notify_waiters();
        true
    }

    /// Append output. Returns `None` if the invocation has timed out or
    /// failed, which tells the reader to stop.
    pub fn append(&self, chunk: &[u8]) -> Option<Appended> {
        let mut inner = self.lock();
        if !inner.phase.accepts_output() {
            return None;
        }
        let was_truncated = inner.buffer.is_truncated();
        let kept = inner.buffer.append(chunk);
        Some(Appended {
            kept,
            while_running: inner.phase == Phase::Running,
            newly_truncated: !was_truncated && inner.buffer.is_truncated(),
        })
    }

    /// Wait until the phase is terminal and return it.
    pub async fn wait_terminal(&self) -> Phase {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if inner.phase.is_terminal() {
                    return inner.phase.clone();
                }
            }
            notified.await;
        }
    }

    /// Captured output so far, and whether it was truncated.
    pub fn output(&self) -> (String, bool) {
        let inner = self.lock();
        (inner.buffer.to_string_lossy(), inner.buffer.is_truncated())
    }
}
