/// Resettable watchdog timer and the keyword matcher that feeds it.
///
/// The timer runs alongside the child process. If it expires without being
/// reset, the invocation transitions to `TimedOut`. Any configured keyword
/// showing up in the output restarts the countdown from the full timeout.
use crate::state::{ExecutionState, Phase};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Finds configured keywords in a chunked byte stream.
///
/// Keeps the last `longest - 1` bytes between feeds, so a keyword split across
/// chunk boundaries is still found. Only occurrences that end inside the newest
/// chunk count, so each occurrence is reported once.
#[derive(Debug, Default, Clone)]
pub struct KeywordMatcher {
    keywords: Vec<String>,
    longest: usize,
    carry: Vec<u8>,
}

impl KeywordMatcher {
    /// Empty keywords are ignored.
    pub fn new(keywords: &[String]) -> Self {
        let keywords: Vec<String> = keywords.iter().filter(|k| !k.is_empty()).cloned().collect();
        let longest = keywords.iter().map(String::len).max().unwrap_or(0);
        Self {
            keywords,
            longest,
            carry: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Feed newly arrived bytes. Returns the first keyword (in configured
    /// order) with an occurrence ending in `chunk`.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<&str> {
        if self.keywords.is_empty() || chunk.is_empty() {
            return None;
        }

        let mut window = Vec::with_capacity(self.carry.len() + chunk.len());
        window.extend_from_slice(&self.carry);
        window.extend_from_slice(chunk);
        let fresh_from = self.carry.len();

        let keep = self.longest.saturating_sub(1).min(window.len());
        self.carry = window[window.len() - keep..].to_vec();

        self.keywords
            .iter()
            .find(|kw| ends_in_fresh(&window, kw.as_bytes(), fresh_from))
            .map(String::as_str)
    }
}

fn ends_in_fresh(window: &[u8], needle: &[u8], fresh_from: usize) -> bool {
    window
        .windows(needle.len())
        .enumerate()
        .any(|(i, w)| i + needle.len() > fresh_from && w == needle)
}

enum Signal {
    Reset,
    Stop,
}

/// Control handle for a running watchdog. Cheap to clone.
#[derive(Clone)]
pub struct WatchdogHandle {
    tx: mpsc::UnboundedSender<Signal>,
}

impl WatchdogHandle {
    /// Restart the countdown from the full timeout.
    pub fn reset(&self) {
        let _ = self.tx.send(Signal::Reset);
    }

    /// Disarm the timer. It will never fire after this is observed.
    pub fn stop(&self) {
        let _ = self.tx.send(Signal::Stop);
    }
}

/// Arm a watchdog for `timeout`. On expiry it moves `state` to `TimedOut`
/// (unless something else already finished the invocation).
pub fn spawn_watchdog(
    timeout: Duration,
    state: Arc<ExecutionState>,
) -> (WatchdogHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        let mut resets: u64 = 0;

        loop {
            tokio::select! {
                // Pending resets win over an expiry that raced with them
                biased;
                signal = rx.recv() => match signal {
                    Some(Signal::Reset) => {
                        resets += 1;
                        sleep.as_mut().reset(Instant::now() + timeout);
                    }
                    Some(Signal::Stop) | None => {
                        tracing::debug!(resets, "watchdog disarmed");
                        break;
                    }
                },
                () = &mut sleep => {
                    if state.finish(Phase::TimedOut) {
                        tracing::warn!(
                            timeout_ms = timeout.as_millis() as u64,
                            resets,
                            "watchdog expired, invocation timed out"
                        );
                    }
                    break;
                }
            }
        }
    });

    (WatchdogHandle { tx }, task)
}
