/// Background task draining the merged output stream into the shared state.
use crate::launcher::MergedOutput;
use crate::sink::SharedSink;
use crate::state::{ExecutionState, Phase};
use crate::watchdog::{KeywordMatcher, WatchdogHandle};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// How output is appended to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Append chunks as they arrive.
    Chunks,
    /// Append whole lines, each terminated by `\n` (`\r\n` normalized). A
    /// trailing partial line is flushed with a `\n` when the stream closes.
    Lines,
}

/// Splits a byte stream into `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    partial: Vec<u8>,
}

impl LineAssembler {
    /// Feed bytes; returns every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                if self.partial.last() == Some(&b'\r') {
                    self.partial.pop();
                }
                out.append(&mut self.partial);
                out.push(b'\n');
            } else {
                self.partial.push(b);
            }
        }
        out
    }

    /// Flush whatever is left as a final line.
    pub fn finish(&mut self) -> Vec<u8> {
        if self.partial.is_empty() {
            return Vec::new();
        }
        if self.partial.last() == Some(&b'\r') {
            self.partial.pop();
        }
        let mut out = std::mem::take(&mut self.partial);
        out.push(b'\n');
        out
    }
}

/// Everything the reader needs besides the stream itself.
pub struct ReaderContext {
    pub state: Arc<ExecutionState>,
    pub mode: ReadMode,
    pub keywords: KeywordMatcher,
    pub watchdog: Option<WatchdogHandle>,
    /// Forward each chunk to the sink as it arrives.
    pub realtime: bool,
    pub sink: SharedSink,
}

/// Start draining `output`. The task ends when the stream closes, when the
/// invocation times out or fails, or on a read error (which fails the
/// invocation so the coordinator is woken).
pub fn spawn_reader(output: MergedOutput, ctx: ReaderContext) -> JoinHandle<()> {
    tokio::spawn(read_loop(output, ctx))
}

async fn read_loop(mut output: MergedOutput, mut ctx: ReaderContext) {
    let mut lines = LineAssembler::default();

    while let Some(chunk) = output.next_chunk().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to read child output");
                ctx.sink.line(&format!("error while reading child output: {e}"));
                ctx.state.finish(Phase::Failed {
                    reason: format!("output read failed: {e}"),
                });
                return;
            }
        };

        let data = match ctx.mode {
            ReadMode::Chunks => bytes,
            ReadMode::Lines => lines.push(&bytes),
        };
        if !deliver(&mut ctx, &data) {
            tracing::debug!("reader stopping, invocation no longer accepts output");
            return;
        }
    }

    if ctx.mode == ReadMode::Lines {
        let tail = lines.finish();
        deliver(&mut ctx, &tail);
    }
    tracing::debug!("child output stream closed");
}

/// Append one piece of output. Returns false once the reader should stop.
fn deliver(ctx: &mut ReaderContext, data: &[u8]) -> bool {
    if data.is_empty() {
        return true;
    }
    let Some(appended) = ctx.state.append(data) else {
        return false;
    };

    if appended.newly_truncated {
        tracing::warn!("output buffer cap reached, dropping further output");
        ctx.sink.line("output buffer full; further output discarded");
    }
    if ctx.realtime {
        ctx.sink.raw(&String::from_utf8_lossy(data));
    }

    if appended.while_running {
        if let Some(keyword) = ctx.keywords.feed(data) {
            if let Some(watchdog) = &ctx.watchdog {
                watchdog.reset();
            }
            tracing::debug!(keyword, "watchdog reset on keyword");
            if ctx.realtime {
                ctx.sink.line(&format!("Timer reset on keyword {keyword}"));
            }
        }
    }
    true
}
