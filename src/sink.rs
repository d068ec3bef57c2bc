/// Diagnostic sinks passed explicitly into every invocation.
///
/// A sink receives free-text diagnostic lines (spawn, timeout, completion,
/// errors) and, for realtime runners, raw output chunks as they arrive.
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Receives diagnostics from runners.
pub trait LogSink: Send + Sync {
    /// A complete diagnostic line.
    fn line(&self, text: &str);

    /// A raw fragment of child output, delivered as it arrives. No newline is implied.
    fn raw(&self, text: &str);
}

/// Sink shared with the background tasks of an invocation.
pub type SharedSink = Arc<dyn LogSink>;

/// Forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn line(&self, text: &str) {
        tracing::info!(target: "cadi::sink", "{}", text);
    }

    fn raw(&self, text: &str) {
        tracing::debug!(target: "cadi::sink", output = %text.escape_debug(), "child output");
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn line(&self, _text: &str) {}
    fn raw(&self, _text: &str) {}
}

/// Diagnostic lines go to `tracing`; raw child output is echoed to stdout
/// as it arrives.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn line(&self, text: &str) {
        tracing::info!(target: "cadi::sink", "{}", text);
    }

    fn raw(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

/// In-memory log buffer. Clones share the same buffer, so a caller can hand a
/// clone to a runner and read the log back afterwards. The CLI collects the
/// diagnostics of `--json` runs this way.
#[derive(Debug, Default, Clone)]
pub struct MemoryLog {
    buf: Arc<Mutex<String>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    pub fn read(&self) -> String {
        match self.buf.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_buf(&self, f: impl FnOnce(&mut String)) {
        match self.buf.lock() {
            Ok(mut buf) => f(&mut buf),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
impl MemoryLog {
    pub fn contains(&self, needle: &str) -> bool {
        self.read().contains(needle)
    }
}

impl LogSink for MemoryLog {
    fn line(&self, text: &str) {
        tracing::debug!(target: "cadi::sink", "{}", text);
        self.with_buf(|buf| {
            buf.push_str(text);
            buf.push('\n');
        });
    }

    fn raw(&self, text: &str) {
        self.with_buf(|buf| buf.push_str(text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_log_lines_and_raw() {
        let log = MemoryLog::new();
        log.line("###executing: echo###");
        log.raw("ab");
        log.raw("c");
        assert_eq!(log.read(), "###executing: echo###\nabc");
    }

    #[test]
    fn test_memory_log_clones_share_buffer() {
        let log = MemoryLog::new();
        let handle = log.clone();
        handle.line("from clone");
        assert!(log.contains("from clone"));
    }

    #[test]
    fn test_independent_logs_do_not_share() {
        let a = MemoryLog::new();
        let b = MemoryLog::new();
        a.line("only a");
        assert!(!b.contains("only a"));
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        let sink: &dyn LogSink = &NullSink;
        sink.line("ignored");
        sink.raw("ignored");
    }
}
