/// Synchronous, non-cancellable runners for low-risk calls.
///
/// None of these has a timeout or watchdog: they run the child to completion.
/// A spawn failure is `ExecError::Launch`; a read or wait failure is
/// `ExecError::Io`.
use crate::command::CommandSpec;
use crate::launcher::{build_command, launch, launch_error};
use crate::outcome::ExecError;
use crate::sink::{LogSink, NullSink};
use std::process::Stdio;

/// Run to completion, capturing stdout and stderr separately.
///
/// The text is stdout's lines followed by stderr's lines (stderr stops at its
/// first empty line). Each non-empty section is preceded by a blank line, and
/// the whole text ends with one.
pub async fn run_simple(spec: &CommandSpec, sink: &dyn LogSink) -> Result<String, ExecError> {
    sink.line(&format!("###executing: {}###", spec.program()));

    let child = build_command(spec)
        .spawn()
        .map_err(|e| launch_error(spec, e, sink))?;
    let output = child.wait_with_output().await.map_err(|e| {
        sink.line(&format!("@problemWhileExecutingCommand {spec}: {e}"));
        ExecError::Io { source: e }
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    tracing::debug!(
        command = %spec.program(),
        exit_code = ?output.status.code(),
        stdout_bytes = output.stdout.len(),
        stderr_bytes = output.stderr.len(),
        "simple command finished"
    );
    Ok(format_sections(&stdout, &stderr))
}

fn format_sections(stdout: &str, stderr: &str) -> String {
    let mut text = String::new();
    push_section(&mut text, stdout.lines());
    push_section(&mut text, stderr.lines().take_while(|line| !line.is_empty()));
    text.push('\n');
    text
}

fn push_section<'a>(text: &mut String, lines: impl Iterator<Item = &'a str>) {
    for (i, line) in lines.enumerate() {
        if i == 0 {
            text.push('\n');
        }
        text.push_str(line);
        text.push('\n');
    }
}

/// Run to completion over the merged output stream, forwarding each chunk to
/// the sink as it arrives when `display` is set.
pub async fn run_live(
    spec: &CommandSpec,
    display: bool,
    sink: &dyn LogSink,
) -> Result<String, ExecError> {
    let mut child = launch(spec, sink)?;
    sink.line(&format!("###executing real-time command: {}###", spec.program()));

    let Some(mut output) = child.take_output() else {
        return Err(ExecError::Io {
            source: std::io::Error::other("child output stream unavailable"),
        });
    };

    let mut captured = Vec::new();
    while let Some(chunk) = output.next_chunk().await {
        match chunk {
            Ok(bytes) => {
                if display {
                    sink.raw(&String::from_utf8_lossy(&bytes));
                }
                captured.extend_from_slice(&bytes);
            }
            Err(e) => {
                sink.line(&e.to_string());
                if let Err(kill_err) = child.terminate().await {
                    tracing::warn!(error = %kill_err, "failed to terminate child after read error");
                }
                return Err(ExecError::Io { source: e });
            }
        }
    }

    let status = child.wait().await.map_err(|e| ExecError::Io { source: e })?;
    tracing::debug!(command = %spec.program(), exit_code = ?status.code(), "live command finished");
    Ok(String::from_utf8_lossy(&captured).into_owned())
}

/// Run to completion capturing stdout only, without logging anything.
///
/// Each stdout line is preceded by a newline.
pub async fn run_silent(spec: &CommandSpec) -> Result<String, ExecError> {
    let mut cmd = build_command(spec);
    cmd.stderr(Stdio::null());
    let child = cmd.spawn().map_err(|e| launch_error(spec, e, &NullSink))?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ExecError::Io { source: e })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().map(|line| format!("\n{line}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryLog;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(["sh", "-c", script]).unwrap()
    }

    #[test]
    fn test_format_sections_stdout_only() {
        assert_eq!(format_sections("a\nb\n", ""), "\na\nb\n\n");
    }

    #[test]
    fn test_format_sections_both_streams() {
        assert_eq!(format_sections("out\n", "err\n"), "\nout\n\nerr\n\n");
    }

    #[test]
    fn test_format_sections_stderr_stops_at_blank_line() {
        assert_eq!(format_sections("", "e1\n\ne2\n"), "\ne1\n\n");
    }

    #[test]
    fn test_format_sections_empty() {
        assert_eq!(format_sections("", ""), "\n");
    }

    #[tokio::test]
    async fn test_simple_captures_both_streams() {
        let log = MemoryLog::new();
        let text = run_simple(&sh("echo out; echo err >&2"), &log).await.unwrap();
        assert_eq!(text, "\nout\n\nerr\n\n");
        assert!(log.contains("###executing: sh###"));
    }

    #[tokio::test]
    async fn test_simple_launch_failure() {
        let log = MemoryLog::new();
        let err = run_simple(&CommandSpec::new(["nonexistent-binary-xyz"]).unwrap(), &log)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
        assert_eq!(err.legacy_text(), "CritERROR!!!");
        assert!(log.contains("@problemWhileExecutingCommand"));
    }

    #[tokio::test]
    async fn test_simple_large_output_does_not_deadlock() {
        let log = MemoryLog::new();
        // Well past a pipe buffer on both streams
        let script =
            "i=0; while [ $i -lt 20000 ]; do echo line$i; echo err$i >&2; i=$((i+1)); done";
        let text = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            run_simple(&sh(script), &log),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(text.contains("line19999\n"));
    }

    #[tokio::test]
    async fn test_live_returns_merged_output_and_streams_to_sink() {
        let log = MemoryLog::new();
        let text = run_live(&sh("echo one; echo two >&2"), true, &log).await.unwrap();
        assert!(text.contains("one\n"));
        assert!(text.contains("two\n"));
        let logged = log.read();
        assert!(logged.contains("###executing real-time command: sh###"));
        assert!(logged.contains("one\n"));
        assert!(logged.contains("two\n"));
    }

    #[tokio::test]
    async fn test_live_without_display_only_logs_header() {
        let log = MemoryLog::new();
        let text = run_live(&sh("echo hidden"), false, &log).await.unwrap();
        assert_eq!(text, "hidden\n");
        assert!(!log.contains("hidden"));
    }

    #[tokio::test]
    async fn test_live_launch_failure() {
        let err = run_live(
            &CommandSpec::new(["nonexistent-binary-xyz"]).unwrap(),
            true,
            &MemoryLog::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_silent_prefixes_lines_and_drops_stderr() {
        let text = run_silent(&sh("echo a; echo noise >&2; echo b")).await.unwrap();
        assert_eq!(text, "\na\nb");
    }

    #[tokio::test]
    async fn test_silent_waits_for_exit() {
        let start = std::time::Instant::now();
        let text = run_silent(&sh("sleep 0.2; echo late")).await.unwrap();
        assert_eq!(text, "\nlate");
        assert!(start.elapsed().as_millis() >= 150);
    }
}
