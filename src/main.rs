mod command;
mod config;
mod launcher;
mod monitor;
mod outcome;
mod reader;
mod retry;
mod session;
mod shell;
mod sink;
mod state;
mod watchdog;

use clap::{Parser, Subcommand};
use command::CommandSpec;
use config::{CadiConfig, WatchdogConfig};
use outcome::{ExecError, ExecutionResult};
use serde::Serialize;
use sink::{ConsoleSink, MemoryLog, SharedSink, TracingSink};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit status reported when the child ran out of its time budget.
const EXIT_TIMED_OUT: u8 = 124;

/// Supervised execution of external tools: fixed timeouts, keyword-reset
/// watchdogs, and escalation to an elevated installer.
#[derive(Parser, Debug)]
#[command(name = "cadi", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "cadi.toml", global = true)]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print results in the legacy text form ("Timeout!!! " prefix, "CritERROR!!!" on failure)
    #[arg(long, global = true, conflicts_with = "json")]
    legacy: bool,

    /// Debug logging (spawn, keyword resets, drain decisions)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a command under a fixed timeout, or under a watchdog when keywords are given
    Run {
        /// Timeout in milliseconds (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Output keyword that resets the watchdog (repeatable)
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,

        /// Use the watchdog runner even without keywords
        #[arg(long)]
        watchdog: bool,

        /// Echo output as it arrives (watchdog runner only)
        #[arg(long)]
        realtime: bool,

        /// Program and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Run to completion over merged output, optionally echoing it live
    Live {
        #[arg(long)]
        display: bool,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Run to completion capturing stdout only, without logging
    Silent {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Run to completion capturing stdout and stderr separately
    Simple {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Send a command to the installer tool, retrying elevated on failure
    Installer {
        /// Timeout in milliseconds (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Installer arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env("CADI_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "config error");
            return ExitCode::FAILURE;
        }
    };

    if cli.dry_run {
        return match toml::to_string_pretty(&cfg) {
            Ok(rendered) => {
                println!("# resolved from {}", cli.config.display());
                print!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to render config");
                ExitCode::FAILURE
            }
        };
    }

    match dispatch(&cli, cfg).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "execution failed");
            if cli.legacy {
                println!("{}", e.legacy_text());
            } else if cli.json {
                println!("{}", serde_json::json!({ "status": "error", "error": e.to_string() }));
            }
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: &Cli, cfg: CadiConfig) -> Result<ExitCode, ExecError> {
    match &cli.command {
        Commands::Run {
            timeout_ms,
            keywords,
            watchdog,
            realtime,
            argv,
        } => {
            let spec = CommandSpec::new(argv.iter().cloned())?;
            let mut echoed = false;
            let diagnostics;
            let result = if *watchdog || *realtime || !keywords.is_empty() {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| cfg.watchdog.timeout());
                let keywords = if keywords.is_empty() {
                    cfg.watchdog.keywords.clone()
                } else {
                    keywords.clone()
                };
                let mut wd = WatchdogConfig::new(timeout, keywords);
                wd.realtime = cfg.watchdog.realtime || *realtime;
                diagnostics = Diagnostics::for_cli(cli, wd.realtime);
                echoed = diagnostics.echoes;
                session::run_with_watchdog(&spec, &wd, &cfg.runner, diagnostics.sink.clone())
                    .await?
            } else {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or_else(|| cfg.runner.timeout());
                diagnostics = Diagnostics::for_cli(cli, false);
                session::run_with_timeout(&spec, timeout, &cfg.runner, diagnostics.sink.clone())
                    .await?
            };
            Ok(report(cli, &result, echoed, diagnostics.memory.as_ref()))
        }
        Commands::Live { display, argv } => {
            let spec = CommandSpec::new(argv.iter().cloned())?;
            let diagnostics = Diagnostics::for_cli(cli, *display);
            let text = shell::run_live(&spec, *display, diagnostics.sink.as_ref()).await?;
            let text = if diagnostics.echoes { "" } else { text.as_str() };
            report_text(cli, text, diagnostics.memory.as_ref());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Silent { argv } => {
            let spec = CommandSpec::new(argv.iter().cloned())?;
            let text = shell::run_silent(&spec).await?;
            report_text(cli, &text, None);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Simple { argv } => {
            let spec = CommandSpec::new(argv.iter().cloned())?;
            let diagnostics = Diagnostics::for_cli(cli, false);
            let text = shell::run_simple(&spec, diagnostics.sink.as_ref()).await?;
            report_text(cli, &text, diagnostics.memory.as_ref());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Installer { timeout_ms, args } => {
            let installer = retry::Installer::new(
                cfg.installer.clone(),
                cfg.escalation.clone(),
                cfg.runner.clone(),
            );
            let diagnostics = Diagnostics::for_cli(cli, false);
            let timeout = timeout_ms.map(Duration::from_millis);
            let escalated = installer
                .send(args, timeout, diagnostics.sink.clone())
                .await?;
            tracing::info!(
                attempts = escalated.attempts,
                elevated = escalated.elevated,
                "installer command finished"
            );
            if cli.json {
                print_json(&escalated, diagnostics.memory.as_ref());
                Ok(exit_code(&escalated.result))
            } else {
                Ok(report(cli, &escalated.result, false, None))
            }
        }
    }
}

/// Where runner diagnostics go for one CLI invocation.
///
/// With `--json` they are collected in a `MemoryLog` and embedded in the JSON
/// document. Raw child output is echoed to stdout only when stdout carries
/// plain text; otherwise it goes to the tracing log.
struct Diagnostics {
    sink: SharedSink,
    memory: Option<MemoryLog>,
    /// Child output is streamed to stdout while it runs.
    echoes: bool,
}

impl Diagnostics {
    fn for_cli(cli: &Cli, echo: bool) -> Self {
        if cli.json {
            let memory = MemoryLog::new();
            Self {
                sink: Arc::new(memory.clone()),
                memory: Some(memory),
                echoes: false,
            }
        } else if echo && !cli.legacy {
            Self {
                sink: Arc::new(ConsoleSink),
                memory: None,
                echoes: true,
            }
        } else {
            Self {
                sink: Arc::new(TracingSink),
                memory: None,
                echoes: false,
            }
        }
    }
}

/// Print `value` as one JSON document, with the collected diagnostics under
/// `log` when there are any.
fn print_json<T: Serialize>(value: &T, log: Option<&MemoryLog>) {
    let mut doc = match serde_json::to_value(value) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize result");
            return;
        }
    };
    if let (Some(log), Some(fields)) = (log, doc.as_object_mut()) {
        fields.insert("log".to_string(), serde_json::Value::String(log.read()));
    }
    match serde_json::to_string_pretty(&doc) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "failed to serialize result"),
    }
}

fn exit_code(result: &ExecutionResult) -> ExitCode {
    if result.is_completed() {
        ExitCode::SUCCESS
    } else if result.is_timed_out() {
        ExitCode::from(EXIT_TIMED_OUT)
    } else {
        ExitCode::FAILURE
    }
}

/// Print a supervised result. With `echoed`, plain output was already streamed
/// to stdout while the child ran.
fn report(
    cli: &Cli,
    result: &ExecutionResult,
    echoed: bool,
    log: Option<&MemoryLog>,
) -> ExitCode {
    if cli.json {
        print_json(result, log);
    } else if cli.legacy {
        print!("{}", result.legacy_text());
    } else {
        if !echoed {
            print!("{}", result.output);
        }
        if result.truncated {
            tracing::warn!("output was truncated");
        }
    }
    exit_code(result)
}

fn report_text(cli: &Cli, text: &str, log: Option<&MemoryLog>) {
    if cli.json {
        print_json(&serde_json::json!({ "status": "completed", "output": text }), log);
    } else {
        print!("{text}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_parses_trailing_command_with_flags() {
        let cli = Cli::try_parse_from([
            "cadi", "run", "-k", "working", "--timeout-ms", "500", "driver.exe", "--scan", "-v",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                timeout_ms,
                keywords,
                argv,
                ..
            } => {
                assert_eq!(timeout_ms, Some(500));
                assert_eq!(keywords, vec!["working"]);
                assert_eq!(argv, vec!["driver.exe", "--scan", "-v"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(!cli.verbose);
    }

    #[test]
    fn test_global_flags_before_subcommand() {
        let cli = Cli::try_parse_from(["cadi", "--legacy", "-q", "silent", "ls"]).unwrap();
        assert!(cli.legacy);
        assert!(cli.quiet);
        assert_eq!(cli.config, PathBuf::from("cadi.toml"));
    }

    #[test]
    fn test_run_requires_a_command() {
        assert!(Cli::try_parse_from(["cadi", "run"]).is_err());
    }

    #[test]
    fn test_json_conflicts_with_legacy() {
        assert!(Cli::try_parse_from(["cadi", "--json", "--legacy", "simple", "ls"]).is_err());
    }

    #[test]
    fn test_json_output_never_echoes_to_stdout() {
        let cli = Cli::try_parse_from(["cadi", "--json", "live", "--display", "ls"]).unwrap();
        let diagnostics = Diagnostics::for_cli(&cli, true);
        assert!(!diagnostics.echoes);
        assert!(diagnostics.memory.is_some());
    }

    #[test]
    fn test_legacy_output_never_echoes_to_stdout() {
        let cli = Cli::try_parse_from(["cadi", "--legacy", "run", "--realtime", "ls"]).unwrap();
        let diagnostics = Diagnostics::for_cli(&cli, true);
        assert!(!diagnostics.echoes);
        assert!(diagnostics.memory.is_none());
    }

    #[test]
    fn test_plain_output_echoes_when_asked() {
        let cli = Cli::try_parse_from(["cadi", "live", "--display", "ls"]).unwrap();
        assert!(Diagnostics::for_cli(&cli, true).echoes);
        assert!(!Diagnostics::for_cli(&cli, false).echoes);
    }

    #[tokio::test]
    async fn test_json_diagnostics_collect_runner_log() {
        let cli = Cli::try_parse_from(["cadi", "--json", "run", "echo", "hi"]).unwrap();
        let diagnostics = Diagnostics::for_cli(&cli, false);
        let spec = CommandSpec::new(["echo", "hi"]).unwrap();
        let result = session::run_with_timeout(
            &spec,
            Duration::from_secs(5),
            &config::RunnerConfig::default(),
            diagnostics.sink.clone(),
        )
        .await
        .unwrap();
        assert_eq!(result.output, "hi\n");
        let log = diagnostics.memory.unwrap().read();
        assert!(log.contains("###executing timeout command: echo###"));
    }

    #[test]
    fn test_installer_accepts_no_args() {
        let cli = Cli::try_parse_from(["cadi", "installer"]).unwrap();
        assert!(matches!(cli.command, Commands::Installer { .. }));
    }
}
