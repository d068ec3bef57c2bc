use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from cadi.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CadiConfig {
    pub runner: RunnerConfig,
    pub watchdog: WatchdogConfig,
    pub escalation: EscalationConfig,
    pub installer: InstallerConfig,
}

/// Settings shared by the supervised runners.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Budget for the fixed-timeout runner.
    pub timeout_ms: u64,
    /// How long the reader may keep draining after the child exits.
    pub drain_grace_ms: u64,
    /// Output beyond this many bytes is dropped.
    pub max_output_bytes: usize,
}

/// Watchdog runner settings: the timeout, the keywords that reset it, and
/// whether output is forwarded to the log as it arrives.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub timeout_ms: u64,
    pub keywords: Vec<String>,
    pub realtime: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Substring in the primary attempt's output that triggers the elevated retry.
    pub failure_marker: String,
    pub timeout_ms: u64,
}

/// Where the native installer tool and its elevated wrapper live.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Directory holding both executables. Unset means resolve through PATH.
    pub tool_dir: Option<PathBuf>,
    pub program: String,
    pub elevated_program: String,
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

impl WatchdogConfig {
    pub fn new(timeout: Duration, keywords: Vec<String>) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            keywords,
            realtime: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EscalationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl InstallerConfig {
    fn resolve(&self, program: &str) -> String {
        match &self.tool_dir {
            Some(dir) => dir.join(program).to_string_lossy().into_owned(),
            None => program.to_string(),
        }
    }

    pub fn program_path(&self) -> String {
        self.resolve(&self.program)
    }

    pub fn elevated_program_path(&self) -> String {
        self.resolve(&self.elevated_program)
    }
}

// --- Default implementations ---

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 90_000,
            drain_grace_ms: 100,
            max_output_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 90_000,
            keywords: Vec::new(),
            realtime: false,
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            failure_marker: " failed".to_string(),
            timeout_ms: 90_000,
        }
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        let arch = if cfg!(target_pointer_width = "64") {
            "x64"
        } else {
            "x86"
        };
        Self {
            tool_dir: None,
            program: format!("driver_{arch}.exe"),
            elevated_program: format!("driver_{arch}_elevate.exe"),
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<CadiConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(CadiConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
