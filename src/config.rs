use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from watchkeeper.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WatchkeeperConfig {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub timer: TimerConfig,
    pub stop: StopConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub duration_secs: u64,
    pub warning_secs: u64,
    pub failsafe_buffer_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    pub grace_period_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
    pub timeout_secs: u64,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3267,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "watchkeeper-worker".to_string(),
            args: vec!["--".to_string(), "./probe.sh".to_string()],
            working_dir: None,
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60 * 60,
            warning_secs: 5 * 60,
            failsafe_buffer_secs: 5 * 60,
        }
    }
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: "https://api.telegram.org".to_string(),
            timeout_secs: 10,
        }
    }
}

impl NotifyConfig {
    /// Notifications are only enabled when both token and chat id are set.
    pub fn is_enabled(&self) -> bool {
        !self.bot_token.trim().is_empty() && !self.chat_id.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl StopConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Values parsed but are inconsistent.
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Load config from `path`, falling back to defaults when the file is absent.
///
/// TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID from the environment take
/// precedence over the file.
pub fn load_config(path: &Path) -> Result<WatchkeeperConfig, ConfigError> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => parse_config(path, &contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            WatchkeeperConfig::default()
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    apply_env_overrides(&mut config.notify, |key| std::env::var(key).ok());
    Ok(config)
}

fn parse_config(path: &Path, contents: &str) -> Result<WatchkeeperConfig, ConfigError> {
    toml::from_str(contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

fn apply_env_overrides(notify: &mut NotifyConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(token) = lookup("TELEGRAM_BOT_TOKEN").filter(|v| !v.is_empty()) {
        notify.bot_token = token;
    }
    if let Some(chat_id) = lookup("TELEGRAM_CHAT_ID").filter(|v| !v.is_empty()) {
        notify.chat_id = chat_id;
    }
}

impl WatchkeeperConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timer.duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "timer.duration_secs must be greater than zero".to_string(),
            ));
        }
        if self.timer.warning_secs >= self.timer.duration_secs {
            return Err(ConfigError::Invalid(format!(
                "timer.warning_secs ({}) must be less than timer.duration_secs ({})",
                self.timer.warning_secs, self.timer.duration_secs
            )));
        }
        if self.stop.grace_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "stop.grace_period_secs must be greater than zero".to_string(),
            ));
        }
        if self.worker.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "worker.command must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
