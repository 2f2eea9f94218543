//! Configuration loading and validation.
//!
//! Loads outbox configuration from `~/.outbox/config.toml` (or
//! `$OUTBOX_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults. The resulting [`OutboxConfig`] is
//! constructed once at startup and passed explicitly into the stores and
//! the dispatcher — no ambient globals.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level outbox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Retry policy bounds.
    pub retry: RetryConfig,

    /// Dispatch pass sizing and recovery windows.
    pub dispatch: DispatchConfig,

    /// Mail transport command.
    pub transport: TransportConfig,

    /// Permanent-failure alerting.
    pub notify: NotifyConfig,

    /// Named recipient groups, expanded at dispatch time.
    pub groups: BTreeMap<String, Vec<String>>,
}

/// Retry policy bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Default attempt ceiling for new messages.
    pub max_attempts: u32,

    /// First retry delay in seconds; doubles per attempt.
    pub base_backoff_secs: u64,

    /// Retry delay ceiling in seconds.
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

/// Dispatch pass sizing and recovery windows.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum items handled per dispatch run.
    pub batch_size: usize,

    /// Seconds after which a `sending` item is assumed crashed and
    /// requeued.
    pub stale_sending_secs: u64,

    /// Per-item transport timeout in seconds.
    pub send_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            stale_sending_secs: default_stale_sending(),
            send_timeout_secs: default_send_timeout(),
        }
    }
}

/// Mail transport command configuration.
///
/// The command receives the fully resolved outbound message as JSON on
/// stdin and prints the transport message id on stdout. MIME assembly
/// and the network call live behind this boundary, outside the crate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Executable to spawn per send.
    pub command: String,

    /// Arguments passed to the command.
    pub args: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            command: "sendmail".to_owned(),
            args: Vec::new(),
        }
    }
}

/// Permanent-failure alerting configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Webhook URL receiving a JSON alert per permanent failure.
    /// Alerts are disabled when absent.
    pub webhook_url: Option<String>,
}

// Default value functions for serde

fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff() -> u64 {
    60
}
fn default_max_backoff() -> u64 {
    3600
}
fn default_batch_size() -> usize {
    25
}
fn default_stale_sending() -> u64 {
    900
}
fn default_send_timeout() -> u64 {
    60
}

impl OutboxConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$OUTBOX_CONFIG_PATH` or `<outbox dir>/config.toml`.
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path(|key| std::env::var(key).ok())?;
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                let config: OutboxConfig = toml::from_str(&contents).map_err(|e| {
                    anyhow::anyhow!("failed to parse config at {}: {e}", path.display())
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Apply environment variable overrides (env > file > defaults).
    ///
    /// Takes a resolver function for testability. Invalid values are
    /// ignored with a warning rather than failing startup.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("OUTBOX_MAX_ATTEMPTS") {
            match v.parse() {
                Ok(n) if n >= 1 => self.retry.max_attempts = n,
                _ => warn_invalid("OUTBOX_MAX_ATTEMPTS", &v),
            }
        }
        if let Some(v) = env("OUTBOX_BASE_BACKOFF_SECS") {
            match v.parse() {
                Ok(n) => self.retry.base_backoff_secs = n,
                Err(_) => warn_invalid("OUTBOX_BASE_BACKOFF_SECS", &v),
            }
        }
        if let Some(v) = env("OUTBOX_MAX_BACKOFF_SECS") {
            match v.parse() {
                Ok(n) => self.retry.max_backoff_secs = n,
                Err(_) => warn_invalid("OUTBOX_MAX_BACKOFF_SECS", &v),
            }
        }
        if let Some(v) = env("OUTBOX_BATCH_SIZE") {
            match v.parse() {
                Ok(n) if n >= 1 => self.dispatch.batch_size = n,
                _ => warn_invalid("OUTBOX_BATCH_SIZE", &v),
            }
        }
        if let Some(v) = env("OUTBOX_STALE_SENDING_SECS") {
            match v.parse() {
                Ok(n) => self.dispatch.stale_sending_secs = n,
                Err(_) => warn_invalid("OUTBOX_STALE_SENDING_SECS", &v),
            }
        }
        if let Some(v) = env("OUTBOX_SEND_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.dispatch.send_timeout_secs = n,
                Err(_) => warn_invalid("OUTBOX_SEND_TIMEOUT_SECS", &v),
            }
        }
        if let Some(v) = env("OUTBOX_TRANSPORT_COMMAND") {
            self.transport.command = v;
        }
        if let Some(v) = env("OUTBOX_WEBHOOK_URL") {
            self.notify.webhook_url = Some(v);
        }
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: OutboxConfig = toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("failed to parse config TOML: {e}"))?;
        Ok(config)
    }
}

fn warn_invalid(var: &str, value: &str) {
    tracing::warn!(var, value, "ignoring invalid env override");
}

// ── Paths ───────────────────────────────────────────────────────

/// Filesystem layout of the outbox state directory.
#[derive(Debug, Clone)]
pub struct OutboxPaths {
    /// State directory root (`~/.outbox` by default).
    pub root: PathBuf,
    /// Pending queue file (one JSON record per non-terminal item).
    pub queue_file: PathBuf,
    /// Append-only history file for terminal records.
    pub history_file: PathBuf,
    /// Dispatch run lock file.
    pub lock_file: PathBuf,
    /// Dispatch run log directory.
    pub logs_dir: PathBuf,
}

impl OutboxPaths {
    /// Lay out the standard files under the given root.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            queue_file: root.join("queue.jsonl"),
            history_file: root.join("history.jsonl"),
            lock_file: root.join("dispatch.lock"),
            logs_dir: root.join("logs"),
            root,
        }
    }
}

/// Resolve the outbox state directory: `$OUTBOX_DIR` or `~/.outbox`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn outbox_paths() -> anyhow::Result<OutboxPaths> {
    outbox_paths_with(|key| std::env::var(key).ok())
}

/// Resolve the state directory using a custom env resolver (for testing).
///
/// # Errors
///
/// Returns an error if no override is set and the home directory cannot
/// be determined.
pub fn outbox_paths_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<OutboxPaths> {
    if let Some(dir) = env("OUTBOX_DIR") {
        return Ok(OutboxPaths::under(dir));
    }
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(OutboxPaths::under(home.home_dir().join(".outbox")))
}

/// Resolve the config file path: `$OUTBOX_CONFIG_PATH` or
/// `<outbox dir>/config.toml`.
fn config_path(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(p) = env("OUTBOX_CONFIG_PATH") {
        return Ok(PathBuf::from(p));
    }
    Ok(outbox_paths_with(env)?.root.join("config.toml"))
}
