//! Configuration parsing.
//!
//! One TOML file (`distguard.toml`) configures the host description, the
//! manifest store, the compiler and the verification daemon. Every section
//! and field has a default, so an empty file is valid except that
//! verification needs `host.os_version`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorClass;
use crate::compiler::default_concurrency;
use crate::prelink::{DEFAULT_PRELINK_ARGS, DEFAULT_PRELINK_PROGRAM, PrelinkTool};
use crate::schedule::{DEFAULT_MIN_INTERVAL_HOURS, RunSchedule};
use crate::verifier::{
    DEFAULT_BIG_DIRECTORY_THRESHOLD, DEFAULT_HOSTNAME_PLACEHOLDER, DEFAULT_MAX_DEPTH,
    DEFAULT_SYSTEM_ID_MAX, DEFAULT_THROTTLE_FACTOR, MAILMAN_WRAPPER_PATTERN, Server, SetuidException, Throttle,
    VerifyOptions,
};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/distguard/distguard.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistguardConfig {
    /// Host description.
    #[serde(default)]
    pub host: HostConfig,

    /// Manifest store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Classification lists.
    #[serde(default)]
    pub rules: RulesConfig,

    /// Manifest compiler.
    #[serde(default)]
    pub compile: CompileConfig,

    /// Verifier.
    #[serde(default)]
    pub verify: VerifyConfig,

    /// Scheduler daemon.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Host description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Host name; defaults to the kernel host name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// OS version whose manifest applies to this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    /// Directory that stands for `/` when verifying.
    #[serde(default = "default_root")]
    pub root: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            os_version: None,
            root: default_root(),
        }
    }
}

/// Manifest store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// `SQLite` database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Classification list location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    /// Directory holding one subdirectory per OS version.
    #[serde(default = "default_rules_dir")]
    pub dir: PathBuf,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dir: default_rules_dir(),
        }
    }
}

/// Manifest compiler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompileConfig {
    /// Directory holding one template tree per OS version.
    #[serde(default = "default_template_root")]
    pub template_root: PathBuf,

    /// Worker count; defaults to `max(4, 2 × cores)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    /// Unprelink program.
    #[serde(default = "default_prelink_program")]
    pub prelink_program: PathBuf,

    /// Arguments placed before the file path.
    #[serde(default = "default_prelink_args")]
    pub prelink_args: Vec<String>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            template_root: default_template_root(),
            concurrency: None,
            prelink_program: default_prelink_program(),
            prelink_args: default_prelink_args(),
        }
    }
}

impl CompileConfig {
    /// Effective worker count.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.concurrency.unwrap_or_else(default_concurrency)
    }

    /// The configured unprelink tool.
    #[must_use]
    pub fn prelink_tool(&self) -> PrelinkTool {
        PrelinkTool::new(&self.prelink_program, self.prelink_args.iter().cloned())
    }
}

/// An accepted set-id file under user directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetuidExceptionConfig {
    /// Path regex.
    pub pattern: String,
    /// Exact permission bits (TOML accepts `0o2755`).
    pub mode: u32,
    /// Expected owner; `$1` refers to the first capture.
    pub owner: String,
    /// Expected group.
    pub group: String,
}

/// Verifier and schedule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyConfig {
    /// Local hour in which scheduled runs start.
    #[serde(default = "default_run_hour")]
    pub run_hour: u32,

    /// Minimum hours between scheduled runs.
    #[serde(default = "default_min_interval_hours")]
    pub min_interval_hours: u32,

    /// Watchdog limit on one run, in seconds.
    #[serde(default = "default_max_run_secs")]
    pub max_run_secs: u64,

    /// Post-hash sleep as a fraction of hashing time; 0 disables.
    #[serde(default = "default_throttle_factor")]
    pub throttle_factor: f64,

    /// Cap on one throttle sleep, in milliseconds.
    #[serde(default = "default_throttle_max_ms")]
    pub throttle_max_ms: u64,

    /// BIG_DIRECTORY threshold.
    #[serde(default = "default_big_directory_threshold")]
    pub big_directory_threshold: usize,

    /// Walk user directories on scheduled runs.
    #[serde(default = "default_true")]
    pub include_user_dirs: bool,

    /// Token standing for the host name in manifest paths.
    #[serde(default = "default_hostname_placeholder")]
    pub hostname_placeholder: String,

    /// Highest uid/gid of the system range.
    #[serde(default = "default_system_id_max")]
    pub system_id_max: u32,

    /// Directory nesting below which the walk stops descending.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Accepted set-id files.
    #[serde(default = "default_setuid_exceptions")]
    pub setuid_exceptions: Vec<SetuidExceptionConfig>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            run_hour: default_run_hour(),
            min_interval_hours: default_min_interval_hours(),
            max_run_secs: default_max_run_secs(),
            throttle_factor: default_throttle_factor(),
            throttle_max_ms: default_throttle_max_ms(),
            big_directory_threshold: default_big_directory_threshold(),
            include_user_dirs: true,
            hostname_placeholder: default_hostname_placeholder(),
            system_id_max: default_system_id_max(),
            max_depth: default_max_depth(),
            setuid_exceptions: default_setuid_exceptions(),
        }
    }
}

impl VerifyConfig {
    /// Watchdog limit.
    #[must_use]
    pub const fn max_run(&self) -> Duration {
        Duration::from_secs(self.max_run_secs)
    }

    /// Daily run window.
    #[must_use]
    pub fn schedule(&self) -> RunSchedule {
        RunSchedule {
            run_hour: self.run_hour,
            min_interval: chrono::Duration::hours(i64::from(self.min_interval_hours)),
        }
    }

    /// Builds verifier options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if an exception pattern does not
    /// compile.
    pub fn options(&self, include_user_dirs: bool) -> Result<VerifyOptions, ConfigError> {
        let setuid_exceptions = self
            .setuid_exceptions
            .iter()
            .map(|e| {
                SetuidException::new(&e.pattern, e.mode, e.owner.clone(), e.group.clone()).map_err(
                    |err| ConfigError::Validation(format!("setuid exception {:?}: {err}", e.pattern)),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VerifyOptions {
            include_user_dirs,
            hostname_placeholder: self.hostname_placeholder.clone(),
            big_directory_threshold: self.big_directory_threshold,
            throttle: Throttle {
                factor: self.throttle_factor,
                max: Duration::from_millis(self.throttle_max_ms),
            },
            system_id_max: self.system_id_max,
            max_depth: self.max_depth,
            setuid_exceptions,
        })
    }
}

/// Scheduler daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Last-run state file.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Presence forces a run on the next wake.
    #[serde(default = "default_force_file")]
    pub force_file: PathBuf,

    /// Presence limits runs to system paths.
    #[serde(default = "default_no_user_dirs_file")]
    pub no_user_dirs_file: PathBuf,

    /// Directory receiving JSON reports.
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    /// Wake interval in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Single-instance lock file.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            force_file: default_force_file(),
            no_user_dirs_file: default_no_user_dirs_file(),
            report_dir: default_report_dir(),
            poll_interval_secs: default_poll_interval_secs(),
            lock_file: default_lock_file(),
        }
    }
}

impl DaemonConfig {
    /// Wake interval.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl DistguardConfig {
    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parses and validates TOML content.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let verify = &self.verify;
        if verify.run_hour > 23 {
            return Err(ConfigError::Validation(format!(
                "verify.run_hour must be 0-23, got {}",
                verify.run_hour
            )));
        }
        if self.compile.concurrency == Some(0) {
            return Err(ConfigError::Validation(
                "compile.concurrency must be positive".to_string(),
            ));
        }
        if verify.max_run_secs == 0 {
            return Err(ConfigError::Validation(
                "verify.max_run_secs must be positive".to_string(),
            ));
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "daemon.poll_interval_secs must be positive".to_string(),
            ));
        }
        if !(verify.throttle_factor.is_finite() && verify.throttle_factor >= 0.0) {
            return Err(ConfigError::Validation(format!(
                "verify.throttle_factor must be a non-negative number, got {}",
                verify.throttle_factor
            )));
        }
        if verify.max_depth == 0 {
            return Err(ConfigError::Validation(
                "verify.max_depth must be positive".to_string(),
            ));
        }
        if verify.hostname_placeholder.is_empty() {
            return Err(ConfigError::Validation(
                "verify.hostname_placeholder must not be empty".to_string(),
            ));
        }
        verify.options(true).map(|_| ())
    }

    /// Configured host name, or the kernel's.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Hostname`] if the kernel host name is
    /// unavailable or not UTF-8.
    pub fn hostname(&self) -> Result<String, ConfigError> {
        if let Some(name) = &self.host.hostname {
            return Ok(name.clone());
        }
        nix::unistd::gethostname()
            .map_err(|e| ConfigError::Hostname(e.to_string()))?
            .into_string()
            .map_err(|raw| ConfigError::Hostname(format!("not UTF-8: {raw:?}")))
    }

    /// Host description for the verifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `host.os_version` is unset.
    pub fn server(&self) -> Result<Server, ConfigError> {
        let os_version = self.host.os_version.clone().ok_or_else(|| {
            ConfigError::Validation("host.os_version is required for verification".to_string())
        })?;
        Ok(Server {
            hostname: self.hostname()?,
            os_version,
            root: self.host.root.clone(),
        })
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration file {}: {source}", path.display())]
    Io {
        /// Configuration file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("configuration validation failed: {0}")]
    Validation(String),

    /// The host name could not be determined.
    #[error("cannot determine host name: {0}")]
    Hostname(String),
}

impl ConfigError {
    /// Category used for exit codes.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Io { .. } | Self::Hostname(_) => ErrorClass::Io,
            Self::Parse(_) | Self::Validation(_) => ErrorClass::Data,
            Self::Serialize(_) => ErrorClass::Internal,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/distguard/manifest.db")
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("/etc/distguard/rules")
}

fn default_template_root() -> PathBuf {
    PathBuf::from("/srv/distguard/templates")
}

fn default_prelink_program() -> PathBuf {
    PathBuf::from(DEFAULT_PRELINK_PROGRAM)
}

fn default_prelink_args() -> Vec<String> {
    DEFAULT_PRELINK_ARGS.iter().map(ToString::to_string).collect()
}

const fn default_run_hour() -> u32 {
    3
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn default_min_interval_hours() -> u32 {
    DEFAULT_MIN_INTERVAL_HOURS as u32
}

const fn default_max_run_secs() -> u64 {
    6 * 3600
}

const fn default_throttle_factor() -> f64 {
    DEFAULT_THROTTLE_FACTOR
}

const fn default_throttle_max_ms() -> u64 {
    5_000
}

const fn default_big_directory_threshold() -> usize {
    DEFAULT_BIG_DIRECTORY_THRESHOLD
}

const fn default_true() -> bool {
    true
}

fn default_hostname_placeholder() -> String {
    DEFAULT_HOSTNAME_PLACEHOLDER.to_string()
}

const fn default_system_id_max() -> u32 {
    DEFAULT_SYSTEM_ID_MAX
}

const fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_setuid_exceptions() -> Vec<SetuidExceptionConfig> {
    vec![SetuidExceptionConfig {
        pattern: MAILMAN_WRAPPER_PATTERN.to_string(),
        mode: 0o2755,
        owner: "$1".to_string(),
        group: "mail".to_string(),
    }]
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/distguard/state.json")
}

fn default_force_file() -> PathBuf {
    PathBuf::from("/var/lib/distguard/force")
}

fn default_no_user_dirs_file() -> PathBuf {
    PathBuf::from("/var/lib/distguard/no-user-dirs")
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("/var/lib/distguard/reports")
}

const fn default_poll_interval_secs() -> u64 {
    300
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/run/distguard.lock")
}
