//! Engine Configuration
//!
//! Settings are read from an optional YAML file and then overridden by
//! `SCATTERFLOW_*` environment variables. Every field has a default, so an
//! empty file (or no file) is a valid configuration.
//!
//! ```yaml
//! backend: local
//! working_root: /data/scatterflow
//! heartbeat_interval_seconds: 60
//! task_timeout_hours: 24
//! retries:
//!   analysis: 1
//!   system: 10
//!   timeout: 0
//! system_retry_delay_seconds: 1
//! preserve_on_failure: false
//! ```

use std::env;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::FailureKind;

/// Prefix of every environment variable read by [`Settings::apply_env`].
pub const ENV_PREFIX: &str = "SCATTERFLOW_";

/// Heartbeat timeout as a multiple of the heartbeat interval.
const HEARTBEAT_TIMEOUT_FACTOR: f64 = 2.5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Environment variable {name} has invalid value '{value}'")]
    InvalidEnv { name: String, value: String },

    #[error("Unknown backend '{0}' (expected local, cloud or cluster)")]
    UnknownBackend(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Which task manager executes task attempts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Cloud,
    Cluster,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" | "google_cloud" => Ok(Self::Cloud),
            "cluster" | "elasticluster" | "slurm" => Ok(Self::Cluster),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

/// Retries allowed per failure kind before a task fails for good.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub analysis: u32,
    pub system: u32,
    pub timeout: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            analysis: 1,
            system: 10,
            timeout: 0,
        }
    }
}

impl RetryPolicy {
    pub fn max_for(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Analysis => self.analysis,
            FailureKind::System => self.system,
            FailureKind::Timeout => self.timeout,
        }
    }

    /// The same budget for every failure kind.
    pub fn uniform(retries: u32) -> Self {
        Self {
            analysis: retries,
            system: retries,
            timeout: retries,
        }
    }
}

/// Batch scheduler submission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClusterSettings {
    pub submit_command: String,
    pub cancel_command: String,
    pub extra_args: Vec<String>,
    /// Directory visible to cluster nodes; defaults to the working root
    pub shared_dir: Option<PathBuf>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            submit_command: "sbatch".to_string(),
            cancel_command: "scancel".to_string(),
            extra_args: Vec::new(),
            shared_dir: None,
        }
    }
}

/// Worker provisioning hooks. Both commands receive the attempt description
/// through `SCATTERFLOW_ATTEMPT_*` environment variables.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct CloudSettings {
    pub launch_command: Option<String>,
    pub cleanup_command: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendKind,
    pub working_root: PathBuf,
    pub heartbeat_interval_seconds: f64,
    /// Defaults to 2.5 heartbeat intervals
    pub heartbeat_timeout_seconds: Option<f64>,
    pub heartbeat_write_retries: u32,
    pub system_check_interval_seconds: f64,
    pub task_timeout_hours: f64,
    pub retries: RetryPolicy,
    /// Retry after the n-th system failure waits this times 2^n seconds
    pub system_retry_delay_seconds: f64,
    /// Never clean up attempts
    pub preserve_all: bool,
    /// Leave failed attempts in place for inspection
    pub preserve_on_failure: bool,
    pub cluster: ClusterSettings,
    pub cloud: CloudSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            working_root: env::temp_dir().join("scatterflow"),
            heartbeat_interval_seconds: 60.0,
            heartbeat_timeout_seconds: None,
            heartbeat_write_retries: 5,
            system_check_interval_seconds: 60.0,
            task_timeout_hours: 24.0,
            retries: RetryPolicy::default(),
            system_retry_delay_seconds: 1.0,
            preserve_all: false,
            preserve_on_failure: false,
            cluster: ClusterSettings::default(),
            cloud: CloudSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if given), then applies environment
    /// overrides and validates the result.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => {
                info!("Loading settings from: {}", path);
                let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_string(),
                    source,
                })?;
                Self::from_yaml(&content)?
            }
            None => Self::default(),
        };

        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Overrides fields from `SCATTERFLOW_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(backend) = env_value::<String>("BACKEND")? {
            self.backend = backend.parse()?;
        }
        if let Some(root) = env_value::<PathBuf>("WORKING_ROOT")? {
            self.working_root = root;
        }
        if let Some(v) = env_value("HEARTBEAT_INTERVAL_SECONDS")? {
            self.heartbeat_interval_seconds = v;
        }
        if let Some(v) = env_value("HEARTBEAT_TIMEOUT_SECONDS")? {
            self.heartbeat_timeout_seconds = Some(v);
        }
        if let Some(v) = env_value("SYSTEM_CHECK_INTERVAL_SECONDS")? {
            self.system_check_interval_seconds = v;
        }
        if let Some(v) = env_value("TASK_TIMEOUT_HOURS")? {
            self.task_timeout_hours = v;
        }
        if let Some(v) = env_value("MAXIMUM_RETRIES_FOR_ANALYSIS_FAILURE")? {
            self.retries.analysis = v;
        }
        if let Some(v) = env_value("MAXIMUM_RETRIES_FOR_SYSTEM_FAILURE")? {
            self.retries.system = v;
        }
        if let Some(v) = env_value("MAXIMUM_RETRIES_FOR_TIMEOUT_FAILURE")? {
            self.retries.timeout = v;
        }
        if let Some(v) = env_value("SYSTEM_RETRY_DELAY_SECONDS")? {
            self.system_retry_delay_seconds = v;
        }
        if let Some(v) = env_value("PRESERVE_ALL")? {
            self.preserve_all = v;
        }
        if let Some(v) = env_value("PRESERVE_ON_FAILURE")? {
            self.preserve_on_failure = v;
        }
        Ok(())
    }

    /// Rejects intervals that are not positive, finite numbers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("heartbeat_interval_seconds", Some(self.heartbeat_interval_seconds)),
            ("heartbeat_timeout_seconds", self.heartbeat_timeout_seconds),
            ("system_check_interval_seconds", Some(self.system_check_interval_seconds)),
            ("task_timeout_hours", Some(self.task_timeout_hours)),
        ];

        for (name, value) in checks {
            if let Some(value) = value {
                if !value.is_finite() || value <= 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "{} must be a positive number, got {}",
                        name, value
                    )));
                }
            }
        }

        let delay = self.system_retry_delay_seconds;
        if !delay.is_finite() || delay < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "system_retry_delay_seconds must not be negative, got {}",
                delay
            )));
        }
        Ok(())
    }

    /// Wait before retrying a task after its `failures`-th system failure.
    pub fn system_retry_delay(&self, failures: u32) -> Duration {
        let factor = 2f64.powi(failures.min(16) as i32);
        Duration::from_secs_f64(self.system_retry_delay_seconds * factor)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs_f64(
            self.heartbeat_timeout_seconds
                .unwrap_or(self.heartbeat_interval_seconds * HEARTBEAT_TIMEOUT_FACTOR),
        )
    }

    pub fn system_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.system_check_interval_seconds)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.task_timeout_hours * 3600.0)
    }
}

fn env_value<T: FromStr>(suffix: &str) -> Result<Option<T>, ConfigError> {
    let name = format!("{}{}", ENV_PREFIX, suffix);
    match env::var(&name) {
        Ok(value) => {
            debug!("Setting override from {}", name);
            value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidEnv { name, value })
        }
        Err(_) => Ok(None),
    }
}
