//! host.toml configuration parser.
//!
//! Every section is optional. Missing values fall back to the defaults a
//! production host runs with, so an empty file is a valid configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating a host configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub health: HealthMonitorOptions,
    pub sampler: SamplerOptions,
    pub lifecycle: LifecycleOptions,
    pub workers: Vec<WorkerConfig>,
}

/// Thresholds and cadence for host health monitoring.
///
/// These can change at runtime; consumers re-read them on every check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorOptions {
    /// Whether the periodic health check runs at all.
    pub enabled: bool,
    /// Fraction in (0, 1]. A sandbox counter above `limit * counter_threshold`
    /// is exceeded; CPU is compared against `counter_threshold * 100`.
    pub counter_threshold: f64,
    /// Cadence of the health check loop.
    #[serde(with = "duration_str")]
    pub health_check_interval: Duration,
    /// Trailing window over which unhealthy verdicts are counted.
    #[serde(with = "duration_str")]
    pub health_check_window: Duration,
    /// Number of unhealthy verdicts within the window that trigger action.
    pub health_check_threshold: u32,
    /// Upper bound on a single worker status query.
    #[serde(with = "duration_str")]
    pub worker_status_timeout: Duration,
}

impl Default for HealthMonitorOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            counter_threshold: 0.80,
            health_check_interval: Duration::from_secs(10),
            health_check_window: Duration::from_secs(120),
            health_check_threshold: 6,
            worker_status_timeout: Duration::from_secs(5),
        }
    }
}

/// CPU sampler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerOptions {
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Ring buffer capacity for the CPU load history.
    pub history_size: usize,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            history_size: 10,
        }
    }
}

/// What the controller does once the unhealthy threshold is breached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyAction {
    /// Tear down the runtime and build a fresh one.
    #[default]
    Restart,
    /// Stop the host and leave process exit to the supervisor.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleOptions {
    /// How long a stop may take before the host is declared stopped anyway.
    #[serde(with = "duration_str")]
    pub stop_grace_period: Duration,
    pub unhealthy_action: UnhealthyAction,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            stop_grace_period: Duration::from_secs(30),
            unhealthy_action: UnhealthyAction::Restart,
        }
    }
}

/// An out-of-process language worker launched by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl HostConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: HostConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the health policy meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.health;
        if !(h.counter_threshold > 0.0 && h.counter_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "health.counter_threshold must be in (0, 1], got {}",
                h.counter_threshold
            )));
        }
        if h.health_check_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.health_check_threshold must be at least 1".to_string(),
            ));
        }
        if h.health_check_interval.is_zero() || h.health_check_window.is_zero() {
            return Err(ConfigError::Invalid(
                "health intervals must be non-zero".to_string(),
            ));
        }
        if self.sampler.history_size == 0 || self.sampler.interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sampler.history_size and sampler.interval must be non-zero".to_string(),
            ));
        }
        for w in &self.workers {
            if w.id.is_empty() || w.command.is_empty() {
                return Err(ConfigError::Invalid(
                    "workers need a non-empty id and command".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Parse a duration string like "500ms", "5s", "2m", "1h", or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok()?.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok()?.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else if d.as_secs() % 3600 == 0 && d.as_secs() > 0 {
        format!("{}h", d.as_secs() / 3600)
    } else if d.as_secs() % 60 == 0 && d.as_secs() > 0 {
        format!("{}m", d.as_secs() / 60)
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration '{s}'")))
    }
}
