//! Configuration publishing and hot reload.
//!
//! Health and lifecycle options flow to their consumers through watch
//! channels and apply on next use. Worker and sampler settings only take
//! effect when a runtime is built, so changing them restarts the host.

use std::path::{Path, PathBuf};

use tokio::sync::watch;
use tracing::{info, warn};

use fnhost_core::{ConfigError, HealthMonitorOptions, HostConfig, LifecycleOptions};
use fnhost_lifecycle::{LifecycleController, RestartReason};

pub struct ConfigChannels {
    config: watch::Sender<HostConfig>,
    health: watch::Sender<HealthMonitorOptions>,
    lifecycle: watch::Sender<LifecycleOptions>,
}

impl ConfigChannels {
    pub fn new(config: HostConfig) -> Self {
        let (health, _) = watch::channel(config.health.clone());
        let (lifecycle, _) = watch::channel(config.lifecycle.clone());
        let (config, _) = watch::channel(config);
        Self {
            config,
            health,
            lifecycle,
        }
    }

    pub fn config(&self) -> watch::Receiver<HostConfig> {
        self.config.subscribe()
    }

    pub fn health(&self) -> watch::Receiver<HealthMonitorOptions> {
        self.health.subscribe()
    }

    pub fn lifecycle(&self) -> watch::Receiver<LifecycleOptions> {
        self.lifecycle.subscribe()
    }

    /// Publish a new configuration. Returns true when the runtime has to be
    /// rebuilt for it to take effect.
    pub fn publish(&self, next: HostConfig) -> bool {
        let rebuild = {
            let current = self.config.borrow();
            current.workers != next.workers || current.sampler != next.sampler
        };
        self.health.send_replace(next.health.clone());
        self.lifecycle.send_replace(next.lifecycle.clone());
        self.config.send_replace(next);
        rebuild
    }
}

/// Load the configuration file, or defaults when none was given.
pub fn load(path: Option<&Path>) -> Result<HostConfig, ConfigError> {
    match path {
        Some(path) => HostConfig::from_file(path),
        None => Ok(HostConfig::default()),
    }
}

/// Re-read the configuration file and publish it. An invalid file leaves
/// the current configuration in place.
pub async fn reload(path: Option<&PathBuf>, channels: &ConfigChannels, controller: &LifecycleController) {
    let Some(path) = path else {
        info!("no configuration file given, reload ignored");
        return;
    };
    let next = match HostConfig::from_file(path) {
        Ok(next) => next,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "configuration reload rejected, keeping current configuration");
            return;
        }
    };

    let rebuild = channels.publish(next);
    info!(path = %path.display(), rebuild, "configuration reloaded");
    if rebuild {
        match controller.restart_host(RestartReason::ConfigChange).await {
            Ok(restarted) => info!(restarted, "runtime configuration changed"),
            Err(e) => warn!(error = %e, "restart after configuration change failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_defaults_without_file() {
        let config = load(None).unwrap();
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let file = write_config(
            r#"
[health]
health_check_threshold = 3

[[workers]]
id = "node"
command = "node"
args = ["worker.js"]
"#,
        );
        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.health.health_check_threshold, 3);
        assert_eq!(config.workers[0].args, vec!["worker.js"]);
    }

    #[test]
    fn health_only_change_does_not_rebuild() {
        let channels = ConfigChannels::new(HostConfig::default());
        let mut health = channels.health();
        health.borrow_and_update();

        let mut next = HostConfig::default();
        next.health.health_check_interval = Duration::from_secs(30);
        assert!(!channels.publish(next));

        assert!(health.has_changed().unwrap());
        assert_eq!(health.borrow().health_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn worker_change_requires_rebuild() {
        let channels = ConfigChannels::new(HostConfig::default());
        let next = HostConfig::from_toml(
            r#"
[[workers]]
id = "python"
command = "python3"
"#,
        )
        .unwrap();
        assert!(channels.publish(next));
        assert_eq!(channels.config().borrow().workers.len(), 1);
    }
}
