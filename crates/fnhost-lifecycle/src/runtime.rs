//! Seams between the controller and the things it drives.
//!
//! The controller never knows what a "runtime" is. It asks a `HostBuilder`
//! for one, starts it, stops it, and asks a `HealthProbe` for verdicts.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use fnhost_health::{BoxFuture, HealthMonitor, HealthReport, WorkerStatusSource};

/// A built execution runtime (triggers, listeners, workers).
pub trait HostRuntime: Send + Sync {
    /// Arm the runtime's execution surface.
    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Tear the runtime down. The controller bounds how long it waits.
    fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Worker dispatcher, when functions run out of process.
    fn workers(&self) -> Option<Arc<dyn WorkerStatusSource>> {
        None
    }
}

/// Why a build was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildReason {
    Startup,
    Restart(RestartReason),
    Specialization,
}

/// Why a restart was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    ConfigChange,
    Unhealthy,
    Operator,
    Specialization,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestartReason::ConfigChange => "config-change",
            RestartReason::Unhealthy => "unhealthy",
            RestartReason::Operator => "operator",
            RestartReason::Specialization => "specialization",
        })
    }
}

/// Context handed to the builder for each attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub reason: BuildReason,
    /// Build failures since the last successful start.
    pub consecutive_errors: u32,
    /// Successful starts so far.
    pub startup_count: u32,
    pub in_standby: bool,
}

/// Constructs runtimes. `cancel` fires when the build is abandoned;
/// builders should check it at their own checkpoints.
pub trait HostBuilder: Send + Sync {
    fn build(
        &self,
        ctx: BuildContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, anyhow::Result<Arc<dyn HostRuntime>>>;
}

/// Source of overload verdicts.
pub trait HealthProbe: Send + Sync {
    fn evaluate(&self) -> BoxFuture<'_, HealthReport>;
}

impl HealthProbe for HealthMonitor {
    fn evaluate(&self) -> BoxFuture<'_, HealthReport> {
        Box::pin(HealthMonitor::evaluate(self))
    }
}
