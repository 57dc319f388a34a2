//! fnhost-core — configuration and environment plumbing shared by the
//! fnhost crates.
//!
//! Nothing in here knows about health checks or host lifecycle; it only
//! supplies typed options (with hot-reload friendly defaults) and a
//! key/value view of the process environment.

pub mod config;
pub mod environment;

pub use config::{
    ConfigError, HealthMonitorOptions, HostConfig, LifecycleOptions, SamplerOptions,
    UnhealthyAction, WorkerConfig, parse_duration,
};
pub use environment::{Environment, StaticEnvironment, SystemEnvironment, names};
