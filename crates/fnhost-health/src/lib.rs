//! fnhost-health — host overload detection.
//!
//! Produces a single "is the host overloaded" verdict from sandbox resource
//! counters and CPU load sampled across the host process and its language
//! workers.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── read_counters(env) → CounterSnapshot (fresh per check)
//!   ├── ProcessSampler (host) → ProcessStats { cpu_load_history }
//!   └── WorkerStatusSlot → WorkerStatusSource (only when Initialized)
//!       └── per-worker ProcessStats
//! ```
//!
//! Transient failures (missing counter blob, malformed JSON, a slow or
//! failed worker query, an exited process) are logged and read as "no
//! signal". The verdict methods never fail.

pub mod counters;
pub mod monitor;
pub mod sampler;
pub mod workers;

pub use counters::{CounterKind, CounterParseError, CounterReading, CounterSnapshot, read_counters};
pub use monitor::{CPU_COUNTER, HealthMonitor, HealthReport, MIN_SAMPLE_COUNT, ProcessStatsSource};
pub use sampler::{CpuTimeSource, ProcessSampler, ProcessStats, SysinfoCpuSource};
pub use workers::{
    BoxFuture, DispatcherState, WorkerStatus, WorkerStatusSlot, WorkerStatusSource, WorkerStatuses,
};
