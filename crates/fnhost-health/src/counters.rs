//! Sandbox resource counters.
//!
//! The platform publishes current usage and limits for sandboxed resources
//! as a JSON object in an environment variable. The blob occasionally
//! carries trailing garbage after its closing brace, so everything past the
//! last `}` is discarded before parsing.

use serde::Deserialize;
use thiserror::Error;
use tracing::error;

use fnhost_core::{Environment, names};

/// Resource kinds enforced by the sandbox, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    ActiveConnections,
    Connections,
    Threads,
    Processes,
    NamedPipes,
    Sections,
    RemoteDirMonitors,
}

impl CounterKind {
    pub const ALL: [CounterKind; 7] = [
        CounterKind::ActiveConnections,
        CounterKind::Connections,
        CounterKind::Threads,
        CounterKind::Processes,
        CounterKind::NamedPipes,
        CounterKind::Sections,
        CounterKind::RemoteDirMonitors,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CounterKind::ActiveConnections => "ActiveConnections",
            CounterKind::Connections => "Connections",
            CounterKind::Threads => "Threads",
            CounterKind::Processes => "Processes",
            CounterKind::NamedPipes => "NamedPipes",
            CounterKind::Sections => "Sections",
            CounterKind::RemoteDirMonitors => "RemoteDirMonitors",
        }
    }
}

impl std::fmt::Display for CounterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Current value and limit for one counter. A limit ≤ 0 means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterReading {
    pub current: i64,
    pub limit: i64,
}

impl CounterReading {
    pub fn new(current: i64, limit: i64) -> Self {
        Self { current, limit }
    }

    /// Whether `current / limit` is strictly above `threshold`.
    pub fn exceeds(&self, threshold: f64) -> bool {
        if self.limit <= 0 {
            return false;
        }
        (self.current as f64 / self.limit as f64) > threshold
    }
}

/// Wire shape of the counter blob. Missing fields read as zero.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CounterBlob {
    active_connections: i64,
    active_connection_limit: i64,
    connections: i64,
    connection_limit: i64,
    threads: i64,
    thread_limit: i64,
    processes: i64,
    process_limit: i64,
    named_pipes: i64,
    named_pipe_limit: i64,
    sections: i64,
    section_limit: i64,
    remote_dir_monitors: i64,
    remote_dir_monitor_limit: i64,
}

/// Parsed sandbox counters. Built fresh on every check; limits can move.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    readings: [CounterReading; 7],
}

impl CounterSnapshot {
    pub fn from_readings(readings: impl IntoIterator<Item = (CounterKind, CounterReading)>) -> Self {
        let mut snapshot = Self::default();
        for (kind, reading) in readings {
            snapshot.readings[kind as usize] = reading;
        }
        snapshot
    }

    pub fn get(&self, kind: CounterKind) -> CounterReading {
        self.readings[kind as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (CounterKind, CounterReading)> + '_ {
        CounterKind::ALL.iter().map(|&k| (k, self.get(k)))
    }

    /// Parse a counter blob, discarding anything after the final `}`.
    pub fn parse(raw: &str) -> Result<Self, CounterParseError> {
        let end = raw.rfind('}').ok_or(CounterParseError::Unterminated)?;
        let blob: CounterBlob = serde_json::from_str(&raw[..=end])?;
        Ok(Self::from_readings([
            (CounterKind::ActiveConnections, CounterReading::new(blob.active_connections, blob.active_connection_limit)),
            (CounterKind::Connections, CounterReading::new(blob.connections, blob.connection_limit)),
            (CounterKind::Threads, CounterReading::new(blob.threads, blob.thread_limit)),
            (CounterKind::Processes, CounterReading::new(blob.processes, blob.process_limit)),
            (CounterKind::NamedPipes, CounterReading::new(blob.named_pipes, blob.named_pipe_limit)),
            (CounterKind::Sections, CounterReading::new(blob.sections, blob.section_limit)),
            (CounterKind::RemoteDirMonitors, CounterReading::new(blob.remote_dir_monitors, blob.remote_dir_monitor_limit)),
        ]))
    }

    /// Evaluate every counter against `threshold`, appending the names of
    /// exceeded counters to `exceeded`. Returns true if any was exceeded.
    pub fn thresholds_exceeded(&self, threshold: f64, mut exceeded: Option<&mut Vec<String>>) -> bool {
        let mut any = false;
        for (kind, reading) in self.iter() {
            if reading.exceeds(threshold) {
                any = true;
                if let Some(out) = exceeded.as_deref_mut() {
                    out.push(kind.name().to_string());
                }
            }
        }
        any
    }
}

#[derive(Debug, Error)]
pub enum CounterParseError {
    #[error("counter payload has no closing brace")]
    Unterminated,

    #[error("invalid counter json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read the current counters from the environment.
///
/// Returns `None` when the variable is absent, empty, or malformed; parse
/// failures are logged and never surface to the caller.
pub fn read_counters(env: &dyn Environment) -> Option<CounterSnapshot> {
    let raw = env.get(names::APP_COUNTERS)?;
    if raw.trim().is_empty() {
        return None;
    }
    match CounterSnapshot::parse(&raw) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            error!(error = %e, content = %raw, "failed to deserialize sandbox counters");
            None
        }
    }
}
