//! Out-of-process worker status.
//!
//! When functions run in language workers, the dispatcher that owns those
//! workers can report each worker's CPU history. The health monitor only
//! asks once the dispatcher reports `Initialized`; in every other state
//! (or when functions run in-process) workers are treated as absent.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::sampler::ProcessStats;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Readiness of the worker dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Default,
    Initializing,
    Initialized,
    Disposing,
    Disposed,
}

/// Status of one worker process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStatus {
    pub process_stats: ProcessStats,
}

/// Worker statuses keyed by worker id.
pub type WorkerStatuses = HashMap<String, WorkerStatus>;

/// Narrow view of a worker dispatcher.
pub trait WorkerStatusSource: Send + Sync {
    fn state(&self) -> DispatcherState;

    /// Snapshot of every active worker. Implementations may round-trip to
    /// the worker processes; callers bound the wait.
    fn worker_statuses(&self) -> BoxFuture<'_, anyhow::Result<WorkerStatuses>>;
}

/// Shared, swappable handle to the current worker source.
///
/// The lifecycle controller publishes the running runtime's source here
/// and clears it when the runtime goes away.
#[derive(Clone, Default)]
pub struct WorkerStatusSlot {
    inner: Arc<RwLock<Option<Arc<dyn WorkerStatusSource>>>>,
}

impl WorkerStatusSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, source: Option<Arc<dyn WorkerStatusSource>>) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = source;
        }
    }

    pub fn clear(&self) {
        self.set(None);
    }

    pub fn get(&self) -> Option<Arc<dyn WorkerStatusSource>> {
        self.inner.read().ok()?.clone()
    }

    /// The current source, only if its dispatcher is ready.
    pub fn ready(&self) -> Option<Arc<dyn WorkerStatusSource>> {
        self.get()
            .filter(|source| source.state() == DispatcherState::Initialized)
    }
}

impl std::fmt::Debug for WorkerStatusSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerStatusSlot")
            .field("attached", &self.get().is_some())
            .finish()
    }
}
