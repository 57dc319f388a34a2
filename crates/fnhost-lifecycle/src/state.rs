//! Host state machine.
//!
//! ```text
//! Offline ──► Initializing ──► Initialized ──► Running ──► Stopping ──► Stopped
//!    ▲             │                │             │
//!    └─────────────┴────────────────┘             │ (restart pending)
//!                  ▲                              │
//!                  └──────────────────────────────┘
//! ```
//!
//! Any state may move to `Stopped` on host-wide cancellation. A restart is
//! a `Running` host with `restart_pending` set; only then is the edge
//! `Running → Initializing` legal.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostState {
    Offline,
    Initializing,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

impl HostState {
    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: HostState, restart_pending: bool) -> bool {
        use HostState::*;
        match (self, next) {
            (from, Stopped) => from != Stopped,
            (Offline | Stopped, Initializing) => true,
            (Initializing, Initialized | Offline) => true,
            (Initialized, Running | Offline | Stopping) => true,
            (Running, Stopping) => true,
            (Running, Initializing) => restart_pending,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HostState::Offline => "Offline",
            HostState::Initializing => "Initializing",
            HostState::Initialized => "Initialized",
            HostState::Running => "Running",
            HostState::Stopping => "Stopping",
            HostState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consistent snapshot of everything the controller tracks about the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostStatus {
    pub state: HostState,
    pub restart_pending: bool,
    /// Build failures since the last successful start.
    pub consecutive_errors: u32,
    /// Successful starts since the controller was created.
    pub startup_count: u32,
    pub last_error: Option<String>,
    /// Set when the most recent stop exceeded its grace period.
    pub did_not_shut_down: bool,
    pub in_standby: bool,
    pub last_build_duration: Option<Duration>,
}

impl HostStatus {
    pub fn new(in_standby: bool) -> Self {
        Self {
            state: HostState::Offline,
            restart_pending: false,
            consecutive_errors: 0,
            startup_count: 0,
            last_error: None,
            did_not_shut_down: false,
            in_standby,
            last_build_duration: None,
        }
    }

    /// Validate and apply a transition. The caller holds the status lock.
    pub fn transition(&mut self, next: HostState) -> LifecycleResult<HostState> {
        let from = self.state;
        if !from.can_transition_to(next, self.restart_pending) {
            return Err(LifecycleError::InvalidTransition { from, to: next });
        }
        self.state = next;
        if next != HostState::Running {
            self.restart_pending = false;
        }
        Ok(from)
    }
}
