//! fnhost-lifecycle — host state machine and recovery policy.
//!
//! The `LifecycleController` builds the execution runtime through a
//! `HostBuilder`, tracks it through the `HostState` machine, and acts on
//! sustained overload reported by a `HealthProbe`.
//!
//! # Recovery
//!
//! Each health check that finds the host overloaded is recorded in an
//! `UnhealthyLedger`. When the ledger holds `health_check_threshold`
//! verdicts within `health_check_window`, the controller restarts the host
//! (or shuts it down, per `unhealthy_action`). A healthy verdict does not
//! reset the ledger; a successful restart does.

pub mod controller;
pub mod error;
pub mod ledger;
pub mod runtime;
pub mod standby;
pub mod state;

pub use controller::{HealthCheckOutcome, LifecycleController, LifecycleDeps};
pub use error::{LifecycleError, LifecycleResult};
pub use ledger::UnhealthyLedger;
pub use runtime::{BuildContext, BuildReason, HealthProbe, HostBuilder, HostRuntime, RestartReason};
pub use standby::{AppIdentity, AppIdentityCache, StandbyState};
pub use state::{HostState, HostStatus};
