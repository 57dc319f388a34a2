//! Lifecycle controller — owns the host state machine.
//!
//! The controller builds, starts, restarts, and stops the execution
//! runtime. Health checks run sequentially; a restart requested while a
//! check is in flight waits for it. At most one build is in flight at a
//! time, and cancelling it returns the host to `Offline` without counting
//! as a failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fnhost_core::{HealthMonitorOptions, LifecycleOptions, UnhealthyAction};
use fnhost_health::WorkerStatusSlot;

use crate::error::{LifecycleError, LifecycleResult};
use crate::ledger::UnhealthyLedger;
use crate::runtime::{BuildContext, BuildReason, HealthProbe, HostBuilder, HostRuntime, RestartReason};
use crate::standby::StandbyState;
use crate::state::{HostState, HostStatus};

/// Collaborators the controller is assembled from.
pub struct LifecycleDeps {
    pub builder: Arc<dyn HostBuilder>,
    /// `None` disables health checks entirely.
    pub probe: Option<Arc<dyn HealthProbe>>,
    /// Slot the running runtime's worker source is published to.
    pub workers: WorkerStatusSlot,
    pub standby: StandbyState,
    pub health_options: watch::Receiver<HealthMonitorOptions>,
    pub lifecycle_options: watch::Receiver<LifecycleOptions>,
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    /// Monitoring disabled, no probe, or the host was not running.
    Skipped,
    Healthy,
    /// Overloaded, but the ledger is still below the threshold.
    Unhealthy { count: usize },
    RestartInitiated,
    ShutdownInitiated,
}

/// How an in-flight build ended, as seen by callers that joined it.
#[derive(Debug, Clone)]
enum BuildOutcome {
    Started,
    Failed(String),
    Canceled,
}

struct InFlightBuild {
    id: u64,
    cancel: CancellationToken,
    done: watch::Sender<Option<BuildOutcome>>,
}

enum StartPlan {
    Join(Option<watch::Receiver<Option<BuildOutcome>>>),
    Build(u64, CancellationToken),
}

struct Inner {
    builder: Arc<dyn HostBuilder>,
    probe: Option<Arc<dyn HealthProbe>>,
    workers: WorkerStatusSlot,
    standby: StandbyState,
    health_options: watch::Receiver<HealthMonitorOptions>,
    lifecycle_options: watch::Receiver<LifecycleOptions>,

    // Lock order: status, then runtime or build.
    status: Mutex<HostStatus>,
    runtime: Mutex<Option<Arc<dyn HostRuntime>>>,
    state_tx: watch::Sender<HostState>,
    ledger: Mutex<UnhealthyLedger>,
    build: Mutex<Option<InFlightBuild>>,
    next_build_id: AtomicU64,
    shutdown: CancellationToken,
    check_gate: tokio::sync::Mutex<()>,
}

/// Cheaply cloneable handle to the host lifecycle.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(deps: LifecycleDeps) -> Self {
        let in_standby = deps.standby.in_standby();
        let (state_tx, _) = watch::channel(HostState::Offline);
        Self {
            inner: Arc::new(Inner {
                builder: deps.builder,
                probe: deps.probe,
                workers: deps.workers,
                standby: deps.standby,
                health_options: deps.health_options,
                lifecycle_options: deps.lifecycle_options,
                status: Mutex::new(HostStatus::new(in_standby)),
                runtime: Mutex::new(None),
                state_tx,
                ledger: Mutex::new(UnhealthyLedger::new()),
                build: Mutex::new(None),
                next_build_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                check_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> HostState {
        self.lock_status().state
    }

    /// Consistent snapshot of the host status.
    pub fn status(&self) -> HostStatus {
        self.lock_status().clone()
    }

    /// State-change notifications.
    pub fn subscribe_state(&self) -> watch::Receiver<HostState> {
        self.inner.state_tx.subscribe()
    }

    /// Standby notifications; the value is `true` while in standby.
    pub fn subscribe_specialization(&self) -> watch::Receiver<bool> {
        self.inner.standby.subscribe()
    }

    pub fn in_standby(&self) -> bool {
        self.inner.standby.in_standby()
    }

    /// Unhealthy verdicts currently retained in the ledger.
    pub fn unhealthy_count(&self) -> usize {
        lock(&self.inner.ledger).len()
    }

    /// Token cancelled once host-wide shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Build and start a host. A request while a build is already in
    /// flight joins it: it waits for that build and returns its outcome.
    pub async fn start_host(&self) -> LifecycleResult<()> {
        self.start_with(BuildReason::Startup).await
    }

    /// Stop the running host and build a new one.
    ///
    /// Only a `Running` host is restarted; in any other state the request
    /// is dropped and `Ok(false)` returned. Waits for an in-flight health
    /// check to finish first.
    pub async fn restart_host(&self, reason: RestartReason) -> LifecycleResult<bool> {
        let _gate = self.inner.check_gate.lock().await;
        self.restart_locked(reason).await
    }

    /// Stop the host, bounded by `stop_grace_period`. The host always ends
    /// in `Stopped`; a stop that overruns its grace period is recorded in
    /// `did_not_shut_down`.
    pub async fn stop_host(&self) -> LifecycleResult<()> {
        let runtime = {
            let mut status = self.lock_status();
            let state = status.state;
            match state {
                HostState::Stopping | HostState::Stopped => {
                    debug!(%state, "host is already stopping");
                    return Ok(());
                }
                HostState::Offline => {
                    self.transition(&mut status, HostState::Stopped)?;
                    return Ok(());
                }
                HostState::Initializing | HostState::Initialized => {
                    self.cancel_build();
                    self.transition(&mut status, HostState::Stopped)?;
                    info!("host stopped during initialization");
                    return Ok(());
                }
                HostState::Running => {
                    self.transition(&mut status, HostState::Stopping)?;
                    lock(&self.inner.runtime).take()
                }
            }
        };

        info!("stopping host");
        self.inner.workers.clear();
        let did_not_shut_down = match runtime {
            Some(runtime) => self.stop_runtime(runtime).await,
            None => false,
        };

        let mut status = self.lock_status();
        status.did_not_shut_down = did_not_shut_down;
        self.transition(&mut status, HostState::Stopped)?;
        info!(did_not_shut_down, "host stopped");
        Ok(())
    }

    /// Cancel the in-flight build, if any. The build returns the host to
    /// `Offline` and is not counted as a failure.
    pub fn cancel_initialization(&self) -> bool {
        match lock(&self.inner.build).as_ref() {
            Some(build) => {
                debug!(build = build.id, "host initialization cancellation requested");
                build.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Begin host-wide shutdown. No new host is built afterwards.
    pub async fn shutdown(&self) -> LifecycleResult<()> {
        if !self.inner.shutdown.is_cancelled() {
            info!("host shutdown requested");
            self.inner.shutdown.cancel();
        }
        self.stop_host().await
    }

    /// Leave standby mode. An offline host is built; a running placeholder
    /// host is restarted; a placeholder build still in flight is canceled
    /// and replaced. Returns false if already specialized.
    pub async fn specialize(&self) -> LifecycleResult<bool> {
        if !self.inner.standby.specialize() {
            debug!("host is already specialized");
            return Ok(false);
        }
        let (state, standby_build) = {
            let mut status = self.lock_status();
            status.in_standby = false;
            let standby_build = match status.state {
                HostState::Initializing | HostState::Initialized => self.subscribe_build(true),
                _ => None,
            };
            (status.state, standby_build)
        };
        info!(%state, "host specialized, leaving standby mode");

        // A build started under the placeholder configuration is discarded.
        let state = match standby_build {
            Some(done) => {
                if let Err(err) = Self::await_build(done).await {
                    debug!(error = %err, "standby build ended");
                }
                self.state()
            }
            None => state,
        };

        match state {
            // A build begun after the standby one was dropped is joined.
            HostState::Offline | HostState::Initializing | HostState::Initialized => {
                self.start_with(BuildReason::Specialization).await?
            }
            HostState::Running => {
                self.restart_host(RestartReason::Specialization).await?;
            }
            _ => {}
        }
        Ok(true)
    }

    /// Record an error raised by the runtime. Errors from a host that is
    /// no longer the active one are only logged at debug.
    pub fn report_error(&self, err: &anyhow::Error, is_active_host: bool) {
        if is_active_host {
            self.lock_status().last_error = Some(format!("{err:#}"));
            error!(error = %format!("{err:#}"), "a host error has occurred");
        } else {
            debug!(error = %format!("{err:#}"), "a host error has occurred on an inactive host instance");
        }
    }

    /// Run one health check now.
    pub async fn check_health(&self) -> HealthCheckOutcome {
        self.check_health_at(Instant::now()).await
    }

    /// Run one health check, recording any unhealthy verdict at `now`.
    pub async fn check_health_at(&self, now: Instant) -> HealthCheckOutcome {
        let _gate = self.inner.check_gate.lock().await;

        let Some(probe) = self.inner.probe.clone() else {
            return HealthCheckOutcome::Skipped;
        };
        let options = self.inner.health_options.borrow().clone();
        if !options.enabled {
            return HealthCheckOutcome::Skipped;
        }
        lock(&self.inner.ledger).prune(now, options.health_check_window);
        let state = self.state();
        if state != HostState::Running {
            debug!(%state, "host is not running, health check skipped");
            return HealthCheckOutcome::Skipped;
        }

        let report = probe.evaluate().await;
        if !report.overloaded {
            debug!(aggregate_cpu = ?report.aggregate_cpu, "host is healthy");
            return HealthCheckOutcome::Healthy;
        }

        let count = lock(&self.inner.ledger).record(now, options.health_check_window);
        warn!(
            exceeded = ?report.exceeded,
            aggregate_cpu = ?report.aggregate_cpu,
            unhealthy_count = count,
            threshold = options.health_check_threshold,
            "host is overloaded"
        );
        if count < options.health_check_threshold as usize {
            return HealthCheckOutcome::Unhealthy { count };
        }

        let action = self.inner.lifecycle_options.borrow().unhealthy_action;
        error!(
            unhealthy_count = count,
            threshold = options.health_check_threshold,
            window_secs = options.health_check_window.as_secs(),
            exceeded = ?report.exceeded,
            ?action,
            "host unhealthy count exceeds the threshold for the time window"
        );

        match action {
            UnhealthyAction::Restart => {
                match self.restart_locked(RestartReason::Unhealthy).await {
                    Ok(true) => {}
                    Ok(false) => debug!("unhealthy restart was not performed"),
                    Err(err) => error!(error = %err, "unhealthy restart failed"),
                }
                lock(&self.inner.ledger).clear();
                HealthCheckOutcome::RestartInitiated
            }
            UnhealthyAction::Shutdown => {
                error!("initiating shutdown of unhealthy host");
                if let Err(err) = self.shutdown().await {
                    error!(error = %err, "unhealthy shutdown failed");
                }
                HealthCheckOutcome::ShutdownInitiated
            }
        }
    }

    /// Periodic health checks until shutdown. The interval and the enabled
    /// toggle are re-read each round.
    pub async fn run_health_checks(&self) {
        let mut options = self.inner.health_options.clone();
        let shutdown = self.inner.shutdown.clone();
        info!("health check loop started");

        loop {
            let current = options.borrow_and_update().clone();
            if !current.enabled {
                debug!("health monitoring disabled, waiting for configuration change");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = options.changed() => {
                        if changed.is_err() {
                            shutdown.cancelled().await;
                            break;
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(current.health_check_interval) => {
                    self.check_health().await;
                }
            }
        }
        info!("health check loop stopped");
    }

    async fn start_with(&self, reason: BuildReason) -> LifecycleResult<()> {
        if self.inner.shutdown.is_cancelled() {
            debug!("cancellation requested, a new host will not be started");
            return Err(LifecycleError::ShuttingDown);
        }
        let plan = {
            let mut status = self.lock_status();
            let state = status.state;
            match state {
                HostState::Initializing | HostState::Initialized => {
                    debug!(%state, "host initialization already in progress, joining it");
                    StartPlan::Join(self.subscribe_build(false))
                }
                HostState::Running => {
                    debug!(%state, "host is already started");
                    return Ok(());
                }
                _ => {
                    self.transition(&mut status, HostState::Initializing)?;
                    let (build_id, cancel) = self.register_build();
                    StartPlan::Build(build_id, cancel)
                }
            }
        };
        match plan {
            StartPlan::Join(Some(done)) => Self::await_build(done).await,
            StartPlan::Join(None) => Ok(()),
            StartPlan::Build(build_id, cancel) => self.build_and_start(reason, build_id, cancel).await,
        }
    }

    /// Wait for a joined build to finish and report its outcome.
    async fn await_build(mut done: watch::Receiver<Option<BuildOutcome>>) -> LifecycleResult<()> {
        let outcome = done
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|outcome| (*outcome).clone());
        match outcome {
            Some(BuildOutcome::Started) => Ok(()),
            Some(BuildOutcome::Failed(reason)) => Err(LifecycleError::JoinedBuildFailed(reason)),
            Some(BuildOutcome::Canceled) | None => Err(LifecycleError::Canceled),
        }
    }

    async fn restart_locked(&self, reason: RestartReason) -> LifecycleResult<bool> {
        if self.inner.shutdown.is_cancelled() {
            debug!(%reason, "cancellation requested, host restart skipped");
            return Ok(false);
        }

        let runtime = {
            let mut status = self.lock_status();
            if status.state != HostState::Running || status.restart_pending {
                debug!(
                    %reason,
                    state = %status.state,
                    restart_pending = status.restart_pending,
                    "host restart was requested, but the current state does not allow it, skipping restart"
                );
                return Ok(false);
            }
            status.restart_pending = true;
            lock(&self.inner.runtime).take()
        };

        info!(%reason, "restarting host");
        self.inner.workers.clear();
        let did_not_shut_down = match runtime {
            Some(runtime) => self.stop_runtime(runtime).await,
            None => false,
        };

        let (build_id, cancel) = {
            let mut status = self.lock_status();
            status.did_not_shut_down = did_not_shut_down;
            // A stop or shutdown that raced the teardown wins.
            if status.state != HostState::Running || !status.restart_pending {
                debug!(state = %status.state, "host restart abandoned");
                return Ok(false);
            }
            self.transition(&mut status, HostState::Initializing)?;
            self.register_build()
        };

        self.build_and_start(BuildReason::Restart(reason), build_id, cancel)
            .await?;
        lock(&self.inner.ledger).clear();
        info!(%reason, "host restarted");
        Ok(true)
    }

    /// Drive a registered build from `Initializing` through to `Running`.
    async fn build_and_start(
        &self,
        reason: BuildReason,
        build_id: u64,
        cancel: CancellationToken,
    ) -> LifecycleResult<()> {
        let ctx = {
            let status = self.lock_status();
            BuildContext {
                reason,
                consecutive_errors: status.consecutive_errors,
                startup_count: status.startup_count,
                in_standby: status.in_standby,
            }
        };
        info!(
            build = build_id,
            ?reason,
            consecutive_errors = ctx.consecutive_errors,
            startup_count = ctx.startup_count,
            in_standby = ctx.in_standby,
            "initializing host"
        );

        let began = Instant::now();
        let built = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.inner.builder.build(ctx, cancel.clone()) => Some(result),
        };
        let runtime = match built {
            None => return Err(self.abandon_build(build_id, None).await),
            Some(Err(err)) => return Err(self.fail_build(build_id, LifecycleError::Build(err))),
            Some(Ok(runtime)) => runtime,
        };

        let build_duration = began.elapsed();
        let committed = {
            let mut status = self.lock_status();
            let ok = !cancel.is_cancelled()
                && self.transition(&mut status, HostState::Initialized).is_ok();
            if ok {
                status.last_build_duration = Some(build_duration);
            }
            ok
        };
        if !committed {
            return Err(self.abandon_build(build_id, Some(runtime)).await);
        }
        info!(build = build_id, elapsed_ms = build_duration.as_millis() as u64, "host initialized");

        let began = Instant::now();
        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = runtime.start() => Some(result),
        };
        match started {
            None => return Err(self.abandon_build(build_id, Some(runtime)).await),
            Some(Err(err)) => {
                self.stop_runtime(runtime).await;
                return Err(self.fail_build(build_id, LifecycleError::Start(err)));
            }
            Some(Ok(())) => {}
        }

        let startup_count = {
            let mut status = self.lock_status();
            if cancel.is_cancelled() || self.transition(&mut status, HostState::Running).is_err() {
                None
            } else {
                status.startup_count += 1;
                status.consecutive_errors = 0;
                status.last_error = None;
                *lock(&self.inner.runtime) = Some(runtime.clone());
                Some(status.startup_count)
            }
        };
        let Some(startup_count) = startup_count else {
            return Err(self.abandon_build(build_id, Some(runtime)).await);
        };

        self.inner.workers.set(runtime.workers());
        self.finish_build(build_id, BuildOutcome::Started);
        info!(
            build = build_id,
            elapsed_ms = began.elapsed().as_millis() as u64,
            startup_count,
            "host started"
        );
        Ok(())
    }

    /// Count a failed build and return the host to `Offline`.
    fn fail_build(&self, build_id: u64, err: LifecycleError) -> LifecycleError {
        {
            let mut status = self.lock_status();
            status.consecutive_errors += 1;
            status.last_error = Some(err.to_string());
            self.settle_build(&mut status, HostState::Offline);
            error!(
                build = build_id,
                error = %err,
                consecutive_errors = status.consecutive_errors,
                "host initialization failed"
            );
        }
        self.finish_build(build_id, BuildOutcome::Failed(err.to_string()));
        err
    }

    /// Discard a canceled build. Not counted as a failure.
    async fn abandon_build(&self, build_id: u64, runtime: Option<Arc<dyn HostRuntime>>) -> LifecycleError {
        if let Some(runtime) = runtime {
            self.stop_runtime(runtime).await;
        }
        let target = if self.inner.shutdown.is_cancelled() {
            HostState::Stopped
        } else {
            HostState::Offline
        };
        {
            let mut status = self.lock_status();
            self.settle_build(&mut status, target);
        }
        self.finish_build(build_id, BuildOutcome::Canceled);
        debug!(build = build_id, "host startup was canceled");
        LifecycleError::Canceled
    }

    /// Move a build that is still in flight to `target`. A concurrent stop
    /// may already have moved the host on, in which case nothing changes.
    fn settle_build(&self, status: &mut HostStatus, target: HostState) {
        if matches!(status.state, HostState::Initializing | HostState::Initialized)
            && let Err(err) = self.transition(status, target)
        {
            warn!(error = %err, "could not settle abandoned build");
        }
    }

    /// Stop a runtime within the grace period. Returns true on timeout.
    async fn stop_runtime(&self, runtime: Arc<dyn HostRuntime>) -> bool {
        let grace = self.inner.lifecycle_options.borrow().stop_grace_period;
        match tokio::time::timeout(grace, runtime.stop()).await {
            Ok(Ok(())) => false,
            Ok(Err(err)) => {
                warn!(error = %format!("{err:#}"), "host stop reported an error");
                false
            }
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "host did not shut down within its allotted time"
                );
                true
            }
        }
    }

    /// Record a new in-flight build. Called under the status lock, in the
    /// same critical section that enters `Initializing`, so joiners always
    /// find it.
    fn register_build(&self) -> (u64, CancellationToken) {
        let id = self.inner.next_build_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        let (done, _) = watch::channel(None);
        *lock(&self.inner.build) = Some(InFlightBuild {
            id,
            cancel: cancel.clone(),
            done,
        });
        (id, cancel)
    }

    /// Publish the outcome of build `id` to joined callers and forget it.
    fn finish_build(&self, id: u64, outcome: BuildOutcome) {
        let mut build = lock(&self.inner.build);
        if build.as_ref().is_some_and(|b| b.id == id)
            && let Some(finished) = build.take()
        {
            finished.done.send_replace(Some(outcome));
        }
    }

    /// Completion signal of the in-flight build, optionally cancelling it.
    fn subscribe_build(&self, cancel: bool) -> Option<watch::Receiver<Option<BuildOutcome>>> {
        lock(&self.inner.build).as_ref().map(|build| {
            if cancel {
                debug!(build = build.id, "canceling in-flight build");
                build.cancel.cancel();
            }
            build.done.subscribe()
        })
    }

    fn cancel_build(&self) {
        if let Some(build) = lock(&self.inner.build).as_ref() {
            build.cancel.cancel();
        }
    }

    fn transition(&self, status: &mut HostStatus, next: HostState) -> LifecycleResult<()> {
        let from = status.transition(next)?;
        debug!(%from, to = %next, "host state changed");
        self.inner.state_tx.send_replace(next);
        Ok(())
    }

    fn lock_status(&self) -> MutexGuard<'_, HostStatus> {
        lock(&self.inner.status)
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("status", &*self.lock_status())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
