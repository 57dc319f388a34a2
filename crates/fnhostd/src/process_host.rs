//! Process-backed host runtime.
//!
//! Each `[[workers]]` entry is launched as a child process when the runtime
//! starts. Every child gets its own `ProcessSampler`, and the runtime
//! exposes their CPU histories as worker statuses once all of them are up.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fnhost_core::{HostConfig, SamplerOptions, WorkerConfig};
use fnhost_health::{
    BoxFuture, DispatcherState, ProcessSampler, SysinfoCpuSource, WorkerStatus, WorkerStatusSource,
    WorkerStatuses,
};
use fnhost_lifecycle::{BuildContext, HostBuilder, HostRuntime};

/// Builds a `ProcessRuntime` from the configuration current at build time,
/// so worker changes apply on the next restart.
pub struct ProcessHostBuilder {
    config: watch::Receiver<HostConfig>,
}

impl ProcessHostBuilder {
    pub fn new(config: watch::Receiver<HostConfig>) -> Self {
        Self { config }
    }
}

impl HostBuilder for ProcessHostBuilder {
    fn build(
        &self,
        ctx: BuildContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, anyhow::Result<Arc<dyn HostRuntime>>> {
        let config = self.config.borrow().clone();
        Box::pin(async move {
            for worker in &config.workers {
                check_command(worker)?;
            }
            if cancel.is_cancelled() {
                anyhow::bail!("build canceled");
            }
            debug!(
                workers = config.workers.len(),
                startup_count = ctx.startup_count,
                "process runtime built"
            );
            Ok(Arc::new(ProcessRuntime::new(config.workers, config.sampler)) as Arc<dyn HostRuntime>)
        })
    }
}

/// Commands given as paths must exist; bare names are resolved by `PATH`
/// at spawn time.
fn check_command(worker: &WorkerConfig) -> anyhow::Result<()> {
    let path = Path::new(&worker.command);
    if path.components().count() > 1 && !path.exists() {
        anyhow::bail!("worker '{}': command not found: {}", worker.id, worker.command);
    }
    Ok(())
}

struct WorkerProcess {
    id: String,
    child: Child,
}

/// Worker dispatcher view over the spawned children.
pub struct ProcessWorkers {
    state: Mutex<DispatcherState>,
    samplers: Mutex<HashMap<String, Arc<ProcessSampler>>>,
}

impl ProcessWorkers {
    fn new() -> Self {
        Self {
            state: Mutex::new(DispatcherState::Default),
            samplers: Mutex::new(HashMap::new()),
        }
    }

    fn set_state(&self, state: DispatcherState) {
        *lock(&self.state) = state;
    }
}

impl WorkerStatusSource for ProcessWorkers {
    fn state(&self) -> DispatcherState {
        *lock(&self.state)
    }

    fn worker_statuses(&self) -> BoxFuture<'_, anyhow::Result<WorkerStatuses>> {
        let statuses: WorkerStatuses = lock(&self.samplers)
            .iter()
            .map(|(id, sampler)| {
                (
                    id.clone(),
                    WorkerStatus {
                        process_stats: sampler.stats(),
                    },
                )
            })
            .collect();
        Box::pin(async move { Ok(statuses) })
    }
}

pub struct ProcessRuntime {
    specs: Vec<WorkerConfig>,
    sampler: SamplerOptions,
    workers: Arc<ProcessWorkers>,
    children: tokio::sync::Mutex<Vec<WorkerProcess>>,
}

impl ProcessRuntime {
    pub fn new(specs: Vec<WorkerConfig>, sampler: SamplerOptions) -> Self {
        Self {
            specs,
            sampler,
            workers: Arc::new(ProcessWorkers::new()),
            children: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    async fn spawn_all(&self) -> anyhow::Result<()> {
        self.workers.set_state(DispatcherState::Initializing);
        let mut children = self.children.lock().await;

        for spec in &self.specs {
            let child = Command::new(&spec.command)
                .args(&spec.args)
                .envs(&spec.env)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("failed to spawn worker '{}'", spec.id))?;
            let pid = child
                .id()
                .with_context(|| format!("worker '{}' exited before it could be sampled", spec.id))?;

            let sampler = Arc::new(ProcessSampler::new(
                spec.id.clone(),
                Box::new(SysinfoCpuSource::for_pid(pid)),
                &self.sampler,
            ));
            sampler.start();
            lock(&self.workers.samplers).insert(spec.id.clone(), sampler);
            children.push(WorkerProcess {
                id: spec.id.clone(),
                child,
            });
            info!(worker = %spec.id, pid, "worker started");
        }

        self.workers.set_state(DispatcherState::Initialized);
        Ok(())
    }

    async fn kill_all(&self) {
        self.workers.set_state(DispatcherState::Disposing);
        let mut children = self.children.lock().await;
        for mut worker in children.drain(..) {
            match worker.child.kill().await {
                Ok(()) => debug!(worker = %worker.id, "worker stopped"),
                Err(e) => warn!(worker = %worker.id, error = %e, "failed to stop worker"),
            }
        }
        for (_, sampler) in lock(&self.workers.samplers).drain() {
            sampler.stop();
        }
        self.workers.set_state(DispatcherState::Disposed);
    }
}

impl HostRuntime for ProcessRuntime {
    fn start(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(self.spawn_all())
    }

    fn stop(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.kill_all().await;
            Ok(())
        })
    }

    fn workers(&self) -> Option<Arc<dyn WorkerStatusSource>> {
        if self.specs.is_empty() {
            return None;
        }
        Some(self.workers.clone())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fnhost_lifecycle::BuildReason;

    use super::*;

    fn worker(id: &str, command: &str, args: &[&str]) -> WorkerConfig {
        WorkerConfig {
            id: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    fn ctx() -> BuildContext {
        BuildContext {
            reason: BuildReason::Startup,
            consecutive_errors: 0,
            startup_count: 0,
            in_standby: false,
        }
    }

    fn sampler_options() -> SamplerOptions {
        SamplerOptions {
            interval: Duration::from_millis(50),
            history_size: 10,
        }
    }

    #[tokio::test]
    async fn build_rejects_missing_command_path() {
        let config = HostConfig {
            workers: vec![worker("node", "/nonexistent/bin/node-worker", &[])],
            ..HostConfig::default()
        };
        let (_tx, rx) = watch::channel(config);
        let builder = ProcessHostBuilder::new(rx);

        let err = builder
            .build(ctx(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("command not found"));
    }

    #[tokio::test]
    async fn runtime_without_workers_runs_in_process() {
        let (_tx, rx) = watch::channel(HostConfig::default());
        let runtime = ProcessHostBuilder::new(rx)
            .build(ctx(), CancellationToken::new())
            .await
            .unwrap();
        runtime.start().await.unwrap();
        assert!(runtime.workers().is_none());
        runtime.stop().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let runtime = ProcessRuntime::new(
            vec![worker("ghost", "fnhostd-test-no-such-binary", &[])],
            sampler_options(),
        );
        let err = runtime.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to spawn worker 'ghost'"));
        assert_eq!(runtime.workers.state(), DispatcherState::Initializing);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn workers_report_status_until_stopped() {
        let runtime = ProcessRuntime::new(
            vec![
                worker("node-1", "sleep", &["30"]),
                worker("node-2", "sleep", &["30"]),
            ],
            sampler_options(),
        );
        runtime.start().await.unwrap();

        let source = runtime.workers().unwrap();
        assert_eq!(source.state(), DispatcherState::Initialized);
        let statuses = source.worker_statuses().await.unwrap();
        let mut ids: Vec<_> = statuses.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["node-1", "node-2"]);

        runtime.stop().await.unwrap();
        assert_eq!(source.state(), DispatcherState::Disposed);
        assert!(source.worker_statuses().await.unwrap().is_empty());
        assert!(runtime.children.lock().await.is_empty());
    }
}
