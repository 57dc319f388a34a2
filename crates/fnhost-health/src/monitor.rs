//! Health monitor — overload verdicts from sandbox counters and CPU load.
//!
//! Two independent signals feed the verdict:
//!
//! 1. Sandbox counters: each bounded counter is exceeded when
//!    `current / limit > counter_threshold`.
//! 2. CPU: the host's trailing average over the last `MIN_SAMPLE_COUNT`
//!    samples plus the average of each qualifying worker's trailing
//!    average, compared against `counter_threshold * 100`.
//!
//! Counters are checked first; they are cheap and need no worker round trip.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use fnhost_core::{Environment, HealthMonitorOptions};

use crate::counters::read_counters;
use crate::sampler::{ProcessSampler, ProcessStats};
use crate::workers::WorkerStatusSlot;

/// Samples averaged per process. A host needs strictly more than this many
/// samples before its CPU history is considered meaningful.
pub const MIN_SAMPLE_COUNT: usize = 5;

/// Name recorded in the exceeded list when CPU load is over threshold.
pub const CPU_COUNTER: &str = "CPU";

/// Anything that can hand out a `ProcessStats` snapshot.
pub trait ProcessStatsSource: Send + Sync {
    fn stats(&self) -> ProcessStats;
}

impl ProcessStatsSource for ProcessSampler {
    fn stats(&self) -> ProcessStats {
        ProcessSampler::stats(self)
    }
}

impl ProcessStatsSource for ProcessStats {
    fn stats(&self) -> ProcessStats {
        self.clone()
    }
}

/// Outcome of a full health evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub overloaded: bool,
    /// Names of exceeded counters, plus `CPU` when CPU load was over.
    pub exceeded: Vec<String>,
    /// Rounded host + worker CPU load, when it was computed.
    pub aggregate_cpu: Option<f64>,
}

pub struct HealthMonitor {
    env: Arc<dyn Environment>,
    options: watch::Receiver<HealthMonitorOptions>,
    host: Arc<dyn ProcessStatsSource>,
    workers: WorkerStatusSlot,
}

impl HealthMonitor {
    pub fn new(
        env: Arc<dyn Environment>,
        options: watch::Receiver<HealthMonitorOptions>,
        host: Arc<dyn ProcessStatsSource>,
        workers: WorkerStatusSlot,
    ) -> Self {
        Self {
            env,
            options,
            host,
            workers,
        }
    }

    /// Current options; re-read on every call so reloads apply immediately.
    pub fn options(&self) -> HealthMonitorOptions {
        self.options.borrow().clone()
    }

    /// Check sandbox counters. Missing or malformed counters yield `false`.
    pub fn counter_thresholds_exceeded(&self, exceeded: Option<&mut Vec<String>>) -> bool {
        let threshold = self.options.borrow().counter_threshold;
        match read_counters(self.env.as_ref()) {
            Some(counters) => counters.thresholds_exceeded(threshold, exceeded),
            None => false,
        }
    }

    /// Counters first, then CPU. Short-circuits on the first exceeded source.
    pub async fn is_under_high_load(&self, mut exceeded: Option<&mut Vec<String>>) -> bool {
        self.counter_thresholds_exceeded(exceeded.as_deref_mut())
            || self.process_thresholds_exceeded(exceeded).await
    }

    /// Check aggregate host + worker CPU load against the rescaled threshold.
    pub async fn process_thresholds_exceeded(&self, exceeded: Option<&mut Vec<String>>) -> bool {
        let Some(aggregate) = self.aggregate_cpu_load().await else {
            return false;
        };
        self.cpu_exceeded(aggregate, exceeded)
    }

    /// Full evaluation with context for logging.
    pub async fn evaluate(&self) -> HealthReport {
        let mut report = HealthReport::default();
        if self.counter_thresholds_exceeded(Some(&mut report.exceeded)) {
            report.overloaded = true;
            return report;
        }
        if let Some(aggregate) = self.aggregate_cpu_load().await {
            report.aggregate_cpu = Some(aggregate);
            report.overloaded = self.cpu_exceeded(aggregate, Some(&mut report.exceeded));
        }
        report
    }

    fn cpu_exceeded(&self, aggregate: f64, exceeded: Option<&mut Vec<String>>) -> bool {
        // CPU is a 0–100 percentage; the threshold is a 0–1 fraction.
        let adjusted_threshold = self.options.borrow().counter_threshold * 100.0;
        if aggregate >= adjusted_threshold {
            debug!(aggregate, adjusted_threshold, "host overloaded");
            if let Some(out) = exceeded {
                out.push(CPU_COUNTER.to_string());
            }
            return true;
        }
        false
    }

    /// Rounded host + worker CPU load, or `None` if the host does not yet
    /// have enough samples.
    async fn aggregate_cpu_load(&self) -> Option<f64> {
        let host = self.host.stats();
        let history = &host.cpu_load_history;
        if !history.is_empty() {
            let max = history.iter().copied().fold(f64::MIN, f64::max);
            debug!(
                cpu_load_history = ?history,
                avg_load = average(history).round(),
                max_load = max.round(),
                "host process stats"
            );
        }
        if history.len() <= MIN_SAMPLE_COUNT {
            return None;
        }

        let workers = self.workers_cpu_average().await;
        let aggregate = (trailing_average(history) + workers).round();
        debug!(aggregate, workers, "host aggregate load");
        Some(aggregate)
    }

    /// Average of per-worker trailing averages, zero when no worker data is
    /// available in time.
    async fn workers_cpu_average(&self) -> f64 {
        let Some(source) = self.workers.ready() else {
            return 0.0;
        };
        let timeout = self.options.borrow().worker_status_timeout;

        match tokio::time::timeout(timeout, source.worker_statuses()).await {
            Ok(Ok(statuses)) => workers_cpu_average(
                statuses
                    .values()
                    .map(|s| s.process_stats.cpu_load_history.as_slice()),
            ),
            Ok(Err(e)) => {
                warn!(error = %e, "worker status query failed, ignoring worker load");
                0.0
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "worker status query timed out, ignoring worker load");
                0.0
            }
        }
    }
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Average of the most recent `MIN_SAMPLE_COUNT` samples.
pub fn trailing_average(history: &[f64]) -> f64 {
    let start = history.len().saturating_sub(MIN_SAMPLE_COUNT);
    average(&history[start..])
}

/// Average of trailing averages over workers with at least
/// `MIN_SAMPLE_COUNT` samples. Zero if none qualify.
pub fn workers_cpu_average<'a>(histories: impl IntoIterator<Item = &'a [f64]>) -> f64 {
    let per_worker: Vec<f64> = histories
        .into_iter()
        .filter(|h| h.len() >= MIN_SAMPLE_COUNT)
        .map(trailing_average)
        .collect();
    average(&per_worker)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use fnhost_core::{StaticEnvironment, names};

    use super::*;
    use crate::workers::{BoxFuture, DispatcherState, WorkerStatus, WorkerStatusSource, WorkerStatuses};

    struct FakeWorkers {
        state: DispatcherState,
        histories: Vec<Vec<f64>>,
        delay: Duration,
    }

    impl WorkerStatusSource for FakeWorkers {
        fn state(&self) -> DispatcherState {
            self.state
        }

        fn worker_statuses(&self) -> BoxFuture<'_, anyhow::Result<WorkerStatuses>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                Ok(self
                    .histories
                    .iter()
                    .enumerate()
                    .map(|(i, h)| {
                        (
                            format!("worker-{i}"),
                            WorkerStatus {
                                process_stats: ProcessStats::new(h.clone()),
                            },
                        )
                    })
                    .collect::<HashMap<_, _>>())
            })
        }
    }

    fn options(threshold: f64) -> HealthMonitorOptions {
        HealthMonitorOptions {
            counter_threshold: threshold,
            worker_status_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn monitor_with(
        env: StaticEnvironment,
        host: Vec<f64>,
        workers: Option<FakeWorkers>,
    ) -> (HealthMonitor, watch::Sender<HealthMonitorOptions>) {
        let (tx, rx) = watch::channel(options(0.80));
        let slot = WorkerStatusSlot::new();
        if let Some(w) = workers {
            slot.set(Some(Arc::new(w)));
        }
        let monitor = HealthMonitor::new(Arc::new(env), rx, Arc::new(ProcessStats::new(host)), slot);
        (monitor, tx)
    }

    #[test]
    fn trailing_average_uses_last_five() {
        assert_eq!(trailing_average(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0]), 40.0);
        assert_eq!(trailing_average(&[1.0, 3.0]), 2.0);
        assert_eq!(trailing_average(&[]), 0.0);
    }

    #[test]
    fn worker_average_is_average_of_averages() {
        let a = [90.0; 5];
        let b = [50.0; 7];
        assert_eq!(workers_cpu_average([&a[..], &b[..]]), 70.0);
    }

    #[test]
    fn worker_average_skips_short_histories() {
        let a = [90.0; 5];
        let short = [100.0; 4];
        assert_eq!(workers_cpu_average([&a[..], &short[..]]), 90.0);
        assert_eq!(workers_cpu_average([&short[..]]), 0.0);
    }

    #[test]
    fn counters_exceeded_reports_names() {
        let env = StaticEnvironment::new().with(
            names::APP_COUNTERS,
            r#"{"activeConnections":81,"activeConnectionLimit":100}"#,
        );
        let (monitor, _tx) = monitor_with(env, vec![], None);

        let mut exceeded = Vec::new();
        assert!(monitor.counter_thresholds_exceeded(Some(&mut exceeded)));
        assert_eq!(exceeded, vec!["ActiveConnections".to_string()]);
    }

    #[test]
    fn counters_respect_reloaded_threshold() {
        let env = StaticEnvironment::new().with(
            names::APP_COUNTERS,
            r#"{"threads":85,"threadLimit":100}"#,
        );
        let (monitor, tx) = monitor_with(env, vec![], None);
        assert!(monitor.counter_thresholds_exceeded(None));

        tx.send(options(0.90)).unwrap();
        assert!(!monitor.counter_thresholds_exceeded(None));
    }

    #[test]
    fn malformed_counters_are_no_signal() {
        let env = StaticEnvironment::new().with(names::APP_COUNTERS, "garbage");
        let (monitor, _tx) = monitor_with(env, vec![], None);
        assert!(!monitor.counter_thresholds_exceeded(None));
    }

    #[tokio::test]
    async fn moderate_host_load_not_exceeded() {
        let (monitor, _tx) = monitor_with(
            StaticEnvironment::new(),
            vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0],
            None,
        );
        let mut exceeded = Vec::new();
        assert!(!monitor.process_thresholds_exceeded(Some(&mut exceeded)).await);
        assert!(exceeded.is_empty());
    }

    #[tokio::test]
    async fn heavy_host_load_exceeded() {
        let (monitor, _tx) = monitor_with(
            StaticEnvironment::new(),
            vec![70.0, 80.0, 90.0, 95.0, 99.0, 100.0],
            None,
        );
        let mut exceeded = Vec::new();
        assert!(monitor.process_thresholds_exceeded(Some(&mut exceeded)).await);
        assert_eq!(exceeded, vec![CPU_COUNTER.to_string()]);
    }

    #[tokio::test]
    async fn too_few_host_samples_never_exceeded() {
        let (monitor, _tx) = monitor_with(StaticEnvironment::new(), vec![100.0; 5], None);
        assert!(!monitor.process_thresholds_exceeded(None).await);
    }

    #[tokio::test]
    async fn worker_load_adds_to_host_load() {
        let workers = FakeWorkers {
            state: DispatcherState::Initialized,
            histories: vec![vec![90.0; 5], vec![50.0; 5]],
            delay: Duration::ZERO,
        };
        let (monitor, _tx) = monitor_with(StaticEnvironment::new(), vec![10.0; 6], Some(workers));

        let report = monitor.evaluate().await;
        assert!(report.overloaded);
        assert_eq!(report.aggregate_cpu, Some(80.0));
        assert_eq!(report.exceeded, vec![CPU_COUNTER.to_string()]);
    }

    #[tokio::test]
    async fn uninitialized_dispatcher_contributes_nothing() {
        let workers = FakeWorkers {
            state: DispatcherState::Initializing,
            histories: vec![vec![100.0; 5]],
            delay: Duration::ZERO,
        };
        let (monitor, _tx) = monitor_with(StaticEnvironment::new(), vec![10.0; 6], Some(workers));

        let report = monitor.evaluate().await;
        assert!(!report.overloaded);
        assert_eq!(report.aggregate_cpu, Some(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_worker_query_is_bounded() {
        let workers = FakeWorkers {
            state: DispatcherState::Initialized,
            histories: vec![vec![100.0; 5]],
            delay: Duration::from_secs(60),
        };
        let (monitor, _tx) = monitor_with(StaticEnvironment::new(), vec![10.0; 6], Some(workers));

        let started = tokio::time::Instant::now();
        let report = monitor.evaluate().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!report.overloaded);
        assert_eq!(report.aggregate_cpu, Some(10.0));
    }

    #[tokio::test]
    async fn counters_short_circuit_cpu() {
        let env = StaticEnvironment::new().with(
            names::APP_COUNTERS,
            r#"{"processes":95,"processLimit":100}"#,
        );
        let (monitor, _tx) = monitor_with(env, vec![100.0; 6], None);

        let mut exceeded = Vec::new();
        assert!(monitor.is_under_high_load(Some(&mut exceeded)).await);
        assert_eq!(exceeded, vec!["Processes".to_string()]);

        let report = monitor.evaluate().await;
        assert!(report.overloaded);
        assert_eq!(report.aggregate_cpu, None);
    }

    #[tokio::test]
    async fn healthy_host_reports_nothing() {
        let (monitor, _tx) = monitor_with(StaticEnvironment::new(), vec![5.0; 10], None);
        assert!(!monitor.is_under_high_load(None).await);
        let report = monitor.evaluate().await;
        assert!(!report.overloaded);
        assert!(report.exceeded.is_empty());
    }
}
