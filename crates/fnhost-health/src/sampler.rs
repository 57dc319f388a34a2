//! Periodic CPU sampling for a single OS process.
//!
//! A `ProcessSampler` owns a timer task that reads the process's cumulative
//! CPU time on a fixed interval and converts the delta into a utilization
//! percentage (0–100, normalized across available cores). The most recent
//! samples are kept in a bounded ring buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use fnhost_core::SamplerOptions;

/// Source of cumulative CPU time for one process.
pub trait CpuTimeSource: Send + 'static {
    /// Total CPU time the process has consumed, or `None` if it can no
    /// longer be read (typically because the process exited).
    fn total_cpu_time(&mut self) -> Option<Duration>;
}

/// `CpuTimeSource` backed by `sysinfo`.
pub struct SysinfoCpuSource {
    system: System,
    pid: Pid,
}

impl SysinfoCpuSource {
    /// Sample the current process.
    pub fn current() -> Self {
        Self::for_pid(std::process::id())
    }

    pub fn for_pid(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
        }
    }
}

impl CpuTimeSource for SysinfoCpuSource {
    fn total_cpu_time(&mut self) -> Option<Duration> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system
            .process(self.pid)
            .map(|p| Duration::from_millis(p.accumulated_cpu_time()))
    }
}

/// Immutable snapshot of a process's recent CPU history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessStats {
    /// Oldest first.
    pub cpu_load_history: Vec<f64>,
}

impl ProcessStats {
    pub fn new(cpu_load_history: Vec<f64>) -> Self {
        Self { cpu_load_history }
    }
}

struct Probe {
    source: Box<dyn CpuTimeSource>,
    last: Option<(Instant, Duration)>,
}

struct SamplerInner {
    label: String,
    interval: Duration,
    capacity: usize,
    cores: f64,
    probe: Mutex<Probe>,
    history: Mutex<VecDeque<f64>>,
}

/// Rolling CPU utilization view of one process.
pub struct ProcessSampler {
    inner: Arc<SamplerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessSampler {
    pub fn new(label: impl Into<String>, source: Box<dyn CpuTimeSource>, options: &SamplerOptions) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_cores(label, source, options, cores)
    }

    /// Sampler for the current process.
    pub fn for_current_process(options: &SamplerOptions) -> Self {
        Self::new("host", Box::new(SysinfoCpuSource::current()), options)
    }

    /// Create a sampler with an explicit core count for normalization.
    pub fn with_cores(
        label: impl Into<String>,
        source: Box<dyn CpuTimeSource>,
        options: &SamplerOptions,
        cores: usize,
    ) -> Self {
        let capacity = options.history_size.max(1);
        Self {
            inner: Arc::new(SamplerInner {
                label: label.into(),
                interval: options.interval,
                capacity,
                cores: cores.max(1) as f64,
                probe: Mutex::new(Probe { source, last: None }),
                history: Mutex::new(VecDeque::with_capacity(capacity)),
            }),
            task: Mutex::new(None),
        }
    }

    /// Begin periodic sampling. Calling this on a running sampler is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(inner.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.sample(Instant::now());
            }
        }));
        debug!(process = %self.inner.label, interval_ms = self.inner.interval.as_millis() as u64, "cpu sampler started");
    }

    /// Cancel the periodic timer.
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
            debug!(process = %self.inner.label, "cpu sampler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Snapshot of the current CPU load history.
    pub fn stats(&self) -> ProcessStats {
        ProcessStats {
            cpu_load_history: lock(&self.inner.history).iter().copied().collect(),
        }
    }

    /// Take one sample immediately, outside the timer cadence.
    pub fn sample_now(&self) {
        self.inner.sample(Instant::now());
    }
}

impl Drop for ProcessSampler {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

impl SamplerInner {
    fn sample(&self, now: Instant) {
        let load = {
            let mut probe = lock(&self.probe);
            match probe.source.total_cpu_time() {
                Some(cpu) => {
                    let load = probe
                        .last
                        .and_then(|(at, prev)| cpu_load(now - at, cpu.saturating_sub(prev), self.cores));
                    probe.last = Some((now, cpu));
                    load
                }
                None => {
                    // An exited process consumes nothing.
                    debug!(process = %self.label, "cpu time unavailable, recording zero load");
                    probe.last = None;
                    Some(0.0)
                }
            }
        };

        if let Some(load) = load {
            self.push(load);
        }
    }

    fn push(&self, load: f64) {
        let mut history = lock(&self.history);
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(load);
        trace!(process = %self.label, load, samples = history.len(), "cpu sample");
    }
}

/// CPU percentage for a sampling interval, or `None` for a zero-length one.
fn cpu_load(wall: Duration, cpu: Duration, cores: f64) -> Option<f64> {
    let wall = wall.as_secs_f64();
    if wall <= 0.0 {
        return None;
    }
    let pct = cpu.as_secs_f64() / (wall * cores) * 100.0;
    Some(pct.clamp(0.0, 100.0))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Source that reports a fixed CPU increment per call, then exits
    /// after `calls_until_exit` reads.
    struct StepSource {
        total: Duration,
        step: Duration,
        calls_until_exit: Option<usize>,
        calls: Arc<Mutex<usize>>,
    }

    impl StepSource {
        fn new(step: Duration) -> Self {
            Self {
                total: Duration::ZERO,
                step,
                calls_until_exit: None,
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl CpuTimeSource for StepSource {
        fn total_cpu_time(&mut self) -> Option<Duration> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if self.calls_until_exit.is_some_and(|n| *calls > n) {
                return None;
            }
            self.total += self.step;
            Some(self.total)
        }
    }

    fn options(history_size: usize) -> SamplerOptions {
        SamplerOptions {
            interval: Duration::from_secs(1),
            history_size,
        }
    }

    #[test]
    fn cpu_load_normalizes_by_cores() {
        let load = cpu_load(Duration::from_secs(1), Duration::from_millis(500), 1.0).unwrap();
        assert!((load - 50.0).abs() < 1e-9);

        let load = cpu_load(Duration::from_secs(1), Duration::from_millis(500), 2.0).unwrap();
        assert!((load - 25.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_load_clamps_and_skips_zero_interval() {
        assert_eq!(cpu_load(Duration::from_secs(1), Duration::from_secs(8), 2.0), Some(100.0));
        assert_eq!(cpu_load(Duration::ZERO, Duration::from_secs(1), 1.0), None);
    }

    #[test]
    fn history_is_bounded_ring_buffer() {
        let sampler = ProcessSampler::with_cores(
            "test",
            Box::new(StepSource::new(Duration::ZERO)),
            &options(3),
            1,
        );
        for load in [1.0, 2.0, 3.0, 4.0, 5.0] {
            sampler.inner.push(load);
        }
        assert_eq!(sampler.stats().cpu_load_history, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn first_reading_is_only_a_baseline() {
        let sampler = ProcessSampler::with_cores(
            "test",
            Box::new(StepSource::new(Duration::from_millis(250))),
            &options(10),
            1,
        );
        let t0 = Instant::now();
        sampler.inner.sample(t0);
        assert!(sampler.stats().cpu_load_history.is_empty());

        sampler.inner.sample(t0 + Duration::from_secs(1));
        assert_eq!(sampler.stats().cpu_load_history, vec![25.0]);
    }

    #[test]
    fn exited_process_records_zero() {
        let mut source = StepSource::new(Duration::from_millis(500));
        source.calls_until_exit = Some(2);
        let sampler = ProcessSampler::with_cores("worker", Box::new(source), &options(10), 1);

        let t0 = Instant::now();
        sampler.inner.sample(t0);
        sampler.inner.sample(t0 + Duration::from_secs(1));
        sampler.inner.sample(t0 + Duration::from_secs(2));
        sampler.inner.sample(t0 + Duration::from_secs(3));

        assert_eq!(sampler.stats().cpu_load_history, vec![50.0, 0.0, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let source = StepSource::new(Duration::from_millis(500));
        let calls = source.calls.clone();
        let sampler = ProcessSampler::with_cores("host", Box::new(source), &options(10), 1);

        sampler.start();
        sampler.start();
        assert!(sampler.is_running());

        // Ticks at 0s, 1s, 2s, 3s: one baseline read plus three samples.
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(*calls.lock().unwrap(), 4);
        assert_eq!(sampler.stats().cpu_load_history, vec![50.0, 50.0, 50.0]);

        sampler.stop();
        assert!(!sampler.is_running());
    }

    #[test]
    fn sysinfo_reads_current_process_cpu_time() {
        let mut source = SysinfoCpuSource::for_pid(std::process::id());
        let first = source.total_cpu_time().unwrap();
        let spin = std::time::Instant::now();
        while spin.elapsed() < Duration::from_millis(50) {
            std::hint::black_box(spin.elapsed());
        }
        assert!(source.total_cpu_time().unwrap() >= first);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_sampling() {
        let sampler = ProcessSampler::with_cores(
            "host",
            Box::new(StepSource::new(Duration::from_millis(100))),
            &options(10),
            1,
        );
        sampler.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        sampler.stop();

        let before = sampler.stats().cpu_load_history.len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sampler.stats().cpu_load_history.len(), before);
    }
}
