//! Periodic sweeps.
//!
//! Each sweep is registered under its name with its own interval and can be
//! started, stopped or triggered on demand independently of the others.
//! `status()` is a pure read of the last recorded runs.

pub mod sweeps;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::utils::{Clock, SystemClock};

pub use sweeps::{AnalysisSweep, AnalysisSweepConfig, CleanupSweep, UsageSweep};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub found: usize,
    pub queued: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// One pass. Per-item failures are counted as skipped; an `Err` means the
    /// pass as a whole could not run.
    async fn run(&self) -> anyhow::Result<SweepReport>;
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown sweep: {0}")]
    UnknownSweep(String),

    #[error("sweep {name} failed: {message}")]
    SweepFailed { name: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepStatus {
    pub name: &'static str,
    pub interval_secs: u64,
    pub running: bool,
    pub runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_report: Option<SweepReport>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct SweepHistory {
    runs: u64,
    last_run_at: Option<DateTime<Utc>>,
    last_report: Option<SweepReport>,
    last_error: Option<String>,
}

enum TimerState {
    Stopped,
    Running {
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
}

/// Everything a timer task or `run_now` needs to execute a sweep once.
#[derive(Clone)]
struct SweepRunner {
    sweep: Arc<dyn Sweep>,
    history: Arc<RwLock<SweepHistory>>,
    /// Keeps a manual run and a timer tick from overlapping.
    gate: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
}

impl SweepRunner {
    async fn run(&self) -> anyhow::Result<SweepReport> {
        let _guard = self.gate.lock().await;
        let name = self.sweep.name();
        let started = Instant::now();
        let result = self.sweep.run().await;
        let finished_at = self.clock.now();

        {
            let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
            history.runs += 1;
            history.last_run_at = Some(finished_at);
            match &result {
                Ok(report) => {
                    history.last_report = Some(*report);
                    history.last_error = None;
                }
                Err(e) => history.last_error = Some(format!("{:#}", e)),
            }
        }

        match &result {
            Ok(report) => info!(
                sweep = name,
                found = report.found,
                queued = report.queued,
                updated = report.updated,
                skipped = report.skipped,
                duration_ms = started.elapsed().as_millis() as u64,
                "Sweep finished"
            ),
            Err(e) => error!(sweep = name, error = %format!("{:#}", e), "Sweep failed"),
        }
        result
    }
}

struct SweepEntry {
    runner: SweepRunner,
    interval: Duration,
    state: TimerState,
}

pub struct Scheduler {
    entries: RwLock<Vec<SweepEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a sweep, stopped. Registering a name twice replaces the earlier
    /// sweep once it is stopped.
    pub fn register(&self, sweep: Arc<dyn Sweep>, interval: Duration) {
        let runner = SweepRunner {
            sweep,
            history: Arc::new(RwLock::new(SweepHistory::default())),
            gate: Arc::new(Mutex::new(())),
            clock: self.clock.clone(),
        };
        let name = runner.sweep.name();
        let entry = SweepEntry {
            runner,
            interval,
            state: TimerState::Stopped,
        };

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.iter_mut().find(|e| e.runner.sweep.name() == name) {
            Some(existing) if matches!(existing.state, TimerState::Stopped) => *existing = entry,
            Some(_) => warn!(sweep = name, "Sweep is running, keeping the existing registration"),
            None => entries.push(entry),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().map(|e| e.runner.sweep.name()).collect()
    }

    /// Start the named sweep's timer. The first run happens one interval
    /// from now. Returns `false` if it was already running.
    pub fn start(&self, name: &str) -> Result<bool, SchedulerError> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .iter_mut()
            .find(|e| e.runner.sweep.name() == name)
            .ok_or_else(|| SchedulerError::UnknownSweep(name.to_string()))?;

        if matches!(entry.state, TimerState::Running { .. }) {
            return Ok(false);
        }

        let (tx, mut rx) = watch::channel(false);
        let runner = entry.runner.clone();
        let period = entry.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        // Failures are recorded in the sweep history.
                        let _ = runner.run().await;
                    }
                }
            }
        });

        entry.state = TimerState::Running { shutdown: tx, handle };
        info!(sweep = name, interval_secs = period.as_secs(), "Sweep scheduled");
        Ok(true)
    }

    /// Stop the named sweep's timer, letting an in-progress run finish.
    /// Returns `false` if it was not running.
    pub async fn stop(&self, name: &str) -> Result<bool, SchedulerError> {
        let state = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .iter_mut()
                .find(|e| e.runner.sweep.name() == name)
                .ok_or_else(|| SchedulerError::UnknownSweep(name.to_string()))?;
            std::mem::replace(&mut entry.state, TimerState::Stopped)
        };

        match state {
            TimerState::Running { shutdown, handle } => {
                let _ = shutdown.send(true);
                if let Err(e) = handle.await {
                    error!(sweep = name, "Sweep task ended abnormally: {}", e);
                }
                info!(sweep = name, "Sweep stopped");
                Ok(true)
            }
            TimerState::Stopped => Ok(false),
        }
    }

    pub fn start_all(&self) {
        for name in self.names() {
            if let Err(e) = self.start(name) {
                error!(sweep = name, error = %e, "Failed to start sweep");
            }
        }
    }

    pub async fn stop_all(&self) {
        for name in self.names() {
            if let Err(e) = self.stop(name).await {
                error!(sweep = name, error = %e, "Failed to stop sweep");
            }
        }
    }

    /// Run the named sweep once, outside its timer.
    pub async fn run_now(&self, name: &str) -> Result<SweepReport, SchedulerError> {
        let runner = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries
                .iter()
                .find(|e| e.runner.sweep.name() == name)
                .map(|e| e.runner.clone())
                .ok_or_else(|| SchedulerError::UnknownSweep(name.to_string()))?
        };

        runner.run().await.map_err(|e| SchedulerError::SweepFailed {
            name: name.to_string(),
            message: format!("{:#}", e),
        })
    }

    pub fn status(&self) -> Vec<SweepStatus> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|entry| {
                let history = entry.runner.history.read().unwrap_or_else(|e| e.into_inner());
                SweepStatus {
                    name: entry.runner.sweep.name(),
                    interval_secs: entry.interval.as_secs(),
                    running: matches!(entry.state, TimerState::Running { .. }),
                    runs: history.runs,
                    last_run_at: history.last_run_at,
                    last_report: history.last_report,
                    last_error: history.last_error.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSweep {
        name: &'static str,
        runs: AtomicUsize,
        fail: bool,
    }

    impl CountingSweep {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self { name, runs: AtomicUsize::new(0), fail })
        }
    }

    #[async_trait]
    impl Sweep for CountingSweep {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self) -> anyhow::Result<SweepReport> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                anyhow::bail!("database unavailable");
            }
            Ok(SweepReport { found: n, queued: n, updated: 0, skipped: 0 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_run_on_their_own_intervals() {
        let scheduler = Scheduler::new();
        let fast = CountingSweep::new("fast", false);
        let slow = CountingSweep::new("slow", false);
        scheduler.register(fast.clone(), Duration::from_secs(10));
        scheduler.register(slow.clone(), Duration::from_secs(60));

        scheduler.start_all();
        tokio::time::sleep(Duration::from_secs(65)).await;
        scheduler.stop_all().await;

        assert_eq!(fast.runs.load(Ordering::SeqCst), 6);
        assert_eq!(slow.runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.status().iter().all(|s| !s.running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_one_sweep_leaves_others_running() {
        let scheduler = Scheduler::new();
        let a = CountingSweep::new("a", false);
        let b = CountingSweep::new("b", false);
        scheduler.register(a.clone(), Duration::from_secs(10));
        scheduler.register(b.clone(), Duration::from_secs(10));

        assert!(scheduler.start("a").unwrap());
        assert!(!scheduler.start("a").unwrap());
        assert!(scheduler.start("b").unwrap());
        assert!(scheduler.stop("a").await.unwrap());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(a.runs.load(Ordering::SeqCst), 0);
        assert_eq!(b.runs.load(Ordering::SeqCst), 2);

        let status = scheduler.status();
        assert!(!status[0].running);
        assert!(status[1].running);
        scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn test_run_now_records_report_and_errors() {
        let scheduler = Scheduler::new();
        scheduler.register(CountingSweep::new("ok", false), Duration::from_secs(3600));
        scheduler.register(CountingSweep::new("broken", true), Duration::from_secs(3600));

        let report = scheduler.run_now("ok").await.unwrap();
        assert_eq!(report.queued, 1);

        let err = scheduler.run_now("broken").await.unwrap_err();
        assert!(matches!(err, SchedulerError::SweepFailed { .. }));
        assert!(matches!(scheduler.run_now("nope").await, Err(SchedulerError::UnknownSweep(_))));

        let status = scheduler.status();
        assert_eq!(status[0].runs, 1);
        assert_eq!(status[0].last_report, Some(report));
        assert!(status[0].last_run_at.is_some());
        assert_eq!(status[1].last_error.as_deref(), Some("database unavailable"));
        assert_eq!(status[1].last_report, None);
    }

    #[tokio::test]
    async fn test_unknown_sweep_cannot_start() {
        let scheduler = Scheduler::new();
        assert!(matches!(scheduler.start("analysis"), Err(SchedulerError::UnknownSweep(_))));
        assert!(scheduler.stop("analysis").await.is_err());
    }
}
