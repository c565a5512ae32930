//! Background thread that runs the deadline sweep on a fixed interval.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use tryout_events::{EventBus, EventEnvelope};

use super::{DeadlineSweeper, SweepReport};
use crate::store::SessionStore;

#[derive(Debug, Clone)]
pub struct SweepWorkerConfig {
    /// Time between sweep passes.
    pub interval: Duration,
    /// Sweep immediately on start instead of waiting one interval.
    pub run_on_start: bool,
    /// Thread name, also used in logs.
    pub name: String,
}

impl Default for SweepWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            run_on_start: true,
            name: "deadline-sweeper".to_string(),
        }
    }
}

impl SweepWorkerConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }
}

/// Cumulative counters since the worker started.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStats {
    pub passes: u64,
    pub failed_passes: u64,
    pub sessions_cancelled: u64,
    pub sessions_failed: u64,
    pub uptime_secs: u64,
}

impl SweepStats {
    fn record(&mut self, report: &SweepReport) {
        self.passes += 1;
        self.sessions_cancelled += report.cancelled;
        self.sessions_failed += report.failed;
    }
}

#[derive(Debug)]
pub struct SweepWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SweepStats>>,
}

impl SweepWorkerHandle {
    /// Stop the worker and wait for the current pass to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn stats(&self) -> SweepStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct SweepWorker<S, B> {
    sweeper: DeadlineSweeper<S, B>,
}

impl<S, B> SweepWorker<S, B>
where
    S: SessionStore + 'static,
    B: EventBus<EventEnvelope<serde_json::Value>> + 'static,
{
    pub fn new(sweeper: DeadlineSweeper<S, B>) -> Self {
        Self { sweeper }
    }

    pub fn spawn(self, config: SweepWorkerConfig) -> io::Result<SweepWorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SweepStats::default()));
        let loop_stats = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || sweep_loop(self.sweeper, config, shutdown_rx, loop_stats))?;

        Ok(SweepWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn sweep_loop<S, B>(
    sweeper: DeadlineSweeper<S, B>,
    config: SweepWorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SweepStats>>,
) where
    S: SessionStore,
    B: EventBus<EventEnvelope<serde_json::Value>>,
{
    info!(worker = %config.name, interval_secs = config.interval.as_secs(), "sweep worker started");
    let started = Instant::now();
    let mut run_now = config.run_on_start;

    loop {
        if run_now {
            let outcome = sweeper.run_once();
            if let Ok(mut s) = stats.lock() {
                s.uptime_secs = started.elapsed().as_secs();
                match &outcome {
                    Ok(report) => s.record(report),
                    Err(_) => s.failed_passes += 1,
                }
            }
            if let Err(err) = outcome {
                error!(worker = %config.name, %err, "deadline sweep failed");
            }
        }
        run_now = true;

        // The shutdown channel doubles as the interval timer.
        match shutdown_rx.recv_timeout(config.interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = %config.name, "sweep worker stopped");
}
