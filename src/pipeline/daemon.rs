//! Daemon loop: run triage cycles on a fixed interval until stopped.
//!
//! Cycles never overlap. After each cycle the loop sleeps for whatever is
//! left of the interval; an overrun starts the next cycle immediately. A
//! stop request is honoured between messages inside a cycle and wakes the
//! loop from its sleep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::pipeline::engine::{CycleParams, TriageEngine};
use crate::store::RunSummary;

/// Cooperative stop flag shared by the signal listener, the loop and the
/// engine.
#[derive(Debug, Default)]
pub struct StopSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The raw flag handed to [`TriageEngine::run_cycle`].
    pub fn flag(&self) -> &AtomicBool {
        &self.requested
    }

    /// Resolve once a stop has been requested.
    pub async fn wait(&self) {
        while !self.is_requested() {
            self.notify.notified().await;
        }
    }
}

/// Spawn a task that requests a stop on Ctrl-C or SIGTERM.
pub fn spawn_signal_listener(stop: Arc<StopSignal>) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Stop requested, finishing in-flight work");
        stop.request();
    })
}

/// Wait for Ctrl-C or SIGTERM. A handler that cannot be installed is
/// logged and never fires; with neither available this never resolves.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                if term.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Loop shape.
#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    pub interval: Duration,
    /// Stop after this many cycles. `None` runs until stopped.
    pub max_cycles: Option<u32>,
}

/// What the loop did before it returned.
#[derive(Debug, Default)]
pub struct LoopStats {
    pub cycles: u32,
    pub failed_cycles: u32,
    /// Summary of the most recent completed cycle.
    pub last_summary: Option<RunSummary>,
    /// Whether the most recent cycle failed before completing.
    pub last_failed: bool,
}

/// Run cycles until `stop` is requested or `max_cycles` is reached.
///
/// `on_cycle` receives every completed summary. A failed cycle is logged and
/// the loop carries on.
pub async fn run_loop<F>(
    engine: &TriageEngine,
    params: &CycleParams,
    options: &LoopOptions,
    stop: &StopSignal,
    mut on_cycle: F,
) -> LoopStats
where
    F: FnMut(&RunSummary),
{
    info!(
        interval_secs = options.interval.as_secs(),
        max_cycles = ?options.max_cycles,
        apply = params.apply,
        "Daemon loop started"
    );

    let mut stats = LoopStats::default();
    while !stop.is_requested() {
        let started = Instant::now();
        stats.cycles += 1;

        match engine.run_cycle(params, stop.flag()).await {
            Ok(summary) => {
                on_cycle(&summary);
                stats.last_summary = Some(summary);
                stats.last_failed = false;
            }
            Err(e) => {
                error!(cycle = stats.cycles, error = %e, "Cycle failed");
                stats.failed_cycles += 1;
                stats.last_failed = true;
            }
        }

        if options.max_cycles.is_some_and(|max| stats.cycles >= max) {
            info!(cycles = stats.cycles, "Cycle limit reached");
            break;
        }

        let remaining = options.interval.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            debug!(elapsed = ?started.elapsed(), "Cycle overran the interval");
            continue;
        }
        debug!(sleep = ?remaining, "Waiting for next cycle");
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = stop.wait() => {}
        }
    }

    info!(
        cycles = stats.cycles,
        failed = stats.failed_cycles,
        "Daemon loop stopped"
    );
    stats
}
