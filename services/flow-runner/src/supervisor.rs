//! Worker supervision over a heartbeat channel
//!
//! The worker reports liveness through a `watch` channel. A worker that goes
//! quiet (longer than `stall_intervals` loop intervals in steady state, or
//! `init_timeout_secs` while initializing), returns an error, or panics is
//! replaced after an exponential cooldown. Too many restarts inside the
//! window abort the process.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::WatchdogConfig;
use crate::runner::Heartbeat;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("crash loop: {restarts} restarts within {window_secs}s")]
    CrashLoop { restarts: usize, window_secs: u64 },
}

/// Why a worker incarnation ended
#[derive(Debug)]
enum WorkerExit {
    Stalled(Duration),
    Failed(String),
}

/// Restart bookkeeping: recent restart times and the cooldown schedule
struct RestartPolicy {
    base: Duration,
    max: Duration,
    window: Duration,
    max_restarts: usize,
    recent: VecDeque<Instant>,
}

impl RestartPolicy {
    fn new(config: &WatchdogConfig) -> Self {
        Self {
            base: Duration::from_secs(config.restart_base_secs.max(1)),
            max: Duration::from_secs(config.restart_max_secs.max(config.restart_base_secs.max(1))),
            window: Duration::from_secs(config.restart_window_secs),
            max_restarts: config.max_restarts.max(1),
            recent: VecDeque::new(),
        }
    }

    /// Register a restart; `Err` when the crash-loop budget is spent,
    /// otherwise the cooldown before the next spawn
    fn register(&mut self, now: Instant) -> Result<Duration, SupervisorError> {
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) > self.window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= self.max_restarts {
            return Err(SupervisorError::CrashLoop {
                restarts: self.recent.len(),
                window_secs: self.window.as_secs(),
            });
        }
        self.recent.push_back(now);

        let restarts = self.recent.len();
        let exp = u32::try_from(restarts.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        Ok(self.base.saturating_mul(1 << exp).min(self.max))
    }
}

/// Run workers produced by `spawn_worker` until `shutdown` fires.
///
/// `spawn_worker` receives the heartbeat sender and a shutdown receiver for
/// the new incarnation. `loop_interval` is the worker's cycle interval.
pub async fn supervise<F, Fut>(
    mut spawn_worker: F,
    mut shutdown: watch::Receiver<bool>,
    config: &WatchdogConfig,
    loop_interval: Duration,
) -> Result<(), SupervisorError>
where
    F: FnMut(watch::Sender<Heartbeat>, watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let stall_limit = loop_interval.saturating_mul(config.stall_intervals.max(1));
    let init_limit = Duration::from_secs(config.init_timeout_secs);
    let check_every = Duration::from_secs(config.check_interval_secs.max(1));
    let mut restarts = RestartPolicy::new(config);
    let mut incarnation = 0u64;

    loop {
        incarnation += 1;
        let (beat_tx, beat_rx) = watch::channel(Heartbeat::starting());
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handle: JoinHandle<anyhow::Result<()>> =
            tokio::spawn(spawn_worker(beat_tx, stop_rx));
        info!("Worker #{} started", incarnation);

        let mut check = tokio::time::interval(check_every);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested, waiting for worker #{} to finish its cycle", incarnation);
                        let _ = stop_tx.send(true);
                        match (&mut handle).await {
                            Ok(Ok(())) => info!("Worker #{} stopped cleanly", incarnation),
                            Ok(Err(e)) => warn!("Worker #{} stopped with error: {:#}", incarnation, e),
                            Err(e) => warn!("Worker #{} did not stop cleanly: {}", incarnation, e),
                        }
                        return Ok(());
                    }
                }
                joined = &mut handle => {
                    break match joined {
                        Ok(Ok(())) => {
                            info!("Worker #{} exited", incarnation);
                            return Ok(());
                        }
                        Ok(Err(e)) => WorkerExit::Failed(format!("{:#}", e)),
                        Err(e) => WorkerExit::Failed(format!("worker task ended: {}", e)),
                    };
                }
                _ = check.tick() => {
                    let beat = *beat_rx.borrow();
                    let limit = if beat.steady { stall_limit } else { init_limit };
                    let quiet = beat.at.elapsed();
                    if quiet > limit {
                        handle.abort();
                        break WorkerExit::Stalled(quiet);
                    }
                }
            }
        };

        match &exit {
            WorkerExit::Stalled(quiet) => {
                warn!("Worker #{} silent for {:?}, restarting", incarnation, quiet)
            }
            WorkerExit::Failed(reason) => error!("Worker #{} failed: {}", incarnation, reason),
        }

        let cooldown = match restarts.register(Instant::now()) {
            Ok(cooldown) => cooldown,
            Err(e) => {
                error!("Giving up: {}", e);
                return Err(e);
            }
        };
        info!("Restarting worker in {:?}", cooldown);
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(cooldown) => {}
        }
    }
}
