use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::jobs::{JobStore, ResetOutcome};

/// Resetter configuration.
#[derive(Debug, Clone)]
pub struct ResetterConfig {
    /// Time between reset passes.
    pub interval: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for ResetterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            name: "stalled-job-resetter".to_string(),
        }
    }
}

impl ResetterConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Cumulative resetter statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResetterStats {
    pub runs: u64,
    pub reset: u64,
    pub errored: u64,
    pub canceled: u64,
    pub failed_runs: u64,
}

/// Handle to control a running resetter.
#[derive(Debug)]
pub struct ResetterHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ResetterStats>>,
}

impl ResetterHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            warn!(worker = %self.name, error = %err, "stalled job resetter did not stop cleanly");
        }
    }

    pub fn stats(&self) -> ResetterStats {
        lock_stats(&self.stats).clone()
    }
}

/// Periodically returns stalled processing records to the queue.
///
/// Each pass calls [`JobStore::reset_stalled`]. A failed pass is logged and the
/// loop carries on with the next tick.
pub struct StalledJobResetter<S, P> {
    store: S,
    _payload: PhantomData<fn() -> P>,
}

impl<S, P> StalledJobResetter<S, P>
where
    S: JobStore<P> + 'static,
    P: Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            _payload: PhantomData,
        }
    }

    /// Spawn the resetter on the current tokio runtime.
    pub fn spawn(self, config: ResetterConfig) -> ResetterHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ResetterStats::default()));
        let name = config.name.clone();

        let join = tokio::spawn(reset_loop(self.store, config, shutdown_rx, stats.clone()));

        ResetterHandle {
            name,
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    /// Run a single pass (for tests or manual triggering).
    pub async fn run_once(&self) -> Result<ResetOutcome, crate::jobs::JobStoreError> {
        self.store.reset_stalled().await
    }
}

async fn reset_loop<S, P>(
    store: S,
    config: ResetterConfig,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<Mutex<ResetterStats>>,
) where
    S: JobStore<P>,
    P: Send + Sync + 'static,
{
    let queue = store.options().queue.clone();
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(worker = %config.name, queue = %queue, "stalled job resetter started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        let result = store.reset_stalled().await;
        let mut totals = lock_stats(&stats);
        totals.runs += 1;

        match result {
            Ok(outcome) => {
                for record in &outcome.reset {
                    warn!(
                        queue = %queue,
                        job_id = %record.id,
                        age_secs = record.heartbeat_age.as_secs(),
                        "reset stalled job"
                    );
                }
                for record in &outcome.errored {
                    warn!(
                        queue = %queue,
                        job_id = %record.id,
                        age_secs = record.heartbeat_age.as_secs(),
                        "stalled job exhausted its resets"
                    );
                }
                for record in &outcome.canceled {
                    info!(
                        queue = %queue,
                        job_id = %record.id,
                        age_secs = record.heartbeat_age.as_secs(),
                        "failed cancelled job after its executor stopped"
                    );
                }
                totals.reset += outcome.reset.len() as u64;
                totals.errored += outcome.errored.len() as u64;
                totals.canceled += outcome.canceled.len() as u64;
            }
            Err(err) => {
                totals.failed_runs += 1;
                error!(worker = %config.name, queue = %queue, error = %err, "failed to reset stalled jobs");
            }
        }
    }

    debug!(worker = %config.name, queue = %queue, "stalled job resetter stopped");
}

fn lock_stats(stats: &Mutex<ResetterStats>) -> std::sync::MutexGuard<'_, ResetterStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
