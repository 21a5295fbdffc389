//! Background services
//!
//! [`DialogTracker::start`] spawns the periodic loops that drive the
//! tracker. Each loop runs a synchronous tracker operation per interval tick
//! and stops when the shared `watch` channel flips to `true`.
//!
//! | task              | period             | runs                         |
//! |-------------------|--------------------|------------------------------|
//! | timer             | `timer_interval`   | [`DialogTracker::tick`]      |
//! | stale sweep       | `clean_interval`   | [`DialogTracker::sweep_stale`] |
//! | keep-alive        | `keepalive_interval` | [`DialogTracker::run_keepalives`] |
//! | delayed flush     | `db_update_period` | [`DialogTracker::flush_changed`] |
//! | store writer      | queue driven       | queued realtime writes       |

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DbMode;
use crate::dispatch::DialogTracker;
use crate::errors::{DialogError, DialogResult};
use crate::persistence::run_store_writer;

/// Handles of the running background tasks
pub struct TrackerTasks {
    tracker: Arc<DialogTracker>,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl TrackerTasks {
    /// Number of periodic loops running
    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    /// Stop every task, drain queued writes and run the shutdown flush
    pub async fn shutdown(self) -> DialogResult<()> {
        let TrackerTasks {
            tracker,
            shutdown_tx,
            loops,
            writer,
        } = self;

        if shutdown_tx.send(true).is_err() {
            debug!("background loops already stopped");
        }

        for result in futures::future::join_all(loops).await {
            if let Err(e) = result {
                error!(error = %e, "dialog tracker task failed");
            }
        }

        tracker.store_queue.close();
        if let Some(writer) = writer {
            writer
                .await
                .map_err(|e| DialogError::internal_error(format!("store writer task failed: {}", e)))?;
        }

        if matches!(tracker.config.db_mode, DbMode::Shutdown | DbMode::Delayed) {
            tracker.flush_all().await?;
        }

        info!("dialog tracker stopped");
        Ok(())
    }
}

impl std::fmt::Debug for TrackerTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerTasks")
            .field("loops", &self.loops.len())
            .field("writer", &self.writer.is_some())
            .finish()
    }
}

impl DialogTracker {
    /// Spawn the background tasks on the current tokio runtime
    pub fn start(self: &Arc<Self>) -> TrackerTasks {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::new();

        let tracker = self.clone();
        loops.push(spawn_loop("timer", self.config.timer_interval, shutdown_rx.clone(), move || {
            tracker.tick();
        }));

        let tracker = self.clone();
        loops.push(spawn_loop("stale-sweep", self.config.clean_interval, shutdown_rx.clone(), move || {
            tracker.sweep_stale();
        }));

        if let Some(interval) = self.config.keepalive_interval {
            let tracker = self.clone();
            loops.push(spawn_loop("keepalive", interval, shutdown_rx.clone(), move || {
                tracker.run_keepalives();
            }));
        }

        if self.config.db_mode == DbMode::Delayed {
            let tracker = self.clone();
            let mut shutdown = shutdown_rx.clone();
            let period = self.config.db_update_period;
            loops.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = tracker.flush_changed().await {
                                warn!(error = %e, "delayed dialog flush failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("delayed flush loop stopped");
            }));
        }

        let writer = match (self.store(), self.store_queue.take_receiver()) {
            (Some(store), Some(rx)) => Some(tokio::spawn(run_store_writer(store, rx))),
            _ => None,
        };

        info!(loops = loops.len(), writer = writer.is_some(), "dialog tracker started");

        TrackerTasks {
            tracker: self.clone(),
            shutdown_tx,
            loops,
            writer,
        }
    }
}

fn spawn_loop<F>(name: &'static str, period: Duration, mut shutdown: watch::Receiver<bool>, mut run: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => run(),
                _ = shutdown.changed() => break,
            }
        }
        debug!(task = name, "dialog tracker loop stopped");
    })
}
