//! Periodic cycle driver
//!
//! One cycle runs the listing, detail and item passes under the run lock,
//! recording each phase in the checkpoint. The lock is released and the
//! session stats are flushed whatever the passes returned.

use crate::crawler::{pause, DetailSummary, ItemsSummary, ListingSummary, Pipeline};
use crate::driver::{save_checkpoint, LockAttempt, Phase, LivenessCheck, RunLock};
use crate::output::{format_report, NotifyLevel};
use crate::{Result, TomeError};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one full cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub listing: Option<ListingSummary>,
    pub details: Option<DetailSummary>,
    pub items: Option<ItemsSummary>,
    /// Phases that failed, with their error
    pub errors: Vec<(Phase, String)>,
    pub cancelled: bool,
}

impl CycleReport {
    pub fn duration(&self) -> Duration {
        (self.finished - self.started).to_std().unwrap_or_default()
    }
}

/// Result of work attempted under the run lock
#[derive(Debug, Clone)]
pub enum Locked<T> {
    Ran(T),
    /// Another live instance holds the run lock; nothing was started
    Contended { pid: u32, since: DateTime<Utc> },
}

pub type CycleOutcome = Locked<CycleReport>;

pub struct CycleDriver {
    pipeline: Arc<Pipeline>,
    lock: RunLock,
    cancel: CancellationToken,
}

impl CycleDriver {
    pub fn new(pipeline: Arc<Pipeline>, liveness: Arc<dyn LivenessCheck>, cancel: CancellationToken) -> Self {
        let lock = RunLock::new(
            pipeline.store().lock_path(),
            pipeline.config().driver.lock_stale_after(),
            liveness,
        );
        Self {
            pipeline,
            lock,
            cancel,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Runs `op` while holding the run lock
    ///
    /// `op` is not run at all when the lock is contended. The lock's heartbeat
    /// is refreshed while `op` runs, and the resource monitor samples the host
    /// unless it was already running. Session stats are saved after `op`
    /// finishes.
    pub async fn run_locked<T, F, Fut>(&self, label: &str, op: F) -> Result<Locked<T>>
    where
        F: FnOnce(Arc<Pipeline>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.pipeline.store().ensure_root().await?;
        let mut guard = match self.lock.try_acquire().await? {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Contended { pid, since } => {
                tracing::warn!(
                    "Run lock held by pid {} since {}, not starting {}",
                    pid,
                    since,
                    label
                );
                return Ok(Locked::Contended { pid, since });
            }
        };

        let monitor = Arc::clone(&self.pipeline.parts().monitor);
        let owns_monitor = !monitor.is_running();
        if owns_monitor {
            monitor.start();
        }

        let work = op(Arc::clone(&self.pipeline));
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval(self.lock.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let result = loop {
            tokio::select! {
                res = &mut work => break res,
                _ = heartbeat.tick() => {
                    if let Err(e) = guard.heartbeat().await {
                        tracing::warn!("Failed to refresh run lock heartbeat: {}", e);
                    }
                }
            }
        };

        if owns_monitor {
            monitor.stop().await;
        }
        if let Err(e) = guard.release().await {
            tracing::error!("Failed to release run lock after {}: {}", label, e);
        }
        self.flush_stats().await;

        result.map(Locked::Ran)
    }

    /// Runs one cycle now
    pub async fn run_cycle_once(&self) -> Result<CycleOutcome> {
        self.cycle(None).await
    }

    /// Repeats cycles every `cycle-period` until cancelled
    ///
    /// Failed cycles are logged and the loop goes on.
    pub async fn run_forever(&self) -> Result<()> {
        let period = self.pipeline.config().driver.cycle_period();
        let monitor = Arc::clone(&self.pipeline.parts().monitor);
        monitor.start();

        loop {
            if let Err(e) = self.cycle(Some(period)).await {
                tracing::error!("Cycle failed: {}", e);
                self.pipeline
                    .parts()
                    .notifier
                    .notify(&format!("Cycle failed: {}", e), NotifyLevel::Error)
                    .await;
            }

            if self.cancel.is_cancelled() {
                break;
            }
            tracing::info!("Sleeping {:?} until the next cycle", period);
            if !pause(period, &self.cancel).await {
                break;
            }
        }

        monitor.stop().await;
        tracing::info!("Cycle driver stopped");
        Ok(())
    }

    async fn cycle(&self, next_in: Option<Duration>) -> Result<CycleOutcome> {
        let outcome = self
            .run_locked("cycle", |_| async move { Ok::<_, TomeError>(self.run_phases().await) })
            .await?;
        if let Locked::Ran(report) = &outcome {
            self.announce(report, next_in).await;
        }
        Ok(outcome)
    }

    /// Runs the three passes in order with the phase cooldown between them
    async fn run_phases(&self) -> CycleReport {
        let pipeline = &self.pipeline;
        let store = pipeline.store();
        let cooldown = pipeline.config().crawler.phase_cooldown();

        let started = Utc::now();
        let mut report = CycleReport {
            started,
            finished: started,
            listing: None,
            details: None,
            items: None,
            errors: Vec::new(),
            cancelled: false,
        };
        tracing::info!("Cycle started at {}", started.to_rfc3339());
        let monitor = &pipeline.parts().monitor;
        monitor.check_process_memory("cycle_start").await;

        for phase in [Phase::Listing, Phase::Details, Phase::Items] {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(e) = save_checkpoint(store, phase, Some(started)).await {
                tracing::warn!("Failed to write checkpoint: {}", e);
            }

            let result = match phase {
                Phase::Listing => pipeline.refresh_target_list().await.map(|s| report.listing = Some(s)),
                Phase::Details => pipeline.fetch_details().await.map(|s| report.details = Some(s)),
                Phase::Items => pipeline.fetch_all_items().await.map(|s| report.items = Some(s)),
                Phase::Idle => Ok(()),
            };
            if let Err(e) = result {
                tracing::error!("{} phase failed: {}", phase, e);
                report.errors.push((phase, e.to_string()));
            }
            monitor.check_process_memory(&format!("{}_done", phase)).await;

            if phase != Phase::Items {
                tracing::debug!("Cooling down {:?} before the next phase", cooldown);
                pause(cooldown, &self.cancel).await;
            }
        }

        report.cancelled = self.cancel.is_cancelled();
        monitor.check_process_memory("cycle_end").await;
        if let Err(e) = save_checkpoint(store, Phase::Idle, None).await {
            tracing::warn!("Failed to write checkpoint: {}", e);
        }
        report.finished = Utc::now();
        report
    }

    async fn announce(&self, report: &CycleReport, next_in: Option<Duration>) {
        let next_run = next_in
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| (report.finished + d).to_rfc3339());

        tracing::info!(
            "Cycle finished in {:?} ({} phase errors{}){}",
            report.duration(),
            report.errors.len(),
            if report.cancelled { ", cancelled" } else { "" },
            next_run
                .as_deref()
                .map(|t| format!(", next run at {}", t))
                .unwrap_or_default()
        );

        let mut message = format!(
            "Cycle finished\nStarted: {}\nFinished: {}\nDuration: {}s",
            report.started.to_rfc3339(),
            report.finished.to_rfc3339(),
            report.duration().as_secs()
        );
        if let Some(next) = &next_run {
            message.push_str(&format!("\nNext run: {}", next));
        }
        for (phase, error) in &report.errors {
            message.push_str(&format!("\n{} failed: {}", phase, error));
        }
        message.push_str("\n\n");
        message.push_str(&format_report(&self.pipeline.parts().stats.snapshot()));

        let level = if report.errors.is_empty() {
            NotifyLevel::Success
        } else {
            NotifyLevel::Warning
        };
        self.pipeline.parts().notifier.notify(&message, level).await;
    }

    async fn flush_stats(&self) {
        if let Err(e) = self.pipeline.parts().stats.save(self.pipeline.store()).await {
            tracing::warn!("Failed to save session stats: {}", e);
        }
    }
}
