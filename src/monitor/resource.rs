//! Owned resource monitor with an explicit start/stop lifecycle
//!
//! The monitor samples the host on a fixed interval into a bounded ring,
//! feeds the session stats, and sends a warning when CPU or memory crosses
//! the high-water mark. Readers get the latest reading plus its trend.

use crate::config::MonitorConfig;
use crate::monitor::{MetricsSource, ResourceSample, SampleRing};
use crate::output::{Notifier, NotifyLevel, StatsCollector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;

/// Latest utilization with its trend, all in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceMetrics {
    pub cpu: f32,
    pub memory: f32,
    pub cpu_trend: f32,
    pub memory_trend: f32,
}

impl ResourceMetrics {
    pub fn new(cpu: f32, memory: f32) -> Self {
        Self {
            cpu,
            memory,
            cpu_trend: 0.0,
            memory_trend: 0.0,
        }
    }

    /// CPU or memory above `mark`
    pub fn exceeds(&self, mark: f32) -> bool {
        self.cpu > mark || self.memory > mark
    }

    /// CPU and memory both below `mark`
    pub fn below(&self, mark: f32) -> bool {
        self.cpu < mark && self.memory < mark
    }
}

/// Static session ceiling: `min(2 x cores, available / per_request, cap)`
///
/// Never below 1.
pub fn suggested_concurrency(
    cpu_count: usize,
    available_memory: u64,
    memory_per_request_mb: u64,
    cap: usize,
) -> usize {
    let cpu_based = cpu_count.saturating_mul(2);
    let per_request = memory_per_request_mb.max(1) * MIB;
    let memory_based = usize::try_from(available_memory / per_request).unwrap_or(usize::MAX);
    cpu_based.min(memory_based).min(cap).max(1)
}

struct Sampling {
    source: Arc<dyn MetricsSource>,
    ring: Mutex<SampleRing>,
    high_water: f32,
    notifier: Arc<dyn Notifier>,
    stats: Arc<StatsCollector>,
    breached: AtomicBool,
}

impl Sampling {
    async fn tick(&self) -> ResourceSample {
        let sample = self.source.sample();
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sample);
        self.stats.record_resources(sample.cpu, sample.memory);

        let metrics = ResourceMetrics::new(sample.cpu, sample.memory);
        let over = metrics.exceeds(self.high_water);
        let was_over = self.breached.swap(over, Ordering::SeqCst);

        if over && !was_over {
            let mut warnings = Vec::new();
            if sample.cpu > self.high_water {
                warnings.push(format!("High CPU usage: {:.2}%", sample.cpu));
            }
            if sample.memory > self.high_water {
                warnings.push(format!("High memory usage: {:.2}%", sample.memory));
            }
            tracing::warn!(cpu = sample.cpu, memory = sample.memory, "Resource threshold exceeded");
            self.notifier
                .notify(
                    &format!("Resource warning:\n{}", warnings.join("\n")),
                    NotifyLevel::Warning,
                )
                .await;
        } else if !over && was_over {
            tracing::info!(cpu = sample.cpu, memory = sample.memory, "Resource usage back under threshold");
        }

        sample
    }
}

/// Periodic host sampler shared by the scheduler and driver
pub struct ResourceMonitor {
    inner: Arc<Sampling>,
    config: MonitorConfig,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ResourceMonitor {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        config: MonitorConfig,
        notifier: Arc<dyn Notifier>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            inner: Arc::new(Sampling {
                source,
                ring: Mutex::new(SampleRing::new(config.capacity())),
                high_water: config.high_water,
                notifier,
                stats,
                breached: AtomicBool::new(false),
            }),
            config,
            task: Mutex::new(None),
        }
    }

    /// Starts the sampling task; a second call is a no-op
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let period = self.config.sample_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.tick().await;
                    }
                }
            }
            tracing::debug!("Resource sampling stopped");
        });

        tracing::debug!("Resource sampling every {:?}", period);
        *task = Some((cancel, handle));
    }

    /// Stops the sampling task and waits for it to exit
    pub async fn stop(&self) {
        let running = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((cancel, handle)) = running {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!("Resource sampling task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    /// Takes one sample immediately, as the background task would
    pub async fn sample_now(&self) -> ResourceSample {
        self.inner.tick().await
    }

    /// Latest reading with trends over the sampled window
    ///
    /// Falls back to a direct reading when nothing was sampled yet.
    pub fn current_metrics(&self) -> ResourceMetrics {
        let ring = self.inner.ring.lock().unwrap_or_else(|e| e.into_inner());
        let latest = ring
            .latest()
            .unwrap_or_else(|| self.inner.source.sample());
        let (cpu_trend, memory_trend) = ring.trend();

        ResourceMetrics {
            cpu: latest.cpu,
            memory: latest.memory,
            cpu_trend,
            memory_trend,
        }
    }

    /// Logs this process's resident memory at a phase boundary
    ///
    /// Above `process-memory-warn-mb` the reading is also sent as a warning.
    /// Returns the reading in bytes, if the source has one.
    pub async fn check_process_memory(&self, context: &str) -> Option<u64> {
        let rss = self.inner.source.process_memory()?;
        let rss_mb = rss as f64 / MIB as f64;
        let limit = self.config.process_memory_warn_mb;

        if rss > limit.saturating_mul(MIB) {
            tracing::warn!(context, rss_mb, limit_mb = limit, "High process memory");
            self.inner
                .notifier
                .notify(
                    &format!(
                        "High memory usage at {}: {:.2} MB resident (limit {} MB)",
                        context, rss_mb, limit
                    ),
                    NotifyLevel::Warning,
                )
                .await;
        } else {
            tracing::info!(context, rss_mb, "Process memory");
        }
        Some(rss)
    }

    /// Session concurrency ceiling from core count and free memory
    pub fn suggested_concurrency(&self, memory_per_request_mb: u64, cap: usize) -> usize {
        suggested_concurrency(
            self.inner.source.cpu_count(),
            self.inner.source.available_memory(),
            memory_per_request_mb,
            cap,
        )
    }
}
