//! Host metric sources and the rolling sample window

use std::collections::VecDeque;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Samples considered when computing a trend
pub const TREND_SPAN: usize = 5;

/// One host-wide reading, in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub cpu: f32,
    pub memory: f32,
}

/// Source of host metrics
pub trait MetricsSource: Send + Sync {
    /// Aggregate CPU and memory utilization right now
    fn sample(&self) -> ResourceSample;

    /// Logical core count
    fn cpu_count(&self) -> usize;

    /// Memory available for new allocations, in bytes
    fn available_memory(&self) -> u64;

    /// Resident memory of this process, in bytes, when the source can tell
    fn process_memory(&self) -> Option<u64> {
        None
    }
}

/// [`MetricsSource`] backed by `sysinfo`
#[derive(Debug)]
pub struct SysinfoSource {
    system: Mutex<System>,
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one
        system.refresh_cpu_all();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl MetricsSource for SysinfoSource {
    fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let memory = if total == 0 {
            0.0
        } else {
            system.used_memory() as f32 / total as f32 * 100.0
        };

        ResourceSample {
            cpu: system.global_cpu_usage(),
            memory,
        }
    }

    fn cpu_count(&self) -> usize {
        let system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.cpus().len().max(1)
    }

    fn available_memory(&self) -> u64 {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        system.available_memory()
    }

    fn process_memory(&self) -> Option<u64> {
        let pid = Pid::from_u32(std::process::id());
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory())
    }
}

/// Bounded window of the most recent samples
#[derive(Debug, Clone)]
pub struct SampleRing {
    samples: VecDeque<ResourceSample>,
    capacity: usize,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, evicting the oldest when full
    pub fn push(&mut self, sample: ResourceSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        self.samples.back().copied()
    }

    /// Latest minus the oldest of the last [`TREND_SPAN`] samples
    ///
    /// Positive means rising. Zero with fewer than two samples.
    pub fn trend(&self) -> (f32, f32) {
        if self.samples.len() < 2 {
            return (0.0, 0.0);
        }
        let start = self.samples.len().saturating_sub(TREND_SPAN);
        let (first, last) = (self.samples[start], self.samples[self.samples.len() - 1]);
        (last.cpu - first.cpu, last.memory - first.memory)
    }
}
