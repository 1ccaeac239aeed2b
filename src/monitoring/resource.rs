//! Resource Usage Monitoring
//!
//! Samples CPU and memory of the running process together with the job
//! processes it spawned, for the run statistics.

use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// When this sample was taken
    pub timestamp: Instant,
    /// CPU usage percentage summed over the process tree (0-100 per core)
    pub cpu_usage: f32,
    /// Memory usage in megabytes
    pub memory_mb: u64,
}

/// Aggregate of all samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSummary {
    #[serde(rename = "average-cpu")]
    pub average_cpu: f32,
    #[serde(rename = "peak-memory-mb")]
    pub peak_memory_mb: u64,
    pub samples: usize,
}

/// Monitors the current process and its direct children.
///
/// # Example
///
/// ```rust,ignore
/// use rulerunner::monitoring::ResourceMonitor;
/// use std::time::Duration;
/// use std::thread;
///
/// let mut monitor = ResourceMonitor::new();
/// for _ in 0..5 {
///     monitor.sample();
///     thread::sleep(Duration::from_millis(500));
/// }
/// println!("{}", monitor.get_summary());
/// ```
pub struct ResourceMonitor {
    system: System,
    process_id: Option<Pid>,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            process_id: get_current_pid().ok(),
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a resource usage sample.
    ///
    /// The first call performs CPU warmup (required for accurate readings).
    /// Subsequent calls are rate-limited by `min_interval`.
    pub fn sample(&mut self) {
        let Some(pid) = self.process_id else {
            return;
        };
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        let mut cpu = 0.0;
        let mut memory = 0;
        let mut found = false;
        for (id, process) in self.system.processes() {
            if *id == pid || process.parent() == Some(pid) {
                cpu += process.cpu_usage();
                memory += process.memory();
                found = true;
            }
        }
        if found {
            self.samples.push(ResourceSample {
                timestamp: now,
                cpu_usage: cpu,
                memory_mb: memory / (1024 * 1024),
            });
        }
    }

    pub fn summary(&self) -> ResourceSummary {
        ResourceSummary {
            average_cpu: self.average_cpu(),
            peak_memory_mb: self.peak_memory_mb(),
            samples: self.samples.len(),
        }
    }

    /// Returns a human-readable summary of resource usage.
    pub fn get_summary(&self) -> String {
        if self.samples.is_empty() {
            return "No resource data collected".to_string();
        }

        let min_memory = self.samples.iter().map(|s| s.memory_mb).min().unwrap_or(0);
        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak Memory: {} MB\n  Min Memory: {} MB\n  Samples: {}",
            self.average_cpu(),
            self.peak_memory_mb(),
            min_memory,
            self.samples.len()
        )
    }

    pub fn get_samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    /// Returns the peak memory usage in MB.
    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
