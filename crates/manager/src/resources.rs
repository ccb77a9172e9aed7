//! Process resource sampling

use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::debug;

/// Point-in-time resource usage of the current process
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// Virtual memory in bytes
    pub virtual_memory_bytes: u64,
    /// OS threads, when the platform reports them
    pub thread_count: Option<usize>,
    /// CPU usage in percent since the previous sample
    pub cpu_usage: f32,
    /// Process uptime
    pub run_time: Duration,
    /// Tokio worker threads, when sampled inside a runtime
    pub runtime_workers: Option<usize>,
    /// Live tokio tasks, when sampled inside a runtime
    pub alive_tasks: Option<usize>,
    /// When the sample was taken
    pub sampled_at: Option<SystemTime>,
}

/// Samples the resource usage of the current process
///
/// CPU usage is computed between consecutive samples, so the first sample
/// always reports zero.
pub struct ResourceSampler {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ResourceSampler {
    /// Create a sampler for the current process
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .inspect_err(|e| debug!("Process sampling unavailable: {}", e))
            .ok();

        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }

    /// Take a sample; fields the platform cannot provide are left empty
    pub fn sample(&self) -> ResourceUsage {
        let mut usage = ResourceUsage {
            sampled_at: Some(SystemTime::now()),
            ..ResourceUsage::default()
        };

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let metrics = handle.metrics();
            usage.runtime_workers = Some(metrics.num_workers());
            usage.alive_tasks = Some(metrics.num_alive_tasks());
        }

        let Some(pid) = self.pid else {
            return usage;
        };

        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        if let Some(process) = system.process(pid) {
            usage.memory_bytes = process.memory();
            usage.virtual_memory_bytes = process.virtual_memory();
            usage.cpu_usage = process.cpu_usage();
            usage.run_time = Duration::from_secs(process.run_time());
            usage.thread_count = process.tasks().map(std::collections::HashSet::len);
        }

        usage
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sample_reports_runtime_metrics() {
        let usage = ResourceSampler::new().sample();

        assert_eq!(usage.runtime_workers, Some(2));
        assert!(usage.alive_tasks.is_some());
        assert!(usage.sampled_at.is_some());
    }

    #[test]
    fn test_sample_outside_runtime() {
        let usage = ResourceSampler::new().sample();

        assert_eq!(usage.runtime_workers, None);
        assert_eq!(usage.alive_tasks, None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_reports_memory_on_linux() {
        let usage = ResourceSampler::new().sample();
        assert!(usage.memory_bytes > 0);
    }
}
