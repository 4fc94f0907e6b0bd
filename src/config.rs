use std::path::PathBuf;
use std::time::Duration;

/// How worker units are isolated from the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Isolation {
    /// Each worker is a child process of the current executable.
    Process,
    /// Each worker is a tokio task inside the coordinator process.
    Task,
}

/// Process-wide tunables, fixed before a scan starts.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Number of worker units.
    pub workers: usize,
    /// Max in-flight probes per worker.
    pub concurrency: usize,
    /// Per-probe watchdog.
    pub connect_timeout: Duration,
    /// Delay before retrying a drain when the pending queue is not empty.
    pub drain_interval: Duration,
    pub services_path: PathBuf,
    pub isolation: Isolation,
}

impl ScanConfig {
    pub const DEFAULT_CONCURRENCY: usize = 100;
    pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
    pub const DEFAULT_DRAIN_INTERVAL_MS: u64 = 2000;
    pub const DEFAULT_SERVICES_PATH: &'static str = "/etc/services";
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            concurrency: Self::DEFAULT_CONCURRENCY,
            connect_timeout: Duration::from_millis(Self::DEFAULT_TIMEOUT_MS),
            drain_interval: Duration::from_millis(Self::DEFAULT_DRAIN_INTERVAL_MS),
            services_path: PathBuf::from(Self::DEFAULT_SERVICES_PATH),
            isolation: Isolation::Process,
        }
    }
}

/// Subset of `ScanConfig` that a single worker needs.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTunables {
    pub concurrency: usize,
    pub connect_timeout: Duration,
    pub drain_interval: Duration,
}

impl From<&ScanConfig> for WorkerTunables {
    fn from(cfg: &ScanConfig) -> Self {
        Self {
            concurrency: cfg.concurrency.max(1),
            connect_timeout: cfg.connect_timeout,
            drain_interval: cfg.drain_interval,
        }
    }
}

impl Default for WorkerTunables {
    fn default() -> Self {
        WorkerTunables::from(&ScanConfig::default())
    }
}
