//! Client configuration.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_PAYLOAD_LEN;
use crate::bridge::transport::PipePaths;
use crate::lifecycle::{WorkerSpawner, WrapperSpawner};

pub const DEFAULT_WORKER_EXECUTABLE: &str = "/usr/libexec/apt-worker";
/// Present only inside the build sandbox, where sudo is unavailable.
pub const DEFAULT_SANDBOX_MARKER: &str = "/targets/links/scratchbox.config";
pub const DEFAULT_PRIVILEGED_WRAPPER: &str = "/usr/bin/sudo";
pub const DEFAULT_SANDBOX_WRAPPER: &str = "/usr/bin/fakeroot";
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_millis(3000);

pub const ENV_PIPE_DIR: &str = "APT_WORKER_PIPE_DIR";
pub const ENV_BREAK_LOCKS: &str = "APT_WORKER_BREAK_LOCKS";
pub const ENV_START_TIMEOUT_MS: &str = "APT_WORKER_START_TIMEOUT_MS";

#[derive(Clone)]
pub struct ClientConfig {
    pub worker_executable: PathBuf,
    pub pipes: PipePaths,
    /// Ask the worker to break stale dpkg/apt locks.
    pub break_locks: bool,
    pub sandbox_marker: PathBuf,
    pub privileged_wrapper: PathBuf,
    pub sandbox_wrapper: PathBuf,
    /// Delay between handshake attempts (also the tick period).
    pub retry_interval: Duration,
    /// Total handshake wait before startup fails.
    pub start_timeout: Duration,
    pub max_payload_len: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_EXECUTABLE)
    }
}

impl ClientConfig {
    pub fn new(worker_executable: impl Into<PathBuf>) -> Self {
        Self {
            worker_executable: worker_executable.into(),
            pipes: PipePaths::default(),
            break_locks: false,
            sandbox_marker: PathBuf::from(DEFAULT_SANDBOX_MARKER),
            privileged_wrapper: PathBuf::from(DEFAULT_PRIVILEGED_WRAPPER),
            sandbox_wrapper: PathBuf::from(DEFAULT_SANDBOX_WRAPPER),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            start_timeout: DEFAULT_START_TIMEOUT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            spawner: Arc::new(WrapperSpawner),
        }
    }

    /// Defaults overlaid with `APT_WORKER_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env(worker_executable: impl Into<PathBuf>) -> Self {
        Self::from_lookup(worker_executable, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        worker_executable: impl Into<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let mut config = Self::new(worker_executable);

        if let Some(dir) = lookup(ENV_PIPE_DIR).filter(|dir| !dir.is_empty()) {
            config.pipes = PipePaths::in_dir(dir);
        }

        if let Some(value) = lookup(ENV_BREAK_LOCKS) {
            config.break_locks = matches!(value.as_str(), "1" | "true" | "yes");
        }

        if let Some(value) = lookup(ENV_START_TIMEOUT_MS) {
            match value.parse::<u64>() {
                Ok(ms) => config.start_timeout = Duration::from_millis(ms),
                Err(e) => {
                    tracing::warn!(%value, error = %e, "Ignoring invalid {}", ENV_START_TIMEOUT_MS)
                }
            }
        }

        config
    }

    pub fn with_pipes(mut self, pipes: PipePaths) -> Self {
        self.pipes = pipes;
        self
    }

    pub fn with_break_locks(mut self, break_locks: bool) -> Self {
        self.break_locks = break_locks;
        self
    }

    pub fn with_sandbox_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.sandbox_marker = marker.into();
        self
    }

    pub fn with_privileged_wrapper(mut self, wrapper: impl Into<PathBuf>) -> Self {
        self.privileged_wrapper = wrapper.into();
        self
    }

    pub fn with_sandbox_wrapper(mut self, wrapper: impl Into<PathBuf>) -> Self {
        self.sandbox_wrapper = wrapper.into();
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_max_payload_len(mut self, max: usize) -> Self {
        self.max_payload_len = max;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("worker_executable", &self.worker_executable)
            .field("pipes", &self.pipes)
            .field("break_locks", &self.break_locks)
            .field("sandbox_marker", &self.sandbox_marker)
            .field("privileged_wrapper", &self.privileged_wrapper)
            .field("sandbox_wrapper", &self.sandbox_wrapper)
            .field("retry_interval", &self.retry_interval)
            .field("start_timeout", &self.start_timeout)
            .field("max_payload_len", &self.max_payload_len)
            .finish_non_exhaustive()
    }
}
