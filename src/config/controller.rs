//! # Controller Configuration
//!
//! Controller-level settings. Populated by the CLI (flags or environment
//! variables) and validated when the terminator is constructed.

use crate::constants::{
    DEFAULT_CACHE_SYNC_TIMEOUT_SECS, DEFAULT_EPHEMERAL_IMAGE, DEFAULT_LOCK_NAME,
    DEFAULT_LOCK_NAMESPACE, DEFAULT_METRICS_PORT, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_REMOTE_CALL_TIMEOUT_SECS, DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_SIDECARS,
    DEFAULT_WORKERS,
};
use crate::error::ConfigError;
use std::time::Duration;

/// How a running sidecar is told to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum TerminationStrategy {
    /// Exec `kill` inside the sidecar, retrying once through a shell
    #[default]
    Exec,
    /// Inject an ephemeral container that signals the sidecar
    Ephemeral,
}

impl TerminationStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationStrategy::Exec => "exec",
            TerminationStrategy::Ephemeral => "ephemeral",
        }
    }
}

/// Backing object of the leadership lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockKind {
    #[default]
    Lease,
    ConfigMap,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Leadership lock settings, passed through to the coordinator untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub name: String,
    pub namespace: String,
    pub kind: LockKind,
    /// Unique identity of this candidate
    pub identity: String,
}

/// Controller-level configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Raw sidecar entries (`name` or `name=signal`), parsed at construction
    pub sidecars: Vec<String>,
    /// Namespaces to watch; empty watches every namespace
    pub namespaces: Vec<String>,
    pub lock: LockConfig,
    pub strategy: TerminationStrategy,
    /// Image used for injected termination containers
    pub ephemeral_image: String,
    /// Number of termination workers
    pub workers: usize,
    /// Pending terminations each worker buffers before new ones are dropped
    pub queue_capacity: usize,
    /// Bound on a single exec or ephemeral-container call
    pub remote_call_timeout_secs: u64,
    /// Bound on the initial cache sync of each watch session
    pub cache_sync_timeout_secs: u64,
    /// Interval for re-dispatching every cached pod (0 disables)
    pub resync_interval_secs: u64,
    pub metrics_port: u16,
    pub log_format: LogFormat,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sidecars: vec![DEFAULT_SIDECARS.to_string()],
            namespaces: Vec::new(),
            lock: LockConfig {
                name: DEFAULT_LOCK_NAME.to_string(),
                namespace: DEFAULT_LOCK_NAMESPACE.to_string(),
                kind: LockKind::default(),
                identity: generate_identity(),
            },
            strategy: TerminationStrategy::default(),
            ephemeral_image: DEFAULT_EPHEMERAL_IMAGE.to_string(),
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            remote_call_timeout_secs: DEFAULT_REMOTE_CALL_TIMEOUT_SECS,
            cache_sync_timeout_secs: DEFAULT_CACHE_SYNC_TIMEOUT_SECS,
            resync_interval_secs: DEFAULT_RESYNC_INTERVAL_SECS,
            metrics_port: DEFAULT_METRICS_PORT,
            log_format: LogFormat::default(),
        }
    }
}

impl ControllerConfig {
    /// Check numeric settings that must be non-zero
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroSetting`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("workers", self.workers == 0),
            ("queue-capacity", self.queue_capacity == 0),
            ("remote-call-timeout-secs", self.remote_call_timeout_secs == 0),
            ("cache-sync-timeout-secs", self.cache_sync_timeout_secs == 0),
        ];
        match checks.into_iter().find(|(_, zero)| *zero) {
            Some((setting, _)) => Err(ConfigError::ZeroSetting { setting }),
            None => Ok(()),
        }
    }

    /// Namespaces that get their own watch session; `None` means all namespaces
    pub fn watch_scopes(&self) -> Vec<Option<String>> {
        if self.namespaces.is_empty() {
            vec![None]
        } else {
            self.namespaces.iter().cloned().map(Some).collect()
        }
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_call_timeout_secs)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    /// Resync interval, `None` when resync is disabled
    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_secs > 0).then(|| Duration::from_secs(self.resync_interval_secs))
    }
}

/// Identity unique across processes, even on the same host
pub fn generate_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| DEFAULT_LOCK_NAME.to_string());
    format!("{host}_{}", uuid::Uuid::new_v4())
}
