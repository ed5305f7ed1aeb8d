//! # CLI
//!
//! Command-line flags of the `sidecar-terminator` binary. Every flag can also
//! be set through the environment variable named next to it.
//!
//! ```bash
//! sidecar-terminator --sidecars istio-proxy=9,cloud-sql-proxy --namespaces batch,argo
//! ```

use crate::config::{
    generate_identity, ControllerConfig, LockConfig, LockKind, LogFormat, TerminationStrategy,
};
use crate::constants::{
    DEFAULT_CACHE_SYNC_TIMEOUT_SECS, DEFAULT_EPHEMERAL_IMAGE, DEFAULT_LOCK_NAME,
    DEFAULT_LOCK_NAMESPACE, DEFAULT_METRICS_PORT, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_REMOTE_CALL_TIMEOUT_SECS, DEFAULT_RESYNC_INTERVAL_SECS, DEFAULT_SIDECARS,
    DEFAULT_WORKERS,
};
use clap::Parser;

/// Stops sidecar containers of Job and Workflow pods once their main containers finish
#[derive(Debug, Parser)]
#[command(name = "sidecar-terminator", version, long_about = None)]
pub struct Cli {
    /// Sidecar containers to terminate, as `name` or `name=signal`
    #[arg(long, env = "SIDECARS", value_delimiter = ',', default_value = DEFAULT_SIDECARS)]
    pub sidecars: Vec<String>,

    /// Namespaces to watch (all namespaces when empty)
    #[arg(long, env = "NAMESPACES", value_delimiter = ',')]
    pub namespaces: Vec<String>,

    /// Name of the leadership lock object
    #[arg(long, env = "LOCK_NAME", default_value = DEFAULT_LOCK_NAME)]
    pub lock_name: String,

    /// Namespace of the leadership lock object
    #[arg(long, env = "LOCK_NAMESPACE", default_value = DEFAULT_LOCK_NAMESPACE)]
    pub lock_namespace: String,

    /// Use a ConfigMap instead of a Lease as the leadership lock
    #[arg(long, env = "LOCK_USE_CONFIG_MAP")]
    pub lock_use_config_map: bool,

    /// Identity of this candidate (defaults to `<hostname>_<uuid>`)
    #[arg(long, env = "LOCK_IDENTITY")]
    pub lock_identity: Option<String>,

    /// How running sidecars are stopped
    #[arg(long, env = "TERMINATION_STRATEGY", value_enum, default_value_t = TerminationStrategy::Exec)]
    pub termination_strategy: TerminationStrategy,

    /// Image of the injected termination container (ephemeral strategy)
    #[arg(long, env = "EPHEMERAL_IMAGE", default_value = DEFAULT_EPHEMERAL_IMAGE)]
    pub ephemeral_image: String,

    /// Number of termination workers
    #[arg(long, env = "WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Pending terminations buffered per worker
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Timeout of a single exec or ephemeral-container call
    #[arg(long, env = "REMOTE_CALL_TIMEOUT_SECS", default_value_t = DEFAULT_REMOTE_CALL_TIMEOUT_SECS)]
    pub remote_call_timeout_secs: u64,

    /// Timeout of the initial pod cache sync per namespace
    #[arg(long, env = "CACHE_SYNC_TIMEOUT_SECS", default_value_t = DEFAULT_CACHE_SYNC_TIMEOUT_SECS)]
    pub cache_sync_timeout_secs: u64,

    /// Re-evaluate every cached pod at this interval (0 disables)
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = DEFAULT_RESYNC_INTERVAL_SECS)]
    pub resync_interval_secs: u64,

    /// Port of the metrics and health check server
    #[arg(long, env = "METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    #[must_use]
    pub fn into_config(self) -> ControllerConfig {
        ControllerConfig {
            sidecars: self.sidecars,
            namespaces: self.namespaces,
            lock: LockConfig {
                name: self.lock_name,
                namespace: self.lock_namespace,
                kind: if self.lock_use_config_map {
                    LockKind::ConfigMap
                } else {
                    LockKind::Lease
                },
                identity: self
                    .lock_identity
                    .filter(|identity| !identity.is_empty())
                    .unwrap_or_else(generate_identity),
            },
            strategy: self.termination_strategy,
            ephemeral_image: self.ephemeral_image,
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            remote_call_timeout_secs: self.remote_call_timeout_secs,
            cache_sync_timeout_secs: self.cache_sync_timeout_secs,
            resync_interval_secs: self.resync_interval_secs,
            metrics_port: self.metrics_port,
            log_format: self.log_format,
        }
    }
}
