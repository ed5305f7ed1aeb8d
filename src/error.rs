//! # Errors
//!
//! Error taxonomy for the controller.
//!
//! - [`ConfigError`] and [`StartupError`] are fatal: the run aborts and leadership
//!   is released.
//! - [`TerminationError`] is never fatal. It is logged, counted, and the next
//!   reconciliation of the same pod retries naturally.
//! - [`LeaderElectionError`] surfaces lock API failures to the coordinator, which
//!   retries them, and carries a [`StartupError`] out of a failed leadership term.

use kube::client::UpgradeConnectionError;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration detected while constructing the controller
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("incorrect sidecar container name format: {0}")]
    MalformedSidecar(String),

    #[error("sidecar entry {0:?} has an empty container name")]
    EmptySidecarName(String),

    #[error("invalid signal {value:?} for sidecar {sidecar}: expected a number between 1 and {max}")]
    InvalidSignal {
        sidecar: String,
        value: String,
        max: u8,
    },

    #[error("sidecar {0} is configured more than once")]
    DuplicateSidecar(String),

    #[error("at least one sidecar container name is required")]
    NoSidecars,

    #[error("{setting} must be greater than zero")]
    ZeroSetting { setting: &'static str },
}

/// Fatal error raised while a leadership term is starting up
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("timed out after {timeout:?} waiting for the pod cache of {scope} to sync")]
    CacheSyncTimeout { scope: String, timeout: Duration },

    #[error("pod watch for {scope} stopped before its cache synced")]
    WatchClosed { scope: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Non-fatal failure of a single termination action
#[derive(Debug, Error)]
pub enum TerminationError {
    #[error("pod {pod} not found")]
    NotFound { pod: String },

    #[error("remote execution in {pod}/{container} failed: {message}")]
    RemoteExecution {
        pod: String,
        container: String,
        message: String,
    },

    #[error("{operation} on {pod} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        pod: String,
        timeout: Duration,
    },

    #[error(
        "pod {pod} shares its process namespace; signalling process 1 from an ephemeral \
         container would reach every container in the pod, not only {sidecar}"
    )]
    SharedProcessNamespace { pod: String, sidecar: String },

    #[error("kubernetes API call for {pod} failed: {source}")]
    Api {
        pod: String,
        #[source]
        source: kube::Error,
    },
}

impl TerminationError {
    /// Map a kube client error for `pod` into the taxonomy, separating 404s.
    #[must_use]
    pub fn from_kube(pod: &str, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound {
                pod: pod.to_string(),
            },
            // exec reports the API server's answer as a failed protocol upgrade
            kube::Error::UpgradeConnection(UpgradeConnectionError::ProtocolSwitch(status))
                if status.as_u16() == 404 =>
            {
                Self::NotFound {
                    pod: pod.to_string(),
                }
            }
            source => Self::Api {
                pod: pod.to_string(),
                source,
            },
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Failure inside the leadership coordinator
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("lock {lock} API call failed: {source}")]
    Lock {
        lock: String,
        #[source]
        source: kube::Error,
    },

    #[error("lock {lock} was modified concurrently")]
    Conflict { lock: String },

    #[error("lock {lock} holds an undecodable leader record: {source}")]
    Record {
        lock: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("leadership term ended with a startup failure: {0}")]
    Term(#[from] StartupError),

    #[error("leadership term task failed: {0}")]
    TermAborted(String),
}

impl LeaderElectionError {
    /// Map a kube client error for `lock`, separating 409 Conflict / AlreadyExists
    #[must_use]
    pub fn from_kube(lock: String, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) if response.code == 409 => Self::Conflict { lock },
            source => Self::Lock { lock, source },
        }
    }

    /// True when a write lost against a concurrent writer
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
