//! # Constants
//!
//! Shared constants used throughout the controller.
//!
//! Leadership timings are fixed operational values and are not
//! exposed as flags. Everything else is a default that `ControllerConfig`
//! can override.

/// How long a leadership record stays valid without being renewed
pub const LEASE_DURATION_SECS: u64 = 15;

/// How long the active leader keeps retrying renewals before stepping down
pub const RENEW_DEADLINE_SECS: u64 = 10;

/// Interval between acquire and renew attempts
pub const RETRY_PERIOD_SECS: u64 = 2;

/// Annotation holding the leader record when the ConfigMap lock is used
pub const CONFIGMAP_LEADER_ANNOTATION: &str = "control-plane.alpha.kubernetes.io/leader";

/// Prefix of the ephemeral container injected to terminate a sidecar.
/// The full name is `<prefix>-<sidecar>` and doubles as the idempotency marker.
pub const TERMINATOR_CONTAINER_PREFIX: &str = "sidecar-terminator";

/// Signal sent when a sidecar entry does not name one (SIGTERM)
pub const DEFAULT_SIGNAL: u8 = 15;

/// Highest signal number accepted in a sidecar entry (SIGRTMAX on Linux)
pub const MAX_SIGNAL: u8 = 64;

/// Sidecar list used when none is configured
pub const DEFAULT_SIDECARS: &str = "istio-proxy";

/// Default name and namespace of the leadership lock object
pub const DEFAULT_LOCK_NAME: &str = "sidecar-terminator";
pub const DEFAULT_LOCK_NAMESPACE: &str = "kube-system";

/// Default image for injected termination containers
pub const DEFAULT_EPHEMERAL_IMAGE: &str = "busybox:stable";

/// Default number of termination workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default per-worker queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default bound on a single exec or ephemeral-container call (seconds)
pub const DEFAULT_REMOTE_CALL_TIMEOUT_SECS: u64 = 30;

/// Default bound on the initial cache sync of each watch session (seconds)
pub const DEFAULT_CACHE_SYNC_TIMEOUT_SECS: u64 = 120;

/// Default interval for re-dispatching every cached pod (seconds)
pub const DEFAULT_RESYNC_INTERVAL_SECS: u64 = 600;

/// Default HTTP server port for metrics and health checks
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default HTTP server startup timeout (how long to wait for server to be ready)
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;
