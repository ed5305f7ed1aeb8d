//! # Sidecar Terminator
//!
//! A Kubernetes controller that stops sidecar containers (service-mesh proxies,
//! database proxies and the like) once the primary containers of a batch pod
//! have finished, so Jobs and Argo Workflows can complete.
//!
//! ## Overview
//!
//! 1. **Leadership** - only the replica holding the Lease (or ConfigMap) lock runs the controller
//! 2. **Watching pods** - one watch per configured namespace, or one cluster-wide
//! 3. **Dispatch** - pods owned by a Job or Workflow are checked for completion
//! 4. **Termination** - running sidecars of completed pods are signalled, either by
//!    exec'ing `kill` in the sidecar or by injecting an ephemeral container
//!
//! Tests are included in the module files and under `tests/`.

pub mod cli;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod server;

pub use config::{ControllerConfig, SidecarSpec, TerminationStrategy};
pub use controller::terminator::SidecarTerminator;
pub use error::{ConfigError, LeaderElectionError, StartupError, TerminationError};
