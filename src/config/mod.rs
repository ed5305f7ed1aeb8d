//! # Configuration
//!
//! - `controller`: controller-level settings and the leadership lock description
//! - `sidecars`: sidecar name → signal parsing

pub mod controller;
pub mod sidecars;

pub use controller::{
    generate_identity, ControllerConfig, LockConfig, LockKind, LogFormat, TerminationStrategy,
};
pub use sidecars::SidecarSpec;
