//! # Controller
//!
//! Core controller modules for the sidecar terminator.
//!
//! - `snapshot`: Decision-relevant view of a pod
//! - `ownership`: Registry of workload-owning controllers
//! - `completion`: Whether a pod's primary containers have finished
//! - `dispatcher`: Pod notifications to termination jobs
//! - `termination`: Stopping sidecars by exec or ephemeral container
//! - `worker`: Sharded queue and termination worker pool
//! - `terminator`: One leadership term of the controller

pub mod completion;
pub mod dispatcher;
pub mod ownership;
pub mod snapshot;
pub mod termination;
pub mod terminator;
pub mod worker;
