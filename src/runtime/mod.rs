//! # Runtime
//!
//! Process-level machinery around the controller.
//!
//! - `initialization`: rustls, tracing, metrics, HTTP server and client setup
//! - `leader`: Leadership Coordinator
//! - `lock`: Lease and ConfigMap lock backends
//! - `fanout`: Per-namespace watch sessions
//! - `lifetime`: Cancellation scopes

pub mod fanout;
pub mod initialization;
pub mod leader;
pub mod lifetime;
pub mod lock;
