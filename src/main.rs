//! # Sidecar Terminator
//!
//! Terminates sidecar containers of Job and Argo Workflow pods once every
//! primary container has finished.
//!
//! ## Usage
//!
//! ```bash
//! sidecar-terminator --sidecars istio-proxy,cloud-sql-proxy=2 --namespaces batch
//! ```
//!
//! All flags are listed by `sidecar-terminator --help`.

use anyhow::{Context, Result};
use clap::Parser;
use sidecar_terminator::cli::Cli;
use sidecar_terminator::runtime::initialization::initialize;
use sidecar_terminator::runtime::leader::LeaderElector;
use sidecar_terminator::runtime::lifetime::{cancel_on_shutdown_signal, Lifetime};
use sidecar_terminator::runtime::lock::lock_for;
use sidecar_terminator::SidecarTerminator;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config();

    // Reject bad sidecar entries before touching the cluster
    let terminator =
        Arc::new(SidecarTerminator::new(config).context("Invalid sidecar terminator configuration")?);

    let lifetime = Lifetime::new();
    let init = initialize(terminator.config(), &lifetime).await?;
    cancel_on_shutdown_signal(&lifetime).context("Failed to install signal handlers")?;

    let lock_config = &terminator.config().lock;
    let elector = LeaderElector::new(
        lock_for(init.client.clone(), lock_config),
        lock_config.identity.clone(),
    );

    let client = init.client.clone();
    let result = elector
        .run(&lifetime, |term| {
            let terminator = Arc::clone(&terminator);
            let client = client.clone();
            async move { terminator.run(client, term).await }
        })
        .await;

    init.server_state.is_ready.store(false, Ordering::Relaxed);
    lifetime.cancel();
    let _ = init.server_handle.await;

    result.context("Sidecar terminator failed")?;
    info!("Sidecar terminator stopped");
    Ok(())
}
