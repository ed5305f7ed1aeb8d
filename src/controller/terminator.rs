//! # Sidecar Terminator
//!
//! Entry point of one leadership term.
//!
//! [`SidecarTerminator::new`] validates the configuration and parses the
//! sidecar list once, before anything talks to the cluster. Each call to
//! [`SidecarTerminator::run`] then builds a fresh event handler, work queue and
//! worker pool, starts the namespace watches, and keeps them running until the
//! term's lifetime is cancelled.

use crate::config::{ControllerConfig, SidecarSpec};
use crate::controller::dispatcher::PodEventHandler;
use crate::controller::ownership::OwnershipRegistry;
use crate::controller::termination::{KubeBackend, TerminationBackend, TerminationEngine};
use crate::controller::worker::{spawn_workers, work_queue};
use crate::error::{ConfigError, StartupError};
use crate::runtime::fanout::{FanOut, FanOutOptions};
use crate::runtime::lifetime::Lifetime;
use futures::Stream;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube_runtime::watcher;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct SidecarTerminator {
    config: ControllerConfig,
    sidecars: Arc<SidecarSpec>,
    ownership: OwnershipRegistry,
}

impl SidecarTerminator {
    /// Validate `config` and prepare a terminator.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`]: a malformed or duplicate sidecar entry, a signal
    /// out of range, or a zero worker count, queue size or timeout.
    pub fn new(config: ControllerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let sidecars = Arc::new(SidecarSpec::parse(&config.sidecars)?);
        Ok(Self {
            config,
            sidecars,
            ownership: OwnershipRegistry::default(),
        })
    }

    /// Replace the default Job / Workflow ownership registry
    #[must_use]
    pub fn with_ownership(mut self, ownership: OwnershipRegistry) -> Self {
        self.ownership = ownership;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    #[must_use]
    pub fn sidecars(&self) -> &SidecarSpec {
        &self.sidecars
    }

    fn fan_out_options(&self) -> FanOutOptions {
        FanOutOptions {
            cache_sync_timeout: self.config.cache_sync_timeout(),
            resync_interval: self.config.resync_interval(),
        }
    }

    /// Run one leadership term against the cluster until `lifetime` is cancelled.
    ///
    /// # Errors
    ///
    /// [`StartupError`] when a watch session fails to sync.
    pub async fn run(&self, client: Client, lifetime: Lifetime) -> Result<(), StartupError> {
        let backend = KubeBackend::new(client.clone(), self.config.remote_call_timeout());
        let scopes = self.config.watch_scopes();
        let options = self.fan_out_options();

        self.serve(backend, lifetime, |handler, scope| async move {
            FanOut::start(&client, &scopes, handler, options, &scope).await
        })
        .await
    }

    /// Like [`SidecarTerminator::run`] but fed from the given pod event streams
    /// and acting through `backend`.
    ///
    /// # Errors
    ///
    /// [`StartupError`] when a stream fails to sync.
    pub async fn run_with<B, I, S>(
        &self,
        backend: B,
        streams: I,
        lifetime: Lifetime,
    ) -> Result<(), StartupError>
    where
        B: TerminationBackend + 'static,
        I: IntoIterator<Item = (String, S)>,
        S: Stream<Item = Result<watcher::Event<Pod>, watcher::Error>> + Send + 'static,
    {
        let options = self.fan_out_options();
        self.serve(backend, lifetime, |handler, scope| async move {
            FanOut::from_streams(streams, handler, options, &scope).await
        })
        .await
    }

    async fn serve<B, W, Fut>(
        &self,
        backend: B,
        lifetime: Lifetime,
        start_watches: W,
    ) -> Result<(), StartupError>
    where
        B: TerminationBackend + 'static,
        W: FnOnce(Arc<PodEventHandler>, Lifetime) -> Fut,
        Fut: Future<Output = Result<FanOut, StartupError>>,
    {
        let scope = lifetime.child();
        let engine = Arc::new(TerminationEngine::new(
            backend,
            Arc::clone(&self.sidecars),
            self.config.strategy,
            self.config.ephemeral_image.clone(),
        ));

        let (queue, receivers) = work_queue(self.config.workers, self.config.queue_capacity);
        let mut workers = spawn_workers(receivers, engine, &scope);
        let handler = Arc::new(PodEventHandler::new(
            Arc::clone(&self.sidecars),
            self.ownership.clone(),
            queue,
        ));

        let fan_out = match start_watches(handler, scope.clone()).await {
            Ok(fan_out) => fan_out,
            Err(e) => {
                scope.cancel();
                while workers.join_next().await.is_some() {}
                if lifetime.is_cancelled() {
                    info!("Leadership term cancelled during startup");
                    return Ok(());
                }
                return Err(e);
            }
        };

        info!(
            sidecars = self.sidecars.len(),
            strategy = self.config.strategy.as_str(),
            workers = self.config.workers,
            "Sidecar terminator started"
        );

        lifetime.cancelled().await;

        fan_out.stop().await;
        scope.cancel();
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Termination worker failed");
            }
        }
        info!("Sidecar terminator stopped");
        Ok(())
    }
}
