//! # Event Dispatcher
//!
//! Turns pod notifications into termination jobs.
//!
//! A [`PodEventHandler`] is built for each leadership term and bound to the
//! watch sessions of that term only. Dispatch reads nothing but the delivered
//! pod: ownership filter, completion check, then a non-blocking hand-off to the
//! worker pool. A pod that no longer needs a pass withdraws any work still
//! queued for it. Deletes are ignored.

use crate::config::SidecarSpec;
use crate::controller::ownership::OwnershipRegistry;
use crate::controller::snapshot::PodSnapshot;
use crate::controller::worker::{SubmitError, TerminationJob, WorkQueue};
use crate::observability::metrics;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Callbacks invoked by a watch session for every pod it observes
pub trait EventHandler: Send + Sync {
    fn on_add(&self, pod: &Pod);
    fn on_update(&self, pod: &Pod);
    fn on_delete(&self, pod: &Pod);
}

/// What dispatch decided for one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// No owner reference matched the registry
    NotOwned,
    /// Primary containers are still working
    Incomplete,
    /// Complete, but no sidecar is running any more
    NothingToTerminate,
    Queued,
    /// The worker queue rejected the job
    Dropped,
}

#[derive(Debug, Clone)]
pub struct PodEventHandler {
    sidecars: Arc<SidecarSpec>,
    ownership: OwnershipRegistry,
    queue: WorkQueue,
}

impl PodEventHandler {
    #[must_use]
    pub fn new(sidecars: Arc<SidecarSpec>, ownership: OwnershipRegistry, queue: WorkQueue) -> Self {
        Self {
            sidecars,
            ownership,
            queue,
        }
    }

    /// Evaluate one notification and queue a termination job when needed
    pub fn handle(&self, pod: &Pod) -> Dispatch {
        let snapshot = PodSnapshot::from_pod(pod);
        let span = tracing::debug_span!(
            "controller.dispatch",
            pod.namespace = snapshot.key.namespace.as_str(),
            pod.name = snapshot.key.name.as_str()
        );
        let _guard = span.enter();

        if !self.ownership.is_owned(&snapshot.owner_references) {
            return Dispatch::NotOwned;
        }

        if !snapshot.is_complete(&self.sidecars) {
            debug!("pod.incomplete");
            self.queue.discard(&snapshot.key);
            return Dispatch::Incomplete;
        }

        if snapshot.running_sidecars(&self.sidecars).next().is_none() {
            debug!("pod.sidecars_stopped");
            self.queue.discard(&snapshot.key);
            return Dispatch::NothingToTerminate;
        }

        metrics::increment_pods_completed();
        info!("Pod {} has completed, scheduling sidecar termination", snapshot.key);

        match self.queue.try_submit(TerminationJob { pod: snapshot }) {
            Ok(()) => Dispatch::Queued,
            Err(SubmitError::Full(key)) => {
                metrics::increment_dispatch_dropped();
                warn!(pod = %key, "Termination queue full, dropping job until the next update");
                Dispatch::Dropped
            }
            Err(SubmitError::Closed) => {
                debug!("Termination workers stopped, ignoring notification");
                Dispatch::Dropped
            }
        }
    }
}

impl EventHandler for PodEventHandler {
    fn on_add(&self, pod: &Pod) {
        metrics::increment_pod_event("add");
        self.handle(pod);
    }

    fn on_update(&self, pod: &Pod) {
        metrics::increment_pod_event("update");
        self.handle(pod);
    }

    fn on_delete(&self, _pod: &Pod) {
        metrics::increment_pod_event("delete");
    }
}
