//! # Termination Workers
//!
//! Bounded pool that runs termination passes off the event-delivery path.
//!
//! Work is sharded by pod key: every pod lands on the same worker, so two
//! passes for one pod never run concurrently. Each shard keeps at most one
//! pending snapshot per pod. A newer notification replaces the pending one, and
//! a notification showing nothing left to terminate withdraws it, so a worker
//! always acts on the latest state it was given. Submission never blocks; a
//! full shard drops the job and the next notification (or resync) for that
//! pod brings it back.

use crate::controller::snapshot::{PodKey, PodSnapshot};
use crate::controller::termination::{AttemptState, TerminationBackend, TerminationEngine};
use crate::runtime::lifetime::Lifetime;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

/// A completed pod waiting for its sidecars to be stopped
#[derive(Debug, Clone)]
pub struct TerminationJob {
    pub pod: PodSnapshot,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("termination queue for {0} is full")]
    Full(PodKey),
    #[error("termination workers have stopped")]
    Closed,
}

/// Latest snapshot per pod that is queued but not yet picked up
type Pending = Arc<Mutex<HashMap<PodKey, PodSnapshot>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<PodKey, PodSnapshot>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct Shard {
    keys: mpsc::Sender<PodKey>,
    pending: Pending,
}

/// Sending half of the sharded queue
#[derive(Debug, Clone)]
pub struct WorkQueue {
    shards: Arc<[Shard]>,
}

/// Receiving half of one shard
#[derive(Debug)]
pub struct ShardReceiver {
    keys: mpsc::Receiver<PodKey>,
    pending: Pending,
}

impl ShardReceiver {
    /// Next pod with pending work, carrying its latest snapshot.
    /// `None` once the queue is dropped and drained.
    pub async fn next(&mut self) -> Option<TerminationJob> {
        while let Some(key) = self.keys.recv().await {
            if let Some(pod) = lock(&self.pending).remove(&key) {
                return Some(TerminationJob { pod });
            }
        }
        None
    }

    /// Like [`ShardReceiver::next`] without waiting
    pub fn try_next(&mut self) -> Option<TerminationJob> {
        while let Ok(key) = self.keys.try_recv() {
            if let Some(pod) = lock(&self.pending).remove(&key) {
                return Some(TerminationJob { pod });
            }
        }
        None
    }
}

/// Create a queue with `shards` independent shards holding up to `capacity` pods each
#[must_use]
pub fn work_queue(shards: usize, capacity: usize) -> (WorkQueue, Vec<ShardReceiver>) {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..shards.max(1))
        .map(|_| {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            let pending = Pending::default();
            (
                Shard {
                    keys: tx,
                    pending: Arc::clone(&pending),
                },
                ShardReceiver { keys: rx, pending },
            )
        })
        .unzip();
    (
        WorkQueue {
            shards: senders.into(),
        },
        receivers,
    )
}

impl WorkQueue {
    /// Queue a job without waiting. A job for a pod that is already pending
    /// replaces the pending snapshot instead of taking another slot.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Full`] when the pod's shard is saturated,
    /// [`SubmitError::Closed`] once the workers are gone.
    pub fn try_submit(&self, job: TerminationJob) -> Result<(), SubmitError> {
        let shard = &self.shards[self.shard_for(&job.pod.key)];
        let mut pending = lock(&shard.pending);
        if let Some(queued) = pending.get_mut(&job.pod.key) {
            debug!(pod = %job.pod.key, "pending termination replaced by newer snapshot");
            *queued = job.pod;
            return Ok(());
        }

        // The key is sent under the lock so a worker never sees it before its snapshot
        shard.keys.try_send(job.pod.key.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(key) => SubmitError::Full(key),
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })?;
        pending.insert(job.pod.key.clone(), job.pod);
        Ok(())
    }

    /// Withdraw pending work for `key`. A pass already running is not affected.
    pub fn discard(&self, key: &PodKey) -> bool {
        let shard = &self.shards[self.shard_for(key)];
        let removed = lock(&shard.pending).remove(key).is_some();
        if removed {
            debug!(pod = %key, "pending termination withdrawn");
        }
        removed
    }

    #[must_use]
    pub fn shard_for(&self, key: &PodKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shards = self.shards.len() as u64;
        #[allow(clippy::cast_possible_truncation, reason = "Result is below the shard count")]
        let shard = (hasher.finish() % shards) as usize;
        shard
    }

    #[must_use]
    pub fn shards(&self) -> usize {
        self.shards.len()
    }
}

/// Start one worker per receiver. Workers stop when `lifetime` is cancelled,
/// aborting any termination call in flight.
pub fn spawn_workers<B>(
    receivers: Vec<ShardReceiver>,
    engine: Arc<TerminationEngine<B>>,
    lifetime: &Lifetime,
) -> JoinSet<()>
where
    B: TerminationBackend + 'static,
{
    let mut workers = JoinSet::new();
    for (index, receiver) in receivers.into_iter().enumerate() {
        let engine = Arc::clone(&engine);
        let lifetime = lifetime.clone();
        workers.spawn(run_worker(index, receiver, engine, lifetime));
    }
    workers
}

async fn run_worker<B: TerminationBackend>(
    index: usize,
    mut receiver: ShardReceiver,
    engine: Arc<TerminationEngine<B>>,
    lifetime: Lifetime,
) {
    debug!(worker = index, "termination worker started");
    loop {
        let job = tokio::select! {
            () = lifetime.cancelled() => break,
            job = receiver.next() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let span = tracing::info_span!(
            "controller.terminate",
            pod.namespace = job.pod.key.namespace.as_str(),
            pod.name = job.pod.key.name.as_str(),
            worker = index
        );
        tokio::select! {
            () = lifetime.cancelled() => {
                info!(pod = %job.pod.key, "Termination aborted by shutdown");
                break;
            }
            report = engine.terminate(&job.pod).instrument(span) => {
                let failed = report
                    .attempts
                    .iter()
                    .filter(|a| a.state == AttemptState::FailedLogged)
                    .count();
                if failed > 0 && !report.pod_gone {
                    warn!(pod = %report.pod, failed, "Some sidecars could not be terminated, will retry on the next update");
                }
            }
        }
    }
    debug!(worker = index, "termination worker stopped");
}
