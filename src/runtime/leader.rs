//! # Leadership Coordinator
//!
//! Runs the reconciler only while this process holds the leadership lock.
//!
//! The elector follows the usual Kubernetes candidate protocol:
//!
//! 1. Try to acquire the lock every retry period until it succeeds or the
//!    process shuts down. A record held by someone else is only taken over once
//!    it has not changed for its lease duration, measured on this node's clock
//!    from the moment the change was observed.
//! 2. On acquisition, start a leadership term with a fresh child [`Lifetime`].
//! 3. Renew every retry period. If no renewal succeeds within the renew
//!    deadline, or another holder shows up, step down: cancel the term, wait for
//!    it, and go back to step 1.
//! 4. On shutdown, cancel the term and release the lock so a standby can take
//!    over without waiting for expiry.
//!
//! A term that fails with a [`StartupError`] releases the lock and ends the run.

use crate::constants::{LEASE_DURATION_SECS, RENEW_DEADLINE_SECS, RETRY_PERIOD_SECS};
use crate::error::{LeaderElectionError, StartupError};
use crate::observability::metrics;
use crate::runtime::lifetime::Lifetime;
use crate::runtime::lock::{LeaderRecord, ResourceLock};
use k8s_openapi::chrono::Utc;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lease duration, renew deadline and retry period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(LEASE_DURATION_SECS),
            renew_deadline: Duration::from_secs(RENEW_DEADLINE_SECS),
            retry_period: Duration::from_secs(RETRY_PERIOD_SECS),
        }
    }
}

/// Last record seen and when this process first saw it
#[derive(Debug)]
struct Observed {
    record: LeaderRecord,
    at: Instant,
}

enum HoldOutcome {
    Shutdown,
    Lost,
    TermEnded(Result<Result<(), StartupError>, JoinError>),
}

pub struct LeaderElector {
    lock: Box<dyn ResourceLock>,
    identity: String,
    timings: Timings,
    observed: Mutex<Option<Observed>>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lock", &self.lock.describe())
            .field("identity", &self.identity)
            .field("timings", &self.timings)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    #[must_use]
    pub fn new(lock: Box<dyn ResourceLock>, identity: impl Into<String>) -> Self {
        Self::with_timings(lock, identity, Timings::default())
    }

    #[must_use]
    pub fn with_timings(
        lock: Box<dyn ResourceLock>,
        identity: impl Into<String>,
        timings: Timings,
    ) -> Self {
        Self {
            lock,
            identity: identity.into(),
            timings,
            observed: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Compete for leadership until `lifetime` is cancelled, running
    /// `on_started_leading` once per term.
    ///
    /// # Errors
    ///
    /// [`LeaderElectionError::Term`] when a term fails with a startup error, or
    /// [`LeaderElectionError::TermAborted`] when the term task panicked.
    /// The lock has been released in both cases.
    pub async fn run<F, Fut>(
        &self,
        lifetime: &Lifetime,
        on_started_leading: F,
    ) -> Result<(), LeaderElectionError>
    where
        F: Fn(Lifetime) -> Fut,
        Fut: Future<Output = Result<(), StartupError>> + Send + 'static,
    {
        info!(
            identity = self.identity.as_str(),
            "Attempting to acquire leader lease {}",
            self.lock.describe()
        );

        loop {
            if !self.acquire(lifetime).await {
                return Ok(());
            }
            metrics::set_leader(true);
            info!("Successfully acquired lease {}", self.lock.describe());

            let term = lifetime.child();
            let mut task = tokio::spawn(on_started_leading(term.clone()));
            let outcome = self.hold(lifetime, &mut task).await;

            term.cancel();
            metrics::set_leader(false);
            let (term_result, stepped_down) = match outcome {
                HoldOutcome::TermEnded(result) => (result, false),
                HoldOutcome::Shutdown => (task.await, false),
                HoldOutcome::Lost => (task.await, true),
            };
            self.release_logged().await;

            match term_result {
                Ok(Ok(())) if stepped_down && !lifetime.is_cancelled() => {
                    warn!("Leader lost, waiting to reacquire {}", self.lock.describe());
                }
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Leadership term failed");
                    return Err(LeaderElectionError::Term(e));
                }
                Err(e) => return Err(LeaderElectionError::TermAborted(e.to_string())),
            }
        }
    }

    /// Retry until the lock is ours. Returns false if cancelled first.
    async fn acquire(&self, lifetime: &Lifetime) -> bool {
        loop {
            if lifetime.is_cancelled() {
                return false;
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => debug!("lock held by another candidate"),
                Err(e) => warn!(error = %e, "Failed to acquire lease"),
            }
            tokio::select! {
                () = lifetime.cancelled() => return false,
                () = tokio::time::sleep(self.timings.retry_period) => {}
            }
        }
    }

    /// Renew until shutdown, loss of the lock, or the term ending on its own
    async fn hold(
        &self,
        lifetime: &Lifetime,
        task: &mut JoinHandle<Result<(), StartupError>>,
    ) -> HoldOutcome {
        let mut last_renew = Instant::now();
        loop {
            tokio::select! {
                () = lifetime.cancelled() => return HoldOutcome::Shutdown,
                result = &mut *task => return HoldOutcome::TermEnded(result),
                () = tokio::time::sleep(self.timings.retry_period) => {}
            }

            let remaining = self
                .timings
                .renew_deadline
                .saturating_sub(last_renew.elapsed());
            match tokio::time::timeout(remaining, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => last_renew = Instant::now(),
                Ok(Ok(false)) if self.held_by_other() => {
                    warn!("Lease {} was taken over by another candidate", self.lock.describe());
                    return HoldOutcome::Lost;
                }
                // Lost a write race; the next round re-reads the lock
                Ok(Ok(false)) => debug!("Renewing lease conflicted, retrying"),
                Ok(Err(e)) => warn!(error = %e, "Failed to renew lease"),
                Err(_elapsed) => warn!("Renewing lease timed out"),
            }

            if last_renew.elapsed() >= self.timings.renew_deadline {
                warn!(
                    "Failed to renew lease {} within {:?}",
                    self.lock.describe(),
                    self.timings.renew_deadline
                );
                return HoldOutcome::Lost;
            }
        }
    }

    /// One acquire-or-renew round.
    ///
    /// Returns `Ok(false)` when another candidate validly holds the lock or won
    /// a concurrent write.
    ///
    /// # Errors
    ///
    /// Lock API failures other than conflicts.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();
        let mut desired = LeaderRecord {
            holder_identity: self.identity.clone(),
            lease_duration_secs: duration_secs(self.timings.lease_duration),
            acquire_time: Some(now),
            renew_time: Some(now),
            leader_transitions: 0,
        };

        let Some(current) = self.lock.get().await? else {
            return match self.lock.create(&desired).await {
                Ok(()) => {
                    self.observe(desired);
                    Ok(true)
                }
                Err(e) if e.is_conflict() => Ok(false),
                Err(e) => Err(e),
            };
        };

        self.observe(current.record.clone());
        let ours = current.record.is_held_by(&self.identity);
        if !ours && !current.record.holder_identity.is_empty() && !self.observed_expired() {
            return Ok(false);
        }

        if ours {
            desired.acquire_time = current.record.acquire_time;
            desired.leader_transitions = current.record.leader_transitions;
        } else {
            desired.leader_transitions = current.record.leader_transitions + 1;
        }

        match self
            .lock
            .update(&desired, current.resource_version.as_deref())
            .await
        {
            Ok(()) => {
                self.observe(desired);
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Hand the lock back with an empty holder and a one second lease
    ///
    /// # Errors
    ///
    /// Lock API failures. A lock held by someone else is left untouched.
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        let Some(current) = self.lock.get().await? else {
            return Ok(());
        };
        if !current.record.is_held_by(&self.identity) {
            return Ok(());
        }

        let now = Utc::now();
        let released = LeaderRecord {
            holder_identity: String::new(),
            lease_duration_secs: 1,
            acquire_time: Some(now),
            renew_time: Some(now),
            leader_transitions: current.record.leader_transitions,
        };
        self.lock
            .update(&released, current.resource_version.as_deref())
            .await?;
        self.observe(released);
        info!("Released lease {}", self.lock.describe());
        Ok(())
    }

    async fn release_logged(&self) {
        match tokio::time::timeout(self.timings.renew_deadline, self.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to release lease"),
            Err(_elapsed) => warn!("Releasing lease timed out"),
        }
    }

    /// Remember `record`, restarting the expiry clock only when it changed
    fn observe(&self, record: LeaderRecord) {
        let mut observed = self
            .observed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if observed.as_ref().is_some_and(|o| o.record == record) {
            return;
        }

        let previous_holder = observed.as_ref().map(|o| o.record.holder_identity.as_str());
        if !record.holder_identity.is_empty()
            && previous_holder != Some(record.holder_identity.as_str())
            && record.holder_identity != self.identity
        {
            info!("New leader elected: {}", record.holder_identity);
        }

        *observed = Some(Observed {
            record,
            at: Instant::now(),
        });
    }

    /// True when the last record seen names another candidate
    fn held_by_other(&self) -> bool {
        let observed = self
            .observed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        observed.as_ref().is_some_and(|o| {
            !o.record.holder_identity.is_empty() && !o.record.is_held_by(&self.identity)
        })
    }

    fn observed_expired(&self) -> bool {
        let observed = self
            .observed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        observed.as_ref().is_none_or(|o| {
            let lease = Duration::from_secs(u64::try_from(o.record.lease_duration_secs).unwrap_or(0));
            o.at + lease <= Instant::now()
        })
    }
}

fn duration_secs(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}
