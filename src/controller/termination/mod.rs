//! # Termination Engine
//!
//! Stops the running sidecars of a completed pod, one sidecar at a time.
//!
//! Two strategies exist:
//!
//! - **Exec**: run `/bin/kill -s <signal> 1` inside the sidecar. If that fails the
//!   same signal is sent through `/bin/sh -c`, which covers images without a
//!   `/bin/kill` binary.
//! - **Ephemeral**: inject an ephemeral container named
//!   `sidecar-terminator-<sidecar>` that targets the sidecar and signals process 1.
//!   The presence of that container is the only record that the sidecar was
//!   handled, so a restarted controller never injects twice.
//!
//! Failures are logged and reported, never propagated: the next notification for
//! the same pod re-evaluates it and retries any sidecar still running.
//!
//! ## Shared process namespace
//!
//! In a pod with `shareProcessNamespace: true`, process 1 is the pod's infra
//! process rather than the sidecar. The ephemeral strategy refuses such pods with
//! [`TerminationError::SharedProcessNamespace`]. The exec strategy still signals
//! process 1, which may stop more than the sidecar; this is a known limitation
//! and is logged as a warning.

pub mod backend;

pub use backend::{KubeBackend, TerminationBackend};

use crate::config::{SidecarSpec, TerminationStrategy};
use crate::constants::TERMINATOR_CONTAINER_PREFIX;
use crate::controller::snapshot::{PodKey, PodSnapshot};
use crate::error::TerminationError;
use crate::observability::metrics;
use k8s_openapi::api::core::v1::EphemeralContainer;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Name of the ephemeral container that terminates `sidecar`
#[must_use]
pub fn marker_name(sidecar: &str) -> String {
    format!("{TERMINATOR_CONTAINER_PREFIX}-{sidecar}")
}

/// `/bin/kill -s <signal> 1`
#[must_use]
pub fn kill_command(signal: u8) -> Vec<String> {
    vec![
        "/bin/kill".to_string(),
        "-s".to_string(),
        signal.to_string(),
        "1".to_string(),
    ]
}

/// `/bin/sh -c 'kill -s "<signal>" 1'`
#[must_use]
pub fn shell_kill_command(signal: u8) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("kill -s \"{signal}\" 1"),
    ]
}

/// Progress of one termination attempt for one sidecar of one pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Nothing sent yet
    Untouched,
    /// Direct exec failed, shell form not yet tried
    ExecAttempted,
    /// Shell form failed as well
    ExecFallbackAttempted,
    /// The signal was delivered
    Succeeded,
    /// Gave up for this notification; the error has been logged
    FailedLogged,
    /// A termination container for this sidecar already exists
    AlreadyMarked,
    /// A termination container was injected
    MarkerCreated,
}

impl AttemptState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded
                | AttemptState::FailedLogged
                | AttemptState::AlreadyMarked
                | AttemptState::MarkerCreated
        )
    }

    /// Transition of the exec path after an attempt from this state
    #[must_use]
    pub fn after_exec(self, delivered: bool) -> Self {
        match (self, delivered) {
            (AttemptState::Untouched | AttemptState::ExecAttempted, true) => AttemptState::Succeeded,
            (AttemptState::Untouched, false) => AttemptState::ExecAttempted,
            (AttemptState::ExecAttempted, false) => AttemptState::ExecFallbackAttempted,
            (AttemptState::ExecFallbackAttempted, _) => AttemptState::FailedLogged,
            (state, _) => state,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::Untouched => "untouched",
            AttemptState::ExecAttempted => "exec-attempted",
            AttemptState::ExecFallbackAttempted => "exec-fallback-attempted",
            AttemptState::Succeeded => "succeeded",
            AttemptState::FailedLogged => "failed",
            AttemptState::AlreadyMarked => "already-marked",
            AttemptState::MarkerCreated => "marker-created",
        }
    }
}

/// Result of handling one sidecar
#[derive(Debug)]
pub struct SidecarAttempt {
    pub sidecar: String,
    pub signal: u8,
    pub state: AttemptState,
    /// Last error seen, kept even when a later attempt succeeded
    pub error: Option<TerminationError>,
}

impl SidecarAttempt {
    fn new(sidecar: &str, signal: u8) -> Self {
        Self {
            sidecar: sidecar.to_string(),
            signal,
            state: AttemptState::Untouched,
            error: None,
        }
    }
}

/// Everything the engine did for one pod
#[derive(Debug)]
pub struct TerminationReport {
    pub pod: PodKey,
    pub attempts: Vec<SidecarAttempt>,
    /// The pod disappeared while it was being handled
    pub pod_gone: bool,
}

impl TerminationReport {
    #[must_use]
    pub fn attempt(&self, sidecar: &str) -> Option<&SidecarAttempt> {
        self.attempts.iter().find(|a| a.sidecar == sidecar)
    }
}

#[derive(Debug)]
pub struct TerminationEngine<B> {
    backend: B,
    sidecars: Arc<SidecarSpec>,
    strategy: TerminationStrategy,
    ephemeral_image: String,
}

impl<B: TerminationBackend> TerminationEngine<B> {
    pub fn new(
        backend: B,
        sidecars: Arc<SidecarSpec>,
        strategy: TerminationStrategy,
        ephemeral_image: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            sidecars,
            strategy,
            ephemeral_image: ephemeral_image.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn sidecars(&self) -> &SidecarSpec {
        &self.sidecars
    }

    /// Stop every sidecar observed running in `pod`.
    ///
    /// Sidecars are handled independently; a failure on one does not stop the
    /// others. Only a vanished pod ends the pass early.
    pub async fn terminate(&self, pod: &PodSnapshot) -> TerminationReport {
        let mut report = TerminationReport {
            pod: pod.key.clone(),
            attempts: Vec::new(),
            pod_gone: false,
        };

        let running: Vec<(String, u8)> = pod
            .running_sidecars(&self.sidecars)
            .filter_map(|status| {
                self.sidecars
                    .signal(&status.name)
                    .map(|signal| (status.name.clone(), signal))
            })
            .collect();

        if running.is_empty() {
            return report;
        }

        info!("Terminating running sidecar containers from {}", pod.key);
        if self.strategy == TerminationStrategy::Exec && pod.share_process_namespace {
            warn!(
                pod = %pod.key,
                "Pod shares its process namespace; signalling process 1 may stop more than the sidecar"
            );
        }

        for (sidecar, signal) in running {
            info!(
                pod = %pod.key,
                sidecar = sidecar.as_str(),
                signal,
                strategy = self.strategy.as_str(),
                "Terminating sidecar {} from {} with signal {}",
                sidecar,
                pod.key,
                signal
            );

            let started = Instant::now();
            let mut attempt = SidecarAttempt::new(&sidecar, signal);
            match self.strategy {
                TerminationStrategy::Exec => self.drive_exec(pod, &mut attempt).await,
                TerminationStrategy::Ephemeral => self.drive_ephemeral(pod, &mut attempt).await,
            }
            metrics::observe_termination(
                self.strategy.as_str(),
                attempt.state.as_str(),
                started.elapsed().as_secs_f64(),
            );

            let gone = attempt.error.as_ref().is_some_and(TerminationError::is_not_found)
                && attempt.state == AttemptState::FailedLogged;
            report.attempts.push(attempt);
            if gone {
                info!("{} not found", pod.key);
                report.pod_gone = true;
                break;
            }
        }

        report
    }

    async fn drive_exec(&self, pod: &PodSnapshot, attempt: &mut SidecarAttempt) {
        while !attempt.state.is_terminal() {
            let command = match attempt.state {
                AttemptState::Untouched => kill_command(attempt.signal),
                AttemptState::ExecAttempted => {
                    warn!(
                        pod = %pod.key,
                        sidecar = attempt.sidecar.as_str(),
                        "Failed using standard approach, trying shell approach"
                    );
                    shell_kill_command(attempt.signal)
                }
                _ => {
                    if let Some(e) = &attempt.error {
                        error!(pod = %pod.key, sidecar = attempt.sidecar.as_str(), error = %e, "Failed to terminate sidecar");
                    }
                    attempt.state = AttemptState::FailedLogged;
                    continue;
                }
            };

            match self.backend.exec(&pod.key, &attempt.sidecar, &command).await {
                Ok(()) => attempt.state = attempt.state.after_exec(true),
                Err(e) if e.is_not_found() => {
                    attempt.error = Some(e);
                    attempt.state = AttemptState::FailedLogged;
                }
                Err(e) => {
                    warn!(pod = %pod.key, sidecar = attempt.sidecar.as_str(), error = %e, "Failed to terminate");
                    attempt.error = Some(e);
                    attempt.state = attempt.state.after_exec(false);
                }
            }
        }
    }

    async fn drive_ephemeral(&self, pod: &PodSnapshot, attempt: &mut SidecarAttempt) {
        let marker = marker_name(&attempt.sidecar);
        if pod.has_ephemeral_container(&marker) {
            info!(
                pod = %pod.key,
                sidecar = attempt.sidecar.as_str(),
                "Termination container {} already present, skipping",
                marker
            );
            attempt.state = AttemptState::AlreadyMarked;
            return;
        }

        if pod.share_process_namespace {
            let e = TerminationError::SharedProcessNamespace {
                pod: pod.key.to_string(),
                sidecar: attempt.sidecar.clone(),
            };
            error!(pod = %pod.key, sidecar = attempt.sidecar.as_str(), error = %e, "Refusing to inject termination container");
            attempt.error = Some(e);
            attempt.state = AttemptState::FailedLogged;
            return;
        }

        let container = self.termination_container(pod, &attempt.sidecar, attempt.signal);
        match self.backend.add_ephemeral_container(&pod.key, container).await {
            Ok(()) => {
                info!(pod = %pod.key, sidecar = attempt.sidecar.as_str(), "Injected termination container {}", marker);
                attempt.state = AttemptState::MarkerCreated;
            }
            Err(e) => {
                if !e.is_not_found() {
                    error!(pod = %pod.key, sidecar = attempt.sidecar.as_str(), error = %e, "Failed to inject termination container");
                }
                attempt.error = Some(e);
                attempt.state = AttemptState::FailedLogged;
            }
        }
    }

    /// Ephemeral container that sends `signal` to process 1 of `sidecar`,
    /// running with the sidecar's own security context
    #[must_use]
    pub fn termination_container(
        &self,
        pod: &PodSnapshot,
        sidecar: &str,
        signal: u8,
    ) -> EphemeralContainer {
        let mut command = kill_command(signal);
        command[0] = "kill".to_string();

        EphemeralContainer {
            name: marker_name(sidecar),
            image: Some(self.ephemeral_image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(command),
            target_container_name: Some(sidecar.to_string()),
            security_context: pod.security_contexts.get(sidecar).cloned(),
            ..EphemeralContainer::default()
        }
    }
}
