//! # Completion
//!
//! Decides whether the primary work of a pod has finished.
//!
//! Workload pods stay in phase `Running` while a sidecar keeps them alive after
//! the primary containers exit, so `Running` is the only phase that can be
//! complete. Any other phase means either the pod has not started its work or
//! the kubelet already finished it.

use crate::config::SidecarSpec;
use crate::controller::snapshot::{ContainerState, ContainerStatus, PodSnapshot};

const PHASE_RUNNING: &str = "Running";
const RESTART_POLICY_NEVER: &str = "Never";

/// True when every non-sidecar container has terminated.
///
/// Restartable pods (restart policy other than `Never`, including the default)
/// only count a container as done when it exited with code 0; a failed container
/// would be restarted by the kubelet. Under `Never` any exit code counts.
/// A pod without primary containers is complete.
#[must_use]
pub fn is_complete(
    phase: Option<&str>,
    statuses: &[ContainerStatus],
    restart_policy: Option<&str>,
    sidecars: &SidecarSpec,
) -> bool {
    if phase != Some(PHASE_RUNNING) {
        return false;
    }

    let accept_any_exit = restart_policy == Some(RESTART_POLICY_NEVER);

    statuses
        .iter()
        .filter(|status| !sidecars.contains(&status.name))
        .all(|status| match status.state {
            ContainerState::Terminated { exit_code } => accept_any_exit || exit_code == 0,
            _ => false,
        })
}

impl PodSnapshot {
    #[must_use]
    pub fn is_complete(&self, sidecars: &SidecarSpec) -> bool {
        is_complete(
            self.phase.as_deref(),
            &self.container_statuses,
            self.restart_policy.as_deref(),
            sidecars,
        )
    }

    /// Sidecar containers currently observed running, in status order
    pub fn running_sidecars<'a>(
        &'a self,
        sidecars: &'a SidecarSpec,
    ) -> impl Iterator<Item = &'a ContainerStatus> + 'a {
        self.container_statuses
            .iter()
            .filter(move |status| sidecars.contains(&status.name) && status.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecars() -> SidecarSpec {
        SidecarSpec::parse(["istio-proxy"]).unwrap()
    }

    fn terminated(name: &str, exit_code: i32) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: ContainerState::Terminated { exit_code },
        }
    }

    fn running(name: &str) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            state: ContainerState::Running,
        }
    }

    #[test]
    fn test_non_running_phases_are_never_complete() {
        let statuses = [terminated("main", 0)];
        for phase in [None, Some("Pending"), Some("Succeeded"), Some("Failed"), Some("Unknown")] {
            assert!(
                !is_complete(phase, &statuses, Some("Never"), &sidecars()),
                "phase {phase:?} must not be complete"
            );
            assert!(!is_complete(phase, &[], Some("Always"), &sidecars()));
        }
    }

    #[test]
    fn test_successful_primary_is_complete() {
        assert!(is_complete(
            Some("Running"),
            &[terminated("main", 0)],
            Some("Always"),
            &sidecars()
        ));
    }

    #[test]
    fn test_failed_primary_is_incomplete_when_restartable() {
        for policy in [Some("Always"), Some("OnFailure"), None] {
            assert!(!is_complete(
                Some("Running"),
                &[terminated("main", 7)],
                policy,
                &sidecars()
            ));
        }
    }

    #[test]
    fn test_any_exit_code_is_complete_under_never() {
        assert!(is_complete(
            Some("Running"),
            &[terminated("main", 7)],
            Some("Never"),
            &sidecars()
        ));
    }

    #[test]
    fn test_running_primary_is_incomplete() {
        assert!(!is_complete(
            Some("Running"),
            &[running("main"), running("istio-proxy")],
            Some("Never"),
            &sidecars()
        ));
    }

    #[test]
    fn test_all_primaries_must_be_done() {
        let statuses = [terminated("main", 0), running("uploader"), running("istio-proxy")];
        assert!(!is_complete(Some("Running"), &statuses, Some("Never"), &sidecars()));

        let statuses = [terminated("main", 0), terminated("uploader", 1)];
        assert!(!is_complete(Some("Running"), &statuses, Some("OnFailure"), &sidecars()));
        assert!(is_complete(Some("Running"), &statuses, Some("Never"), &sidecars()));
    }

    #[test]
    fn test_sidecar_state_is_ignored() {
        let statuses = [terminated("main", 0), terminated("istio-proxy", 137)];
        assert!(is_complete(Some("Running"), &statuses, Some("Always"), &sidecars()));
    }

    #[test]
    fn test_only_sidecars_is_vacuously_complete() {
        assert!(is_complete(
            Some("Running"),
            &[running("istio-proxy")],
            Some("Always"),
            &sidecars()
        ));
        assert!(is_complete(Some("Running"), &[], Some("Always"), &sidecars()));
    }

    #[test]
    fn test_waiting_or_unknown_primary_is_incomplete() {
        for state in [ContainerState::Waiting, ContainerState::Unknown] {
            let statuses = [ContainerStatus {
                name: "main".to_string(),
                state,
            }];
            assert!(!is_complete(Some("Running"), &statuses, Some("Never"), &sidecars()));
        }
    }
}
