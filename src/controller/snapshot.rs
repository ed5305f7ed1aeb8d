//! # Pod Snapshot
//!
//! Read-only view of the parts of a `Pod` the controller decides on.
//! Built fresh from every notification; nothing here outlives the event.

use k8s_openapi::api::core::v1::{Pod, SecurityContext};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Owner reference as seen by the ownership predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Observed state of a single container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Waiting,
    Running,
    /// Exit code is only meaningful in this state
    Terminated { exit_code: i32 },
    /// The kubelet has not reported a state yet
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub name: String,
    pub state: ContainerState,
}

impl ContainerStatus {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

/// Snapshot of a pod at the time a notification was delivered
#[derive(Debug, Clone, PartialEq)]
pub struct PodSnapshot {
    pub key: PodKey,
    pub owner_references: Vec<OwnerRef>,
    pub phase: Option<String>,
    pub restart_policy: Option<String>,
    pub share_process_namespace: bool,
    pub container_statuses: Vec<ContainerStatus>,
    /// Names of ephemeral containers already injected into the pod
    pub ephemeral_containers: Vec<String>,
    /// Security contexts of regular containers, keyed by container name
    pub security_contexts: BTreeMap<String, SecurityContext>,
}

impl PodSnapshot {
    #[must_use]
    pub fn from_pod(pod: &Pod) -> Self {
        let key = PodKey {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
        };

        let owner_references = pod
            .metadata
            .owner_references
            .iter()
            .flatten()
            .map(|r| OwnerRef {
                api_version: r.api_version.clone(),
                kind: r.kind.clone(),
                name: r.name.clone(),
            })
            .collect();

        let status = pod.status.as_ref();
        let container_statuses = status
            .and_then(|s| s.container_statuses.as_ref())
            .into_iter()
            .flatten()
            .map(|cs| ContainerStatus {
                name: cs.name.clone(),
                state: container_state(cs.state.as_ref()),
            })
            .collect();

        let spec = pod.spec.as_ref();
        let ephemeral_containers = spec
            .and_then(|s| s.ephemeral_containers.as_ref())
            .into_iter()
            .flatten()
            .map(|c| c.name.clone())
            .collect();
        let security_contexts = spec
            .into_iter()
            .flat_map(|s| s.containers.iter())
            .filter_map(|c| c.security_context.clone().map(|sc| (c.name.clone(), sc)))
            .collect();

        Self {
            key,
            owner_references,
            phase: status.and_then(|s| s.phase.clone()),
            restart_policy: spec.and_then(|s| s.restart_policy.clone()),
            share_process_namespace: spec
                .and_then(|s| s.share_process_namespace)
                .unwrap_or(false),
            container_statuses,
            ephemeral_containers,
            security_contexts,
        }
    }

    #[must_use]
    pub fn has_ephemeral_container(&self, name: &str) -> bool {
        self.ephemeral_containers.iter().any(|c| c == name)
    }
}

fn container_state(state: Option<&k8s_openapi::api::core::v1::ContainerState>) -> ContainerState {
    let Some(state) = state else {
        return ContainerState::Unknown;
    };
    if let Some(terminated) = &state.terminated {
        ContainerState::Terminated {
            exit_code: terminated.exit_code,
        }
    } else if state.running.is_some() {
        ContainerState::Running
    } else if state.waiting.is_some() {
        ContainerState::Waiting
    } else {
        ContainerState::Unknown
    }
}
