//! # Termination Backend
//!
//! The two cluster write calls the engine needs, behind a trait so tests can
//! substitute a recording fake. [`KubeBackend`] is the real implementation.

use crate::controller::snapshot::PodKey;
use crate::error::TerminationError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{EphemeralContainer, Pod};
use kube::api::{Api, AttachParams, Patch, PatchParams};
use kube::Client;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Remote operations used to stop a sidecar
#[async_trait]
pub trait TerminationBackend: Send + Sync {
    /// Run `command` inside `container` and wait for it to finish
    async fn exec(
        &self,
        pod: &PodKey,
        container: &str,
        command: &[String],
    ) -> Result<(), TerminationError>;

    /// Add `container` to the pod's ephemeral containers
    async fn add_ephemeral_container(
        &self,
        pod: &PodKey,
        container: EphemeralContainer,
    ) -> Result<(), TerminationError>;
}

/// Backend talking to the Kubernetes API; every call is bounded by `timeout`
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
    timeout: Duration,
}

impl std::fmt::Debug for KubeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeBackend")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KubeBackend {
    #[must_use]
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn pods(&self, pod: &PodKey) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &pod.namespace)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        pod: &PodKey,
        call: impl Future<Output = Result<T, TerminationError>>,
    ) -> Result<T, TerminationError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_elapsed| TerminationError::Timeout {
                operation,
                pod: pod.to_string(),
                timeout: self.timeout,
            })?
    }
}

#[async_trait]
impl TerminationBackend for KubeBackend {
    async fn exec(
        &self,
        pod: &PodKey,
        container: &str,
        command: &[String],
    ) -> Result<(), TerminationError> {
        let pods = self.pods(pod);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(false)
            .tty(false);

        let remote_error = |message: String| TerminationError::RemoteExecution {
            pod: pod.to_string(),
            container: container.to_string(),
            message,
        };

        self.bounded("exec", pod, async {
            let mut process = pods
                .exec(&pod.name, command.to_vec(), &params)
                .await
                .map_err(|e| TerminationError::from_kube(&pod.to_string(), e))?;

            if let Some(mut stdout) = process.stdout() {
                tokio::io::copy(&mut stdout, &mut tokio::io::sink())
                    .await
                    .map_err(|e| remote_error(e.to_string()))?;
            }

            let status = match process.take_status() {
                Some(status) => status.await,
                None => None,
            };
            process
                .join()
                .await
                .map_err(|e| remote_error(e.to_string()))?;

            match status {
                Some(status) if status.status.as_deref() == Some("Failure") => {
                    Err(remote_error(
                        status
                            .message
                            .or(status.reason)
                            .unwrap_or_else(|| "command failed".to_string()),
                    ))
                }
                _ => {
                    debug!(pod = %pod, container, ?command, "exec.completed");
                    Ok(())
                }
            }
        })
        .await
    }

    async fn add_ephemeral_container(
        &self,
        pod: &PodKey,
        container: EphemeralContainer,
    ) -> Result<(), TerminationError> {
        let pods = self.pods(pod);
        // Strategic merge keys ephemeral containers by name, so only the new one is sent
        let patch = serde_json::json!({
            "spec": { "ephemeralContainers": [container] }
        });

        self.bounded("ephemeral container update", pod, async {
            pods.patch_ephemeral_containers(
                &pod.name,
                &PatchParams::default(),
                &Patch::Strategic(patch),
            )
            .await
            .map_err(|e| TerminationError::from_kube(&pod.to_string(), e))?;
            Ok(())
        })
        .await
    }
}
