//! Common test utilities for the integration tests
//!
//! Provides a recording [`TerminationBackend`], pod fixtures and synthetic
//! watch streams.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{EphemeralContainer, Pod};
use kube_runtime::watcher::{self, Event};
use serde_json::{json, Value};
use sidecar_terminator::controller::snapshot::PodKey;
use sidecar_terminator::controller::termination::TerminationBackend;
use sidecar_terminator::TerminationError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A remote call the backend received
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Exec {
        pod: String,
        container: String,
        command: Vec<String>,
    },
    Ephemeral {
        pod: String,
        container: EphemeralContainer,
    },
}

/// Scripted outcome of the next call
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Ok,
    Fail,
    NotFound,
}

/// Backend that records every call and answers from a script.
/// Calls beyond the script succeed.
#[derive(Debug, Clone, Default)]
pub struct RecordingBackend {
    calls: Arc<Mutex<Vec<Call>>>,
    script: Arc<Mutex<VecDeque<Outcome>>>,
    latency: Duration,
}

impl RecordingBackend {
    pub fn scripted(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        let backend = Self::default();
        backend.script.lock().unwrap().extend(outcomes);
        backend
    }

    /// Every call takes `latency` before it answers
    pub fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn exec_commands(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Exec {
                    container, command, ..
                } => Some((container, command)),
                Call::Ephemeral { .. } => None,
            })
            .collect()
    }

    fn answer(&self, pod: &PodKey, container: &str) -> Result<(), TerminationError> {
        match self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Ok) {
            Outcome::Ok => Ok(()),
            Outcome::Fail => Err(TerminationError::RemoteExecution {
                pod: pod.to_string(),
                container: container.to_string(),
                message: "executable file not found in $PATH".to_string(),
            }),
            Outcome::NotFound => Err(TerminationError::NotFound {
                pod: pod.to_string(),
            }),
        }
    }

    /// Wait until at least `count` calls were recorded
    pub async fn wait_for_calls(&self, count: usize) -> Vec<Call> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let calls = self.calls();
                if calls.len() >= count {
                    return calls;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backend calls were not made in time")
    }
}

#[async_trait]
impl TerminationBackend for RecordingBackend {
    async fn exec(
        &self,
        pod: &PodKey,
        container: &str,
        command: &[String],
    ) -> Result<(), TerminationError> {
        self.calls.lock().unwrap().push(Call::Exec {
            pod: pod.to_string(),
            container: container.to_string(),
            command: command.to_vec(),
        });
        tokio::time::sleep(self.latency).await;
        self.answer(pod, container)
    }

    async fn add_ephemeral_container(
        &self,
        pod: &PodKey,
        container: EphemeralContainer,
    ) -> Result<(), TerminationError> {
        let name = container.name.clone();
        self.calls.lock().unwrap().push(Call::Ephemeral {
            pod: pod.to_string(),
            container,
        });
        tokio::time::sleep(self.latency).await;
        self.answer(pod, &name)
    }
}

pub fn running() -> Value {
    json!({ "running": {} })
}

pub fn terminated(exit_code: i32) -> Value {
    json!({ "terminated": { "exitCode": exit_code } })
}

fn status(name: &str, state: Value) -> Value {
    json!({
        "name": name, "image": name, "imageID": "", "ready": false,
        "restartCount": 0, "state": state
    })
}

/// Fixture for a pod with one main container and any number of sidecars
#[derive(Debug, Clone)]
pub struct PodFixture {
    name: String,
    owner: (String, String),
    main: Value,
    sidecars: Vec<(String, Value)>,
    share_process_namespace: bool,
    ephemeral: Vec<String>,
    security_context: Option<Value>,
    resource_version: String,
}

impl PodFixture {
    /// Job pod `ns/<name>` whose main container exited with 0
    pub fn job(name: &str) -> Self {
        Self {
            name: name.to_string(),
            owner: ("batch/v1".to_string(), "Job".to_string()),
            main: terminated(0),
            sidecars: Vec::new(),
            share_process_namespace: false,
            ephemeral: Vec::new(),
            security_context: None,
            resource_version: "1".to_string(),
        }
    }

    pub fn owned_by(mut self, api_version: &str, kind: &str) -> Self {
        self.owner = (api_version.to_string(), kind.to_string());
        self
    }

    pub fn main(mut self, state: Value) -> Self {
        self.main = state;
        self
    }

    pub fn sidecar(mut self, name: &str, state: Value) -> Self {
        self.sidecars.push((name.to_string(), state));
        self
    }

    pub fn shared_pid_namespace(mut self) -> Self {
        self.share_process_namespace = true;
        self
    }

    pub fn ephemeral(mut self, name: &str) -> Self {
        self.ephemeral.push(name.to_string());
        self
    }

    /// Security context applied to every sidecar container
    pub fn sidecar_security_context(mut self, context: Value) -> Self {
        self.security_context = Some(context);
        self
    }

    pub fn resource_version(mut self, version: &str) -> Self {
        self.resource_version = version.to_string();
        self
    }

    pub fn build(&self) -> Pod {
        let mut containers = vec![json!({ "name": "main", "image": "app" })];
        let mut statuses = vec![status("main", self.main.clone())];
        for (name, state) in &self.sidecars {
            let mut container = json!({ "name": name, "image": name });
            if let Some(context) = &self.security_context {
                container["securityContext"] = context.clone();
            }
            containers.push(container);
            statuses.push(status(name, state.clone()));
        }
        let ephemeral: Vec<Value> = self
            .ephemeral
            .iter()
            .map(|name| json!({ "name": name, "image": "busybox" }))
            .collect();

        serde_json::from_value(json!({
            "metadata": {
                "name": self.name,
                "namespace": "ns",
                "resourceVersion": self.resource_version,
                "ownerReferences": [{
                    "apiVersion": self.owner.0,
                    "kind": self.owner.1,
                    "name": "owner",
                    "uid": "owner-uid"
                }]
            },
            "spec": {
                "restartPolicy": "Never",
                "shareProcessNamespace": self.share_process_namespace,
                "containers": containers,
                "ephemeralContainers": ephemeral
            },
            "status": {
                "phase": "Running",
                "containerStatuses": statuses
            }
        }))
        .unwrap()
    }
}

pub type Events = BoxStream<'static, Result<Event<Pod>, watcher::Error>>;

/// Initial listing of `pods`, then `updates`, then a stream that stays open
pub fn watch(pods: Vec<Pod>, updates: Vec<Pod>) -> Events {
    let events = std::iter::once(Event::Init)
        .chain(pods.into_iter().map(Event::InitApply))
        .chain(std::iter::once(Event::InitDone))
        .chain(updates.into_iter().map(Event::Apply));
    futures::stream::iter(events.map(Ok))
        .chain(futures::stream::pending())
        .boxed()
}

/// Like [`watch`], but `updates` are only delivered once `gate` resolves
pub fn watch_after<F>(pods: Vec<Pod>, gate: F, updates: Vec<Pod>) -> Events
where
    F: Future<Output = ()> + Send + 'static,
{
    let listing = std::iter::once(Event::Init)
        .chain(pods.into_iter().map(Event::InitApply))
        .chain(std::iter::once(Event::InitDone));
    let updates = updates.into_iter().map(|pod| Ok(Event::Apply(pod)));
    futures::stream::iter(listing.map(Ok))
        .chain(futures::stream::once(gate).filter_map(|()| async { None::<Result<Event<Pod>, watcher::Error>> }))
        .chain(futures::stream::iter(updates))
        .chain(futures::stream::pending())
        .boxed()
}
