//! # Resource Locks
//!
//! Kubernetes objects used as the leadership lock.
//!
//! - [`LeaseLock`]: a `coordination.k8s.io/v1` Lease, the record lives in its spec.
//! - [`ConfigMapLock`]: a ConfigMap whose leader record is a JSON document in the
//!   `control-plane.alpha.kubernetes.io/leader` annotation.
//!
//! Writes carry the `resourceVersion` that was read, so the API server rejects
//! an update from a candidate working on a stale view with 409 Conflict.

use crate::config::{LockConfig, LockKind};
use crate::constants::CONFIGMAP_LEADER_ANNOTATION;
use crate::error::LeaderElectionError;
use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use k8s_openapi::chrono::{DateTime, SecondsFormat, Utc};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Who holds the lock and since when
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeaderRecord {
    /// Empty when the lock was released
    pub holder_identity: String,
    pub lease_duration_secs: i32,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub leader_transitions: i32,
}

impl LeaderRecord {
    #[must_use]
    pub fn is_held_by(&self, identity: &str) -> bool {
        !self.holder_identity.is_empty() && self.holder_identity == identity
    }
}

/// A record together with the object version it was read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub record: LeaderRecord,
    pub resource_version: Option<String>,
}

/// Storage for the leader record
#[async_trait]
pub trait ResourceLock: Send + Sync {
    /// Current record, `None` when the lock object does not exist yet
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaderElectionError>;

    /// Create the lock object holding `record`
    async fn create(&self, record: &LeaderRecord) -> Result<(), LeaderElectionError>;

    /// Replace the record, failing with a conflict if the object moved past `resource_version`
    async fn update(
        &self,
        record: &LeaderRecord,
        resource_version: Option<&str>,
    ) -> Result<(), LeaderElectionError>;

    /// `<kind> <namespace>/<name>`, used in logs and errors
    fn describe(&self) -> String;
}

/// Build the lock backend selected in `config`
#[must_use]
pub fn lock_for(client: Client, config: &LockConfig) -> Box<dyn ResourceLock> {
    match config.kind {
        LockKind::Lease => Box::new(LeaseLock::new(client, &config.namespace, &config.name)),
        LockKind::ConfigMap => {
            Box::new(ConfigMapLock::new(client, &config.namespace, &config.name))
        }
    }
}

pub struct LeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

impl LeaseLock {
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn lease(&self, record: &LeaderRecord, resource_version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: resource_version.map(str::to_string),
                ..ObjectMeta::default()
            },
            spec: Some(lease_spec(record)),
        }
    }

    fn api_error(&self, source: kube::Error) -> LeaderElectionError {
        LeaderElectionError::from_kube(self.describe(), source)
    }
}

#[async_trait]
impl ResourceLock for LeaseLock {
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaderElectionError> {
        let lease = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| self.api_error(e))?;

        Ok(lease.map(|lease| VersionedRecord {
            record: lease.spec.as_ref().map(record_from_spec).unwrap_or_default(),
            resource_version: lease.metadata.resource_version,
        }))
    }

    async fn create(&self, record: &LeaderRecord) -> Result<(), LeaderElectionError> {
        self.api
            .create(&PostParams::default(), &self.lease(record, None))
            .await
            .map_err(|e| self.api_error(e))?;
        Ok(())
    }

    async fn update(
        &self,
        record: &LeaderRecord,
        resource_version: Option<&str>,
    ) -> Result<(), LeaderElectionError> {
        self.api
            .replace(
                &self.name,
                &PostParams::default(),
                &self.lease(record, resource_version),
            )
            .await
            .map_err(|e| self.api_error(e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("Lease {}/{}", self.namespace, self.name)
    }
}

#[must_use]
pub fn lease_spec(record: &LeaderRecord) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(record.holder_identity.clone()),
        lease_duration_seconds: Some(record.lease_duration_secs),
        acquire_time: record.acquire_time.map(MicroTime),
        renew_time: record.renew_time.map(MicroTime),
        lease_transitions: Some(record.leader_transitions),
        ..LeaseSpec::default()
    }
}

#[must_use]
pub fn record_from_spec(spec: &LeaseSpec) -> LeaderRecord {
    LeaderRecord {
        holder_identity: spec.holder_identity.clone().unwrap_or_default(),
        lease_duration_secs: spec.lease_duration_seconds.unwrap_or_default(),
        acquire_time: spec.acquire_time.as_ref().map(|t| t.0),
        renew_time: spec.renew_time.as_ref().map(|t| t.0),
        leader_transitions: spec.lease_transitions.unwrap_or_default(),
    }
}

pub struct ConfigMapLock {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl std::fmt::Debug for ConfigMapLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// JSON layout of the leader annotation
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotationRecord {
    #[serde(default)]
    holder_identity: String,
    #[serde(default)]
    lease_duration_seconds: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acquire_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    renew_time: Option<String>,
    #[serde(default)]
    leader_transitions: i32,
}

impl ConfigMapLock {
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn config_map(
        &self,
        record: &LeaderRecord,
        resource_version: Option<&str>,
    ) -> Result<ConfigMap, LeaderElectionError> {
        let annotation = encode_annotation(record).map_err(|source| LeaderElectionError::Record {
            lock: self.describe(),
            source,
        })?;
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: resource_version.map(str::to_string),
                annotations: Some(BTreeMap::from([(
                    CONFIGMAP_LEADER_ANNOTATION.to_string(),
                    annotation,
                )])),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        })
    }

    fn api_error(&self, source: kube::Error) -> LeaderElectionError {
        LeaderElectionError::from_kube(self.describe(), source)
    }
}

#[async_trait]
impl ResourceLock for ConfigMapLock {
    async fn get(&self) -> Result<Option<VersionedRecord>, LeaderElectionError> {
        let Some(config_map) = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| self.api_error(e))?
        else {
            return Ok(None);
        };

        let record = match config_map
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CONFIGMAP_LEADER_ANNOTATION))
        {
            Some(raw) => decode_annotation(raw).map_err(|source| LeaderElectionError::Record {
                lock: self.describe(),
                source,
            })?,
            None => LeaderRecord::default(),
        };

        Ok(Some(VersionedRecord {
            record,
            resource_version: config_map.metadata.resource_version,
        }))
    }

    async fn create(&self, record: &LeaderRecord) -> Result<(), LeaderElectionError> {
        let config_map = self.config_map(record, None)?;
        self.api
            .create(&PostParams::default(), &config_map)
            .await
            .map_err(|e| self.api_error(e))?;
        Ok(())
    }

    async fn update(
        &self,
        record: &LeaderRecord,
        resource_version: Option<&str>,
    ) -> Result<(), LeaderElectionError> {
        // Merge patch leaves the ConfigMap's data and other annotations alone;
        // the embedded resourceVersion still makes the write conditional
        let config_map = self.config_map(record, resource_version)?;
        let patch = serde_json::json!({ "metadata": config_map.metadata });
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| self.api_error(e))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("ConfigMap {}/{}", self.namespace, self.name)
    }
}

/// Serialize a record into the leader annotation value
///
/// # Errors
///
/// Only fails if serialization itself fails.
pub fn encode_annotation(record: &LeaderRecord) -> Result<String, serde_json::Error> {
    serde_json::to_string(&AnnotationRecord {
        holder_identity: record.holder_identity.clone(),
        lease_duration_seconds: record.lease_duration_secs,
        acquire_time: record.acquire_time.map(rfc3339_micros),
        renew_time: record.renew_time.map(rfc3339_micros),
        leader_transitions: record.leader_transitions,
    })
}

fn rfc3339_micros(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a leader annotation value. Unparseable timestamps are dropped.
///
/// # Errors
///
/// Fails when the value is not a JSON leader record.
pub fn decode_annotation(raw: &str) -> Result<LeaderRecord, serde_json::Error> {
    let record: AnnotationRecord = serde_json::from_str(raw)?;
    Ok(LeaderRecord {
        holder_identity: record.holder_identity,
        lease_duration_secs: record.lease_duration_seconds,
        acquire_time: record.acquire_time.and_then(|t| t.parse().ok()),
        renew_time: record.renew_time.and_then(|t| t.parse().ok()),
        leader_transitions: record.leader_transitions,
    })
}
