//! # Ownership
//!
//! Data-driven registry of the controllers whose pods are batch workloads.
//! New workload owners are added as predicates; dispatch never branches on kinds.

use crate::controller::snapshot::OwnerRef;

/// How an owner reference's `apiVersion` is matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiVersionMatcher {
    Exact(String),
    Prefix(String),
}

impl ApiVersionMatcher {
    #[must_use]
    pub fn matches(&self, api_version: &str) -> bool {
        match self {
            ApiVersionMatcher::Exact(expected) => api_version == expected,
            ApiVersionMatcher::Prefix(prefix) => api_version.starts_with(prefix.as_str()),
        }
    }
}

/// Identifies one kind of workload-owning controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipPredicate {
    pub api_version: ApiVersionMatcher,
    pub kind: String,
}

impl OwnershipPredicate {
    pub fn exact(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: ApiVersionMatcher::Exact(api_version.into()),
            kind: kind.into(),
        }
    }

    pub fn prefix(api_version_prefix: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: ApiVersionMatcher::Prefix(api_version_prefix.into()),
            kind: kind.into(),
        }
    }

    #[must_use]
    pub fn matches(&self, owner: &OwnerRef) -> bool {
        owner.kind == self.kind && self.api_version.matches(&owner.api_version)
    }
}

#[derive(Debug, Clone)]
pub struct OwnershipRegistry {
    predicates: Vec<OwnershipPredicate>,
}

impl Default for OwnershipRegistry {
    /// Kubernetes Jobs and Argo Workflows
    fn default() -> Self {
        Self::empty()
            .with(OwnershipPredicate::exact("batch/v1", "Job"))
            .with(OwnershipPredicate::prefix("argoproj.io/", "Workflow"))
    }
}

impl OwnershipRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            predicates: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, predicate: OwnershipPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// True when any owner reference satisfies any predicate
    #[must_use]
    pub fn is_owned(&self, owners: &[OwnerRef]) -> bool {
        owners
            .iter()
            .any(|owner| self.predicates.iter().any(|p| p.matches(owner)))
    }

    pub fn predicates(&self) -> &[OwnershipPredicate] {
        &self.predicates
    }
}
