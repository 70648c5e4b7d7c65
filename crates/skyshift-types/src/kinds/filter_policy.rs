//! The FilterPolicy kind: namespace-wide placement constraints applied to
//! every job in the namespace on top of the job's own filters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{metadata::ObjectMeta, Kind, Object};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterFilter {
    /// Cluster names allowed by this policy. Empty means "all".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Cluster names rejected by this policy. Exclusion wins over inclusion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterPolicySpec {
    #[serde(default)]
    pub cluster_filter: ClusterFilter,

    /// Only jobs carrying these labels are subject to the policy. Empty
    /// selects every job in the namespace.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterPolicy {
    #[serde(default = "filter_policy_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: FilterPolicySpec,
}

fn filter_policy_kind() -> Kind {
    Kind::FilterPolicy
}

impl FilterPolicy {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        FilterPolicy {
            kind: Kind::FilterPolicy,
            metadata: ObjectMeta::namespaced(name, namespace),
            spec: FilterPolicySpec::default(),
        }
    }

    /// Whether this policy constrains the given job labels.
    pub fn applies_to(&self, job_labels: &BTreeMap<String, String>) -> bool {
        self.spec
            .labels_selector
            .iter()
            .all(|(key, value)| job_labels.get(key) == Some(value))
    }

    /// Whether `cluster` survives this policy's include/exclude lists.
    pub fn permits(&self, cluster: &str) -> bool {
        if self.spec.cluster_filter.exclude.iter().any(|c| c == cluster) {
            return false;
        }
        self.spec.cluster_filter.include.is_empty()
            || self.spec.cluster_filter.include.iter().any(|c| c == cluster)
    }
}

impl Object for FilterPolicy {
    const KIND: Kind = Kind::FilterPolicy;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
