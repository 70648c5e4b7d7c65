//! The Cluster kind: a registered compute cluster the scheduler may place
//! replicas on.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    conditions::Condition,
    metadata::ObjectMeta,
    quantity::{CpuQuantity, MemoryQuantity},
    resources::NodeResourceMap,
    Kind, Object,
};

/// Which cluster manager fronts this cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ManagerType {
    #[default]
    K8,
    Slurm,
    Ray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterState {
    #[default]
    Init,
    Provisioning,
    Ready,
    Error,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSpec {
    #[serde(default)]
    pub manager: ManagerType,

    /// Path to the manager's access configuration, e.g. a kubeconfig for
    /// Kubernetes clusters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,

    /// Manager-specific access settings (SSH host and user for Slurm, the
    /// head node address for Ray).
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub access_config: std::collections::BTreeMap<String, String>,

    #[serde(default = "default_num_nodes")]
    pub num_nodes: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<CpuQuantity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryQuantity>,

    /// Disk size per node in GiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<u32>,

    /// Accelerator specification, e.g. `V100:4`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerators: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Whether the cluster is provisioned by the control plane (as opposed
    /// to attaching to an existing one).
    #[serde(default)]
    pub provision: bool,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        ClusterSpec {
            manager: ManagerType::default(),
            config_path: None,
            access_config: Default::default(),
            num_nodes: default_num_nodes(),
            cpus: None,
            memory: None,
            disk_size: None,
            accelerators: None,
            ports: Vec::new(),
            cloud: None,
            region: None,
            provision: false,
        }
    }
}

fn default_num_nodes() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterStatus {
    #[serde(default)]
    pub status: ClusterState,

    /// Total capacity, `node name -> resource name -> quantity`.
    #[serde(default, skip_serializing_if = "NodeResourceMap::is_empty")]
    pub capacity: NodeResourceMap,

    /// Capacity not currently claimed by workloads. Never exceeds
    /// `capacity` for any resource.
    #[serde(default, skip_serializing_if = "NodeResourceMap::is_empty")]
    pub allocatable_capacity: NodeResourceMap,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Cluster {
    #[serde(default = "cluster_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

fn cluster_kind() -> Kind {
    Kind::Cluster
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Cluster {
            kind: Kind::Cluster,
            metadata: ObjectMeta::named(name),
            spec: ClusterSpec::default(),
            status: ClusterStatus::default(),
        }
    }
}

impl Object for Cluster {
    const KIND: Kind = Kind::Cluster;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = vec![];
        if self.spec.num_nodes == 0 {
            errors.push("num_nodes must be at least 1".to_string());
        }
        if self.spec.provision && self.spec.cloud.is_none() {
            errors.push("provisioned clusters must name a cloud".to_string());
        }
        for (node, allocatable) in &self.status.allocatable_capacity {
            let capacity = self.status.capacity.get(node);
            for (resource, quantity) in allocatable {
                let cap = capacity
                    .and_then(|resources| resources.get(resource))
                    .copied()
                    .unwrap_or(0.0);
                if *quantity > cap {
                    errors.push(format!(
                        "allocatable {resource} on node {node} ({quantity}) exceeds capacity ({cap})"
                    ));
                }
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

impl Cluster {
    pub fn is_ready(&self) -> bool {
        self.status.status == ClusterState::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_allocatable_above_capacity() {
        let cluster: Cluster = serde_json::from_value(serde_json::json!({
            "kind": "Cluster",
            "metadata": { "name": "c1" },
            "status": {
                "capacity": { "node-a": { "cpus": 2.0 } },
                "allocatable_capacity": { "node-a": { "cpus": 4.0 } },
            },
        }))
        .expect("cluster must deserialize");

        let errors = cluster.validate().expect_err("validation must fail");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("exceeds capacity"));
    }

    #[test]
    fn manager_types_parse_from_lowercase() {
        assert_eq!("k8".parse::<ManagerType>().ok(), Some(ManagerType::K8));
        assert_eq!("slurm".parse::<ManagerType>().ok(), Some(ManagerType::Slurm));
        assert_eq!("ray".parse::<ManagerType>().ok(), Some(ManagerType::Ray));
    }
}
