//! The Service kind: a stable virtual endpoint over job replicas, possibly
//! spanning clusters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{conditions::Condition, metadata::ObjectMeta, Kind, Object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicePort {
    #[serde(default)]
    pub protocol: Protocol,

    pub port: u16,

    pub target_port: u16,

    /// Only legal when the service type is `NodePort`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    #[serde(rename = "type", default)]
    pub service_type: ServiceType,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,

    /// The cluster hosting the service's primary endpoint; `None` lets the
    /// service controller pick one of the selected job's clusters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_cluster: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    #[serde(default = "service_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
    #[serde(default)]
    pub status: ServiceStatus,
}

fn service_kind() -> Kind {
    Kind::Service
}

impl Service {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Service {
            kind: Kind::Service,
            metadata: ObjectMeta::namespaced(name, namespace),
            spec: ServiceSpec::default(),
            status: ServiceStatus::default(),
        }
    }
}

impl Object for Service {
    const KIND: Kind = Kind::Service;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = vec![];
        for port in &self.spec.ports {
            if port.node_port.is_some() && self.spec.service_type != ServiceType::NodePort {
                errors.push(format!(
                    "node_port on port {} requires service type NodePort, got {}",
                    port.port, self.spec.service_type
                ));
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_port_requires_node_port_type() {
        let mut service = Service::new("default", "svc");
        service.spec.ports.push(ServicePort {
            protocol: Protocol::Tcp,
            port: 80,
            target_port: 8080,
            node_port: Some(30080),
        });

        assert!(service.validate().is_err());

        service.spec.service_type = ServiceType::NodePort;
        assert!(service.validate().is_ok());
    }
}
