//! The Endpoints kind: where a service's backing replicas actually live.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{metadata::ObjectMeta, Kind, Object};

/// One cluster's slice of a service's endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointSlice {
    pub num_endpoints: u32,

    /// Whether this slice has been exported over a link to the service's
    /// primary cluster.
    #[serde(default)]
    pub exposed_to_cluster: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointsSpec {
    /// Labels identifying the service these endpoints belong to.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// `cluster -> slice`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, EndpointSlice>,

    /// The cluster the service is primarily reachable from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_cluster: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoints {
    #[serde(default = "endpoints_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: EndpointsSpec,
}

fn endpoints_kind() -> Kind {
    Kind::Endpoints
}

impl Endpoints {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Endpoints {
            kind: Kind::Endpoints,
            metadata: ObjectMeta::namespaced(name, namespace),
            spec: EndpointsSpec::default(),
        }
    }
}

impl Object for Endpoints {
    const KIND: Kind = Kind::Endpoints;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
