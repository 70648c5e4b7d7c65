//! The metadata envelope shared by every object kind.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Kind;

/// Metadata carried by every stored object.
///
/// `resource_version` is the per-object optimistic concurrency token: it
/// starts at 1 on create and is incremented by every mutation, including
/// status writes. `generation` only moves when the spec changes, so
/// controllers can tell "the user changed something" apart from "somebody
/// wrote status".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub resource_version: u64,

    #[serde(default)]
    pub generation: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        ObjectMeta {
            name: name.into(),
            ..ObjectMeta::default()
        }
    }

    pub fn namespaced(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        ObjectMeta {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..ObjectMeta::default()
        }
    }
}

/// A reference to an object: kind plus its bucket-unique identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn global(kind: Kind, name: impl Into<String>) -> Self {
        ObjectRef {
            kind,
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectRef {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}/{}", self.kind, namespace, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ref_display() {
        let global = ObjectRef::global(Kind::Cluster, "c1");
        assert_eq!(global.to_string(), "Cluster/c1");

        let namespaced = ObjectRef::namespaced(Kind::Job, "default", "j1");
        assert_eq!(namespaced.to_string(), "Job/default/j1");
    }

    #[test]
    fn metadata_defaults_are_empty() {
        let meta = ObjectMeta::named("c1");
        assert_eq!(meta.resource_version, 0);
        assert_eq!(meta.generation, 0);
        assert!(meta.labels.is_empty());
        assert!(meta.creation_timestamp.is_none());
    }
}
