//! The Namespace kind. Deleting a namespace cascades to every namespaced
//! object keyed under it.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{metadata::ObjectMeta, Kind, Object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NamespacePhase {
    #[default]
    Active,
    Terminating,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceStatus {
    #[serde(default)]
    pub phase: NamespacePhase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Namespace {
    #[serde(default = "namespace_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NamespaceStatus,
}

fn namespace_kind() -> Kind {
    Kind::Namespace
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Namespace {
            kind: Kind::Namespace,
            metadata: ObjectMeta::named(name),
            status: NamespaceStatus::default(),
        }
    }
}

impl Object for Namespace {
    const KIND: Kind = Kind::Namespace;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        crate::validation::validate_namespace_name(&self.metadata.name)
    }
}
