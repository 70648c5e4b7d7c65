//! The Link kind: a bidirectional mesh tunnel between two clusters.

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{conditions::Condition, metadata::ObjectMeta, Kind, Object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    #[default]
    Init,
    Active,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkSpec {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkStatus {
    #[serde(default)]
    pub phase: LinkState,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Link {
    #[serde(default = "link_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LinkSpec,
    #[serde(default)]
    pub status: LinkStatus,
}

fn link_kind() -> Kind {
    Kind::Link
}

impl Link {
    pub fn new(name: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Link {
            kind: Kind::Link,
            metadata: ObjectMeta::named(name),
            spec: LinkSpec {
                source: source.into(),
                target: target.into(),
            },
            status: LinkStatus::default(),
        }
    }

    /// Whether this link connects `a` and `b`, in either direction.
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.spec.source == a && self.spec.target == b)
            || (self.spec.source == b && self.spec.target == a)
    }
}

impl Object for Link {
    const KIND: Kind = Kind::Link;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = vec![];
        if self.spec.source.is_empty() || self.spec.target.is_empty() {
            errors.push("link must name both a source and a target cluster".to_string());
        } else if self.spec.source == self.spec.target {
            errors.push("link source and target must differ".to_string());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
