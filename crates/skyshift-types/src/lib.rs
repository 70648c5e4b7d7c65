//! The SkyShift object model.
//!
//! Every object the control plane stores is one of the [`Kind`]s defined
//! here. All kinds share the same envelope: `kind`, [`ObjectMeta`], a
//! kind-specific `spec` and a kind-specific `status`. Decoding always goes
//! through [`codec`], which is the single place where schema validation and
//! default injection happen.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

pub mod codec;
pub mod conditions;
pub mod kinds;
pub mod labels;
pub mod metadata;
pub mod quantity;
pub mod resources;
pub mod validation;

pub use crate::{
    codec::{decode, decode_value, encode, CodecError},
    metadata::{ObjectMeta, ObjectRef},
};

/// The closed set of object kinds known to the control plane.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
pub enum Kind {
    Cluster,
    Job,
    Service,
    Endpoints,
    Link,
    FilterPolicy,
    Namespace,
    Role,
    User,
    Invite,
}

impl Kind {
    /// Whether objects of this kind are scoped to a namespace.
    ///
    /// Global kinds are keyed by bare name, namespaced kinds under
    /// `<namespace>/<name>`.
    pub fn is_namespaced(&self) -> bool {
        matches!(
            self,
            Kind::Job | Kind::Service | Kind::Endpoints | Kind::FilterPolicy
        )
    }
}

/// A typed, storable object.
///
/// The associated constant ties the Rust type to its [`Kind`]; `validate`
/// returns every schema violation found (not just the first one) so the API
/// can surface them all at once.
pub trait Object:
    Clone + std::fmt::Debug + Serialize + serde::de::DeserializeOwned + Send + Sync + 'static
{
    const KIND: Kind;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Injects defaults for fields the caller omitted. Called by the codec
    /// before validation.
    fn apply_defaults(&mut self) {}

    /// Kind-specific cross-field validation. Metadata (name, namespace) is
    /// validated by the codec for every kind.
    fn validate(&self) -> Result<(), Vec<String>> {
        Ok(())
    }

    fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            kind: Self::KIND,
            namespace: self.metadata().namespace.clone(),
            name: self.metadata().name.clone(),
        }
    }
}
