//! The single decode/encode point for stored objects.
//!
//! Every payload entering the control plane passes through [`decode`]:
//! unknown fields are rejected by the per-kind schemas, defaults are
//! injected, and validation runs before the object is handed to the store.
//! Encoding produces the canonical form: stable field order (all maps are
//! B-tree backed) with omitted optionals rather than nulls.

use chrono::Utc;
use snafu::{ResultExt, Snafu};

use crate::{Kind, Object};

pub type Result<T, E = CodecError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum CodecError {
    #[snafu(display("failed to deserialize object"))]
    Deserialize { source: serde_json::Error },

    #[snafu(display("failed to serialize object"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("invalid object: {}", errors.join("; ")))]
    InvalidObject { errors: Vec<String> },

    #[snafu(display("object declares kind {declared} but {expected} was expected"))]
    KindMismatch { declared: Kind, expected: Kind },
}

/// Decodes, defaults and validates an object from its serialized form.
pub fn decode<T: Object>(bytes: &[u8]) -> Result<T> {
    let object: T = serde_json::from_slice(bytes).context(DeserializeSnafu)?;
    finish(object)
}

/// Like [`decode`] but starting from an already-parsed JSON value.
pub fn decode_value<T: Object>(value: serde_json::Value) -> Result<T> {
    let object: T = serde_json::from_value(value).context(DeserializeSnafu)?;
    finish(object)
}

fn finish<T: Object>(mut object: T) -> Result<T> {
    object.apply_defaults();

    let declared = declared_kind(&object)?;
    if declared != T::KIND {
        return KindMismatchSnafu {
            declared,
            expected: T::KIND,
        }
        .fail();
    }

    let mut errors = validate_metadata::<T>(&object);
    if let Err(kind_errors) = object.validate() {
        errors.extend(kind_errors);
    }
    if !errors.is_empty() {
        return InvalidObjectSnafu { errors }.fail();
    }

    if object.metadata().creation_timestamp.is_none() {
        object.metadata_mut().creation_timestamp = Some(Utc::now());
    }

    Ok(object)
}

/// Encodes an object into its canonical serialized form.
pub fn encode<T: Object>(object: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(object).context(SerializeSnafu)
}

// The kind field is declared on each concrete type, so read it back out of
// the serialized form rather than requiring another trait method.
fn declared_kind<T: Object>(object: &T) -> Result<Kind> {
    let value = serde_json::to_value(object).context(SerializeSnafu)?;
    match value.get("kind") {
        Some(kind) => serde_json::from_value(kind.clone()).context(DeserializeSnafu),
        None => Ok(T::KIND),
    }
}

fn validate_metadata<T: Object>(object: &T) -> Vec<String> {
    let mut errors = vec![];
    let meta = object.metadata();

    if let Err(name_errors) = crate::validation::validate_object_name(&meta.name) {
        errors.extend(
            name_errors
                .into_iter()
                .map(|e| format!("metadata.name: {e}")),
        );
    }

    match (&meta.namespace, T::KIND.is_namespaced()) {
        (None, true) => errors.push(format!(
            "metadata.namespace is required for namespaced kind {}",
            T::KIND
        )),
        (Some(_), false) => errors.push(format!(
            "metadata.namespace must not be set for global kind {}",
            T::KIND
        )),
        (Some(namespace), true) => {
            if let Err(ns_errors) = crate::validation::validate_namespace_name(namespace) {
                errors.extend(
                    ns_errors
                        .into_iter()
                        .map(|e| format!("metadata.namespace: {e}")),
                );
            }
        }
        (None, false) => {}
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{Cluster, Job};

    #[test]
    fn decode_injects_creation_timestamp() {
        let job: Job = decode_value(serde_json::json!({
            "metadata": { "name": "j1", "namespace": "default" },
            "spec": { "image": "ubuntu:22.04" },
        }))
        .expect("job must decode");

        assert!(job.metadata.creation_timestamp.is_some());
    }

    #[test]
    fn decode_rejects_missing_namespace() {
        let result = decode_value::<Job>(serde_json::json!({
            "metadata": { "name": "j1" },
            "spec": { "image": "ubuntu:22.04" },
        }));
        assert!(matches!(result, Err(CodecError::InvalidObject { .. })));
    }

    #[test]
    fn decode_rejects_namespace_on_global_kind() {
        let result = decode_value::<Cluster>(serde_json::json!({
            "metadata": { "name": "c1", "namespace": "default" },
        }));
        assert!(matches!(result, Err(CodecError::InvalidObject { .. })));
    }

    #[test]
    fn decode_rejects_kind_mismatch() {
        let result = decode_value::<Job>(serde_json::json!({
            "kind": "Cluster",
            "metadata": { "name": "j1", "namespace": "default" },
            "spec": { "image": "ubuntu:22.04" },
        }));
        assert!(matches!(result, Err(CodecError::KindMismatch { .. })));
    }

    #[test]
    fn decode_rejects_bad_names() {
        let result = decode_value::<Cluster>(serde_json::json!({
            "metadata": { "name": "Not-A-Name" },
        }));
        assert!(matches!(result, Err(CodecError::InvalidObject { .. })));
    }

    #[test]
    fn encode_omits_empty_optionals() {
        let cluster = Cluster::new("c1");
        let bytes = encode(&cluster).expect("cluster must encode");
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).expect("encoded form is json");
        assert!(value["metadata"].get("labels").is_none());
        assert!(value["spec"].get("config_path").is_none());
    }
}
