//! The typed, versioned object store.
//!
//! Keyspace: `/<kind>/<namespace>/<name>` for namespaced kinds and
//! `/<kind>/<name>` for global ones. Every mutation enforces optimistic
//! concurrency over `metadata.resource_version` (per object, starting at 1)
//! and is fanned out to watch streams with a store-wide sequence number
//! usable as a resume cursor.

use std::sync::Arc;

use futures::{stream::BoxStream, StreamExt};
use snafu::{ResultExt, Snafu};
use skyshift_types::{
    codec::{self, CodecError},
    kinds::{Namespace, NamespacePhase},
    Kind, Object,
};
use tracing::debug;

use crate::kv::{EventType, Expectation, KvDriver, KvError, Version};

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// The uniform error taxonomy surfaced through the API.
#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("invalid object"))]
    InvalidObject { source: CodecError },

    #[snafu(display("{reference} already exists"))]
    AlreadyExists { reference: String },

    #[snafu(display("{reference} not found"))]
    NotFound { reference: String },

    #[snafu(display("conflicting write to {reference}: expected resource version {expected}, found {actual}"))]
    Conflict {
        reference: String,
        expected: u64,
        actual: u64,
    },

    #[snafu(display("watch resume point is past the replay window (oldest retained: {oldest}); relist required"))]
    WatchGap { oldest: Version },

    #[snafu(display("watch consumer lagged behind by {missed} events; relist required"))]
    Lagged { missed: u64 },

    #[snafu(display("stored object under {key:?} is corrupt"))]
    Corrupt { key: String, source: CodecError },

    #[snafu(display("storage backend failure"))]
    Storage { source: KvError },
}

impl StoreError {
    /// Whether a relist (rather than a retry or a user fix) is the remedy.
    pub fn requires_relist(&self) -> bool {
        matches!(self, StoreError::WatchGap { .. } | StoreError::Lagged { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Storage { source } if source.is_transient())
    }
}

fn map_kv_error(reference: &str, error: KvError) -> StoreError {
    match error {
        KvError::KeyNotFound { .. } => StoreError::NotFound {
            reference: reference.to_string(),
        },
        KvError::KeyExists { .. } => StoreError::AlreadyExists {
            reference: reference.to_string(),
        },
        // Driver-level conflicts only happen when two writers raced between
        // read and write; the caller observed a stale object either way.
        KvError::VersionConflict {
            expected, actual, ..
        } => StoreError::Conflict {
            reference: reference.to_string(),
            expected,
            actual,
        },
        KvError::WatchGap { oldest, .. } => StoreError::WatchGap { oldest },
        KvError::WatchLagged { missed } => StoreError::Lagged { missed },
        other => StoreError::Storage { source: other },
    }
}

/// A typed watch event. `version` is the store-wide sequence usable as a
/// resume cursor; delete events carry the object's last state.
#[derive(Debug, Clone)]
pub struct ObjectEvent<T> {
    pub event_type: EventType,
    pub object: T,
    pub version: Version,
}

/// A list result plus the sequence it was taken at.
#[derive(Debug, Clone)]
pub struct ObjectList<T> {
    pub items: Vec<T>,
    pub revision: Version,
}

pub type ObjectStream<T> = BoxStream<'static, Result<ObjectEvent<T>>>;

pub fn object_key(kind: Kind, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("/{kind}/{namespace}/{name}"),
        None => format!("/{kind}/{name}"),
    }
}

pub fn kind_prefix(kind: Kind, namespace: Option<&str>) -> String {
    match namespace {
        Some(namespace) => format!("/{kind}/{namespace}/"),
        None => format!("/{kind}/"),
    }
}

#[derive(Clone)]
pub struct ObjectStore {
    driver: Arc<dyn KvDriver>,
}

impl ObjectStore {
    pub fn new(driver: Arc<dyn KvDriver>) -> Self {
        ObjectStore { driver }
    }

    fn key_for<T: Object>(object: &T) -> String {
        object_key(
            T::KIND,
            object.metadata().namespace.as_deref(),
            &object.metadata().name,
        )
    }

    /// Persists a new object. Fails with [`StoreError::AlreadyExists`] on a
    /// key collision; the stored object gets `resource_version = 1`.
    pub async fn create<T: Object>(&self, mut object: T) -> Result<T> {
        let key = Self::key_for(&object);
        let reference = object.object_ref().to_string();

        {
            let meta = object.metadata_mut();
            meta.resource_version = 1;
            meta.generation = 1;
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = Some(chrono::Utc::now());
            }
        }

        let payload = codec::encode(&object).context(InvalidObjectSnafu)?;
        self.driver
            .put(&key, payload, Expectation::Absent)
            .await
            .map_err(|e| map_kv_error(&reference, e))?;

        debug!(%reference, "object created");
        Ok(object)
    }

    /// Replaces an object, enforcing the caller's `resource_version`.
    /// `generation` moves only when the spec changed.
    pub async fn update<T: Object>(&self, object: T) -> Result<T> {
        self.write_existing(object, false).await
    }

    /// The status mutation path: spec, labels and annotations are taken
    /// from the stored object, only status is applied. Bumps
    /// `resource_version` but never `generation`.
    pub async fn update_status<T: Object>(&self, object: T) -> Result<T> {
        self.write_existing(object, true).await
    }

    async fn write_existing<T: Object>(&self, mut object: T, status_only: bool) -> Result<T> {
        let key = Self::key_for(&object);
        let reference = object.object_ref().to_string();

        let entry = self
            .driver
            .get(&key)
            .await
            .map_err(|e| map_kv_error(&reference, e))?
            .ok_or_else(|| StoreError::NotFound {
                reference: reference.clone(),
            })?;
        let current: T = codec::decode(&entry.value).context(CorruptSnafu { key: key.clone() })?;

        let current_meta = current.metadata();
        if object.metadata().resource_version != current_meta.resource_version {
            return Err(StoreError::Conflict {
                reference,
                expected: object.metadata().resource_version,
                actual: current_meta.resource_version,
            });
        }

        let mut next = if status_only {
            // Graft the caller's status onto the stored spec.
            let mut stored = serde_json::to_value(&current).context(SerializeSnafu)?;
            let incoming = serde_json::to_value(&object).context(SerializeSnafu)?;
            if let Some(status) = incoming.get("status") {
                stored["status"] = status.clone();
            }
            codec::decode_value::<T>(stored).context(InvalidObjectSnafu)?
        } else {
            object
        };

        let spec_changed = {
            let before = serde_json::to_value(&current).context(SerializeSnafu)?;
            let after = serde_json::to_value(&next).context(SerializeSnafu)?;
            before.get("spec") != after.get("spec")
        };

        {
            let current_generation = current_meta.generation;
            let current_version = current_meta.resource_version;
            let creation_timestamp = current_meta.creation_timestamp;
            let meta = next.metadata_mut();
            meta.resource_version = current_version + 1;
            meta.generation = if spec_changed && !status_only {
                current_generation + 1
            } else {
                current_generation
            };
            meta.creation_timestamp = creation_timestamp;
        }

        let payload = codec::encode(&next).context(InvalidObjectSnafu)?;
        self.driver
            .put(&key, payload, Expectation::Version(entry.version))
            .await
            .map_err(|e| map_kv_error(&reference, e))?;

        Ok(next)
    }

    pub async fn get<T: Object>(&self, namespace: Option<&str>, name: &str) -> Result<T> {
        let key = object_key(T::KIND, namespace, name);
        let entry = self
            .driver
            .get(&key)
            .await
            .map_err(|e| map_kv_error(&key, e))?
            .ok_or_else(|| StoreError::NotFound {
                reference: key.clone(),
            })?;
        codec::decode(&entry.value).context(CorruptSnafu { key })
    }

    pub async fn list<T: Object>(&self, namespace: Option<&str>) -> Result<ObjectList<T>> {
        let prefix = kind_prefix(T::KIND, namespace);
        let (entries, revision) = self
            .driver
            .snapshot(&prefix)
            .await
            .map_err(|e| map_kv_error(&prefix, e))?;

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            items.push(codec::decode(&entry.value).context(CorruptSnafu {
                key: entry.key.clone(),
            })?);
        }
        Ok(ObjectList { items, revision })
    }

    /// Deletes an object, optionally enforcing a `resource_version`.
    /// Returns the last stored state.
    pub async fn delete<T: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        expected_version: Option<u64>,
    ) -> Result<T> {
        let key = object_key(T::KIND, namespace, name);
        let entry = self
            .driver
            .get(&key)
            .await
            .map_err(|e| map_kv_error(&key, e))?
            .ok_or_else(|| StoreError::NotFound {
                reference: key.clone(),
            })?;
        let current: T = codec::decode(&entry.value).context(CorruptSnafu { key: key.clone() })?;

        if let Some(expected) = expected_version {
            let actual = current.metadata().resource_version;
            if expected != actual {
                return Err(StoreError::Conflict {
                    reference: key,
                    expected,
                    actual,
                });
            }
        }

        self.driver
            .delete(&key, Expectation::Version(entry.version))
            .await
            .map_err(|e| map_kv_error(&key, e))?;

        debug!(reference = %key, "object deleted");
        Ok(current)
    }

    /// A watch stream over a kind (optionally one namespace).
    ///
    /// With `from = None`: synthetic ADD events for everything currently
    /// stored, then live events. With `from = Some(v)`: replayed events
    /// with sequence `>= v` followed by live events, or
    /// [`StoreError::WatchGap`] if `v` is past the replay window.
    pub async fn watch<T: Object>(
        &self,
        namespace: Option<&str>,
        from: Option<Version>,
    ) -> Result<ObjectStream<T>> {
        let prefix = kind_prefix(T::KIND, namespace);

        let (initial, resume_from) = match from {
            Some(from) => (vec![], from),
            None => {
                let (entries, revision) = self
                    .driver
                    .snapshot(&prefix)
                    .await
                    .map_err(|e| map_kv_error(&prefix, e))?;
                let mut initial = Vec::with_capacity(entries.len());
                for entry in entries {
                    let object: T = codec::decode(&entry.value).context(CorruptSnafu {
                        key: entry.key.clone(),
                    })?;
                    initial.push(Ok(ObjectEvent {
                        event_type: EventType::Add,
                        object,
                        version: entry.version,
                    }));
                }
                (initial, revision + 1)
            }
        };

        let live = self
            .driver
            .watch(&prefix, Some(resume_from))
            .await
            .map_err(|e| map_kv_error(&prefix, e))?
            .map(|item| match item {
                Ok(event) => {
                    let object: T =
                        codec::decode(&event.value).context(CorruptSnafu {
                            key: event.key.clone(),
                        })?;
                    Ok(ObjectEvent {
                        event_type: event.event_type,
                        object,
                        version: event.version,
                    })
                }
                Err(e) => Err(map_kv_error("watch", e)),
            });

        Ok(futures::stream::iter(initial).chain(live).boxed())
    }

    /// Deletes a namespace and everything keyed under it.
    ///
    /// The namespace is first marked `TERMINATING`, then every namespaced
    /// object below it is removed (firing regular DELETE events), then the
    /// Namespace object itself goes.
    pub async fn delete_namespace_cascade(&self, name: &str) -> Result<Namespace> {
        let mut namespace: Namespace = self.get(None, name).await?;
        namespace.status.phase = NamespacePhase::Terminating;
        let namespace = self.update_status(namespace).await?;

        for kind in [Kind::Job, Kind::Service, Kind::Endpoints, Kind::FilterPolicy] {
            let prefix = kind_prefix(kind, Some(name));
            let entries = self
                .driver
                .range(&prefix)
                .await
                .map_err(|e| map_kv_error(&prefix, e))?;
            for entry in entries {
                if let Err(error) = self.driver.delete(&entry.key, Expectation::Any).await {
                    // Another deleter got there first; the cascade goal is
                    // already met for this key.
                    if !matches!(error, KvError::KeyNotFound { .. }) {
                        return Err(map_kv_error(&entry.key, error));
                    }
                }
            }
        }

        self.delete::<Namespace>(None, name, None).await
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("failed to serialize stored object"))]
pub struct SerializeError {
    source: serde_json::Error,
}

// Serialization of an already-decoded object failing means a bug, but it is
// still surfaced as a typed error instead of a panic.
impl From<SerializeError> for StoreError {
    fn from(error: SerializeError) -> Self {
        StoreError::InvalidObject {
            source: CodecError::Serialize {
                source: error.source,
            },
        }
    }
}
