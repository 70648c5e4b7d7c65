//! The transactional KV contract the object store is built on.
//!
//! The driver owns three guarantees: per-key linearizability (writes to one
//! key are serialized and versioned), compare-and-swap, and ordered watch
//! delivery per prefix. Watch events carry a store-wide monotone sequence
//! number; a bounded replay buffer lets consumers resume from a recent
//! sequence without relisting.

use async_trait::async_trait;
use futures::stream::BoxStream;
use snafu::Snafu;

/// Version numbers are store-wide sequence values; a key's version is the
/// sequence at its last mutation, so versions are monotone per key as well.
pub type Version = u64;

pub type Result<T, E = KvError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum KvError {
    #[snafu(display("key {key:?} not found"))]
    KeyNotFound { key: String },

    #[snafu(display("key {key:?} already exists"))]
    KeyExists { key: String },

    #[snafu(display("version conflict on {key:?}: expected {expected}, found {actual}"))]
    VersionConflict {
        key: String,
        expected: Version,
        actual: Version,
    },

    /// The requested resume point has aged out of the replay buffer; the
    /// consumer must relist and resume from the returned snapshot.
    #[snafu(display("watch resume from {from} is past the replay window (oldest retained: {oldest})"))]
    WatchGap { from: Version, oldest: Version },

    /// The consumer fell behind the live event flow and was disconnected.
    #[snafu(display("watch consumer lagged behind by {missed} events"))]
    WatchLagged { missed: u64 },

    #[snafu(display("corrupt entry under {key:?}"))]
    Corrupt { key: String },

    #[snafu(display("storage backend error"))]
    Backend { source: sled::Error },
}

impl KvError {
    /// Whether retrying with backoff can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Backend { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Add,
    Update,
    Delete,
}

/// A stored key/value pair and the version of its last mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub version: Version,
}

/// A watch event. Delete events carry the last stored value so consumers
/// can tell what disappeared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub event_type: EventType,
    pub key: String,
    pub value: Vec<u8>,
    pub version: Version,
}

/// Expectations a mutation can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expectation {
    /// Write regardless of current state.
    #[default]
    Any,
    /// The key must not exist (create semantics).
    Absent,
    /// The key must exist with exactly this version.
    Version(Version),
}

pub type EventStream = BoxStream<'static, Result<KvEvent>>;

/// A durable, versioned KV store with prefix range and watch.
#[async_trait]
pub trait KvDriver: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Writes `value` under `key`, enforcing `expected`. Returns the new
    /// version.
    async fn put(&self, key: &str, value: Vec<u8>, expected: Expectation) -> Result<Version>;

    /// Removes `key`, enforcing `expected`. Returns the deleted entry.
    async fn delete(&self, key: &str, expected: Expectation) -> Result<KvEntry>;

    /// All entries under `prefix`, in key order.
    async fn range(&self, prefix: &str) -> Result<Vec<KvEntry>>;

    /// Like [`range`](KvDriver::range), but also returns the sequence the
    /// snapshot was taken at, for use as a watch resume point.
    async fn snapshot(&self, prefix: &str) -> Result<(Vec<KvEntry>, Version)>;

    /// Events for keys under `prefix`.
    ///
    /// With `from = Some(v)` the stream replays retained events with
    /// sequence `>= v` before going live; [`KvError::WatchGap`] is yielded
    /// if `v` has aged out. With `from = None` the stream is live-only.
    async fn watch(&self, prefix: &str, from: Option<Version>) -> Result<EventStream>;
}
