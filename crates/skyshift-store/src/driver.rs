//! The sled-backed [`KvDriver`].
//!
//! Writes are serialized through a single async mutex, which is what gives
//! per-key linearizability and keeps the sequence counter, the replay
//! buffer and the broadcast channel consistent with the tree contents.
//! Values are stored as an 8-byte big-endian version prefix followed by the
//! payload.

use std::{collections::VecDeque, path::Path, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use snafu::ResultExt;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::debug;

use crate::kv::{
    BackendSnafu, EventStream, EventType, Expectation, KvDriver, KvEntry, KvError, KvEvent,
    Result, Version,
};

/// Events retained for watch resume. A resume older than this forces a
/// relist.
const REPLAY_CAPACITY: usize = 1024;

/// Live fan-out buffer per subscriber. A consumer that falls this far
/// behind is disconnected with [`KvError::WatchLagged`].
const BROADCAST_CAPACITY: usize = 256;

const VERSION_PREFIX_LEN: usize = 8;

struct WriteState {
    /// Store-wide sequence of the most recent mutation.
    seq: Version,
    /// Recent events, oldest first.
    buffer: VecDeque<KvEvent>,
    /// Sequence of the oldest event still replayable.
    oldest_retained: Version,
}

pub struct SledDriver {
    tree: sled::Db,
    state: Arc<Mutex<WriteState>>,
    events: broadcast::Sender<KvEvent>,
}

impl SledDriver {
    /// Opens (or creates) the store under `path`.
    ///
    /// The sequence counter resumes above the highest version found on
    /// disk, so versions never regress across restarts. Events from before
    /// the restart are not replayable; consumers resuming from them relist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let tree = sled::open(path).context(BackendSnafu)?;

        let mut seq = 0;
        for entry in tree.iter() {
            let (key, value) = entry.context(BackendSnafu)?;
            let version = decode_version(&key, &value)?;
            seq = seq.max(version);
        }

        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(SledDriver {
            tree,
            state: Arc::new(Mutex::new(WriteState {
                seq,
                buffer: VecDeque::with_capacity(REPLAY_CAPACITY),
                oldest_retained: seq + 1,
            })),
            events,
        })
    }

    fn read_entry(&self, key: &str) -> Result<Option<KvEntry>> {
        match self.tree.get(key.as_bytes()).context(BackendSnafu)? {
            Some(raw) => Ok(Some(split_envelope(key, &raw)?)),
            None => Ok(None),
        }
    }

    fn publish(&self, state: &mut WriteState, event: KvEvent) {
        if state.buffer.len() == REPLAY_CAPACITY {
            if let Some(dropped) = state.buffer.pop_front() {
                state.oldest_retained = dropped.version + 1;
            }
        }
        state.buffer.push_back(event.clone());
        // Send failures just mean nobody is subscribed right now.
        let _ = self.events.send(event);
    }
}

fn decode_version(key: &[u8], raw: &[u8]) -> Result<Version> {
    let prefix: [u8; VERSION_PREFIX_LEN] = raw
        .get(..VERSION_PREFIX_LEN)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| KvError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
        })?;
    Ok(Version::from_be_bytes(prefix))
}

fn split_envelope(key: &str, raw: &[u8]) -> Result<KvEntry> {
    let version = decode_version(key.as_bytes(), raw)?;
    Ok(KvEntry {
        key: key.to_string(),
        value: raw[VERSION_PREFIX_LEN..].to_vec(),
        version,
    })
}

fn seal_envelope(version: Version, value: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(VERSION_PREFIX_LEN + value.len());
    raw.extend_from_slice(&version.to_be_bytes());
    raw.extend_from_slice(value);
    raw
}

fn check_expectation(key: &str, current: Option<Version>, expected: Expectation) -> Result<()> {
    match (expected, current) {
        (Expectation::Any, _) => Ok(()),
        (Expectation::Absent, None) => Ok(()),
        (Expectation::Absent, Some(_)) => Err(KvError::KeyExists {
            key: key.to_string(),
        }),
        (Expectation::Version(_), None) => Err(KvError::KeyNotFound {
            key: key.to_string(),
        }),
        (Expectation::Version(expected), Some(actual)) if expected == actual => Ok(()),
        (Expectation::Version(expected), Some(actual)) => Err(KvError::VersionConflict {
            key: key.to_string(),
            expected,
            actual,
        }),
    }
}

#[async_trait]
impl KvDriver for SledDriver {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        self.read_entry(key)
    }

    async fn put(&self, key: &str, value: Vec<u8>, expected: Expectation) -> Result<Version> {
        let mut state = self.state.lock().await;

        let current = self.read_entry(key)?;
        check_expectation(key, current.as_ref().map(|e| e.version), expected)?;

        let version = state.seq + 1;
        self.tree
            .insert(key.as_bytes(), seal_envelope(version, &value))
            .context(BackendSnafu)?;
        self.tree.flush_async().await.context(BackendSnafu)?;
        state.seq = version;

        let event_type = if current.is_some() {
            EventType::Update
        } else {
            EventType::Add
        };
        self.publish(
            &mut state,
            KvEvent {
                event_type,
                key: key.to_string(),
                value,
                version,
            },
        );
        Ok(version)
    }

    async fn delete(&self, key: &str, expected: Expectation) -> Result<KvEntry> {
        let mut state = self.state.lock().await;

        let current = self.read_entry(key)?.ok_or_else(|| KvError::KeyNotFound {
            key: key.to_string(),
        })?;
        check_expectation(key, Some(current.version), expected)?;

        self.tree.remove(key.as_bytes()).context(BackendSnafu)?;
        self.tree.flush_async().await.context(BackendSnafu)?;

        let version = state.seq + 1;
        state.seq = version;
        self.publish(
            &mut state,
            KvEvent {
                event_type: EventType::Delete,
                key: key.to_string(),
                value: current.value.clone(),
                version,
            },
        );
        Ok(current)
    }

    async fn range(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut entries = vec![];
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, raw) = item.context(BackendSnafu)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            entries.push(split_envelope(&key, &raw)?);
        }
        Ok(entries)
    }

    async fn snapshot(&self, prefix: &str) -> Result<(Vec<KvEntry>, Version)> {
        // Holding the write lock pins the sequence to the range contents.
        let state = self.state.lock().await;
        let entries = self.range(prefix).await?;
        Ok((entries, state.seq))
    }

    async fn watch(&self, prefix: &str, from: Option<Version>) -> Result<EventStream> {
        let state = self.state.lock().await;

        let replay: Vec<KvEvent> = match from {
            None => vec![],
            Some(from) => {
                if from < state.oldest_retained {
                    return Err(KvError::WatchGap {
                        from,
                        oldest: state.oldest_retained,
                    });
                }
                state
                    .buffer
                    .iter()
                    .filter(|event| event.version >= from && event.key.starts_with(prefix))
                    .cloned()
                    .collect()
            }
        };

        // Subscribing while the write lock is held means no event can fall
        // between the replayed tail and the live stream.
        let live_threshold = state.seq + 1;
        let receiver = self.events.subscribe();
        drop(state);

        debug!(prefix, replayed = replay.len(), "watch stream opened");

        let prefix = prefix.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let prefix = prefix.clone();
            async move {
                match item {
                    Ok(event)
                        if event.version >= live_threshold && event.key.starts_with(&prefix) =>
                    {
                        Some(Ok(event))
                    }
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        Some(Err(KvError::WatchLagged { missed }))
                    }
                }
            }
        });

        Ok(futures::stream::iter(replay.into_iter().map(Ok))
            .chain(live)
            .boxed())
    }
}
