//! SkyShift persistence: the KV driver, the typed object store and the
//! informer machinery built on its watch streams.

pub mod backoff;
pub mod driver;
pub mod informer;
pub mod kv;
pub mod store;

pub use crate::{
    backoff::Backoff,
    driver::SledDriver,
    informer::{sleep_or_shutdown, EventHandler, Informer},
    kv::{EventType, Expectation, KvDriver, KvEntry, KvError, KvEvent, Version},
    store::{object_key, ObjectEvent, ObjectList, ObjectStore, ObjectStream, StoreError},
};
