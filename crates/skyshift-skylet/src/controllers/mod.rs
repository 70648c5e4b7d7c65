//! The Skylet's controllers and the helpers they share.

pub mod cluster;
pub mod endpoints;
pub mod flow;
pub mod job;
pub mod network;
pub mod service;

use skyshift_store::{ObjectStore, StoreError};
use skyshift_types::Object;
use tokio::sync::watch;

/// Rereads, mutates and writes an object's status, retrying on conflict.
///
/// The mutation closure returns `false` when the observed state needs no
/// write, which is what keeps reconciliation idempotent. Returns `None`
/// when the object vanished.
pub(crate) async fn update_status_with_retry<T, F>(
    store: &ObjectStore,
    namespace: Option<&str>,
    name: &str,
    mutate: F,
) -> Result<Option<T>, StoreError>
where
    T: Object,
    F: Fn(&mut T) -> bool,
{
    let mut last_conflict = None;
    for _ in 0..5 {
        let mut object: T = match store.get(namespace, name).await {
            Ok(object) => object,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(error) => return Err(error),
        };
        if !mutate(&mut object) {
            return Ok(Some(object));
        }
        match store.update_status(object).await {
            Ok(object) => return Ok(Some(object)),
            Err(error @ StoreError::Conflict { .. }) => {
                last_conflict = Some(error);
                continue;
            }
            Err(error) => return Err(error),
        }
    }
    Err(last_conflict.unwrap_or(StoreError::NotFound {
        reference: name.to_string(),
    }))
}

/// Sleeps one controller tick, returning `true` if shutdown fired first.
pub(crate) async fn tick_or_shutdown(
    interval: std::time::Duration,
    shutdown: &mut watch::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        _ = shutdown.changed() => true,
    }
}
