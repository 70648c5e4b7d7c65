//! Cache-backed watch clients.
//!
//! An informer lists a kind, seeds a local cache, then follows the watch
//! stream and delivers Add/Update/Delete callbacks. On a lagged or gapped
//! stream it relists and emits a synthetic diff, so handlers always observe
//! a consistent history for any single object even across reconnects.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use futures::StreamExt;
use skyshift_types::{Object, ObjectRef};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    backoff::Backoff,
    kv::EventType,
    store::{ObjectStore, StoreError},
};

/// Callbacks an informer consumer implements.
///
/// Handlers run on the informer's receive loop: events for one informer are
/// delivered strictly in order, and a slow handler slows the informer down
/// rather than racing it.
#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    async fn on_add(&self, new: &T);
    async fn on_update(&self, old: &T, new: &T);
    async fn on_delete(&self, old: &T);
}

#[derive(Clone)]
pub struct Informer<T: Object> {
    store: ObjectStore,
    namespace: Option<String>,
    cache: Arc<RwLock<HashMap<ObjectRef, T>>>,
    handlers: Vec<Arc<dyn EventHandler<T>>>,
    synced_tx: Arc<watch::Sender<bool>>,
}

impl<T: Object> Informer<T> {
    pub fn new(store: ObjectStore, namespace: Option<String>) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Informer {
            store,
            namespace,
            cache: Arc::new(RwLock::new(HashMap::new())),
            handlers: Vec::new(),
            synced_tx: Arc::new(synced_tx),
        }
    }

    /// Registers a handler. Must be called before [`Informer::run`].
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler<T>>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// A copy of the cached object, if present.
    pub fn cached(&self, reference: &ObjectRef) -> Option<T> {
        self.cache
            .read()
            .ok()
            .and_then(|cache| cache.get(reference).cloned())
    }

    /// A copy of everything currently cached.
    pub fn snapshot(&self) -> Vec<T> {
        self.cache
            .read()
            .map(|cache| cache.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Completes once the first list has populated the cache.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Runs the list/watch loop until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<()>) {
        let mut backoff = Backoff::for_reconnect();

        'relist: loop {
            let cursor = match self.relist().await {
                Ok(revision) => {
                    backoff.reset();
                    let _ = self.synced_tx.send(true);
                    revision + 1
                }
                Err(error) => {
                    warn!(kind = %T::KIND, %error, "informer list failed");
                    if sleep_or_shutdown(backoff.next(), &mut shutdown).await {
                        return;
                    }
                    continue 'relist;
                }
            };

            let mut stream = match self
                .store
                .watch::<T>(self.namespace.as_deref(), Some(cursor))
                .await
            {
                Ok(stream) => stream,
                Err(error) => {
                    if !error.requires_relist() {
                        warn!(kind = %T::KIND, %error, "informer watch failed");
                        if sleep_or_shutdown(backoff.next(), &mut shutdown).await {
                            return;
                        }
                    }
                    continue 'relist;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    event = stream.next() => match event {
                        Some(Ok(event)) => {
                            backoff.reset();
                            self.apply(event.event_type, event.object).await;
                        }
                        Some(Err(error)) if error.requires_relist() => {
                            debug!(kind = %T::KIND, %error, "informer relisting");
                            continue 'relist;
                        }
                        Some(Err(error)) => {
                            warn!(kind = %T::KIND, %error, "informer stream error");
                            if sleep_or_shutdown(backoff.next(), &mut shutdown).await {
                                return;
                            }
                            continue 'relist;
                        }
                        None => {
                            if sleep_or_shutdown(backoff.next(), &mut shutdown).await {
                                return;
                            }
                            continue 'relist;
                        }
                    }
                }
            }
        }
    }

    /// Lists the kind and reconciles the cache against it, emitting the
    /// synthetic diff: adds for new keys, deletes for vanished keys,
    /// updates for version changes.
    async fn relist(&self) -> Result<u64, StoreError> {
        let list = self.store.list::<T>(self.namespace.as_deref()).await?;

        let fresh: HashSet<ObjectRef> =
            list.items.iter().map(|object| object.object_ref()).collect();

        let stale: Vec<(ObjectRef, T)> = {
            let cache = match self.cache.read() {
                Ok(cache) => cache,
                Err(poisoned) => poisoned.into_inner(),
            };
            cache
                .iter()
                .filter(|(reference, _)| !fresh.contains(reference))
                .map(|(reference, object)| (reference.clone(), object.clone()))
                .collect()
        };

        for (_, old) in &stale {
            self.dispatch_delete(old).await;
        }

        for object in list.items {
            let reference = object.object_ref();
            let old = self.cached(&reference);
            match old {
                None => self.dispatch_add(&object).await,
                Some(old)
                    if old.metadata().resource_version
                        != object.metadata().resource_version =>
                {
                    self.dispatch_update(&old, &object).await
                }
                Some(_) => {}
            }
            if let Ok(mut cache) = self.cache.write() {
                cache.insert(reference, object);
            }
        }

        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|reference, _| fresh.contains(reference));
        }

        Ok(list.revision)
    }

    async fn apply(&self, event_type: EventType, object: T) {
        let reference = object.object_ref();
        match event_type {
            EventType::Add => {
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(reference, object.clone());
                }
                self.dispatch_add(&object).await;
            }
            EventType::Update => {
                let old = self.cached(&reference);
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(reference, object.clone());
                }
                match old {
                    Some(old) => self.dispatch_update(&old, &object).await,
                    // An update for an object we never saw added.
                    None => self.dispatch_add(&object).await,
                }
            }
            EventType::Delete => {
                if let Ok(mut cache) = self.cache.write() {
                    cache.remove(&reference);
                }
                self.dispatch_delete(&object).await;
            }
        }
    }

    async fn dispatch_add(&self, new: &T) {
        for handler in &self.handlers {
            handler.on_add(new).await;
        }
    }

    async fn dispatch_update(&self, old: &T, new: &T) {
        for handler in &self.handlers {
            handler.on_update(old, new).await;
        }
    }

    async fn dispatch_delete(&self, old: &T) {
        for handler in &self.handlers {
            handler.on_delete(old).await;
        }
    }
}

/// Sleeps for `delay`, returning `true` if shutdown fired first.
pub async fn sleep_or_shutdown(
    delay: std::time::Duration,
    shutdown: &mut watch::Receiver<()>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
