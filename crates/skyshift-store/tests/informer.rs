//! Informer behavior against a live store: callback delivery, cache
//! contents and per-object ordering.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use skyshift_store::{EventHandler, Informer, ObjectStore, SledDriver};
use skyshift_types::{
    kinds::{Cluster, ClusterState},
    Kind, ObjectRef,
};
use tokio::sync::watch;

fn fresh_store() -> (tempfile::TempDir, ObjectStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = SledDriver::open(dir.path()).expect("driver opens");
    (dir, ObjectStore::new(Arc::new(driver)))
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn log(&self) -> Vec<String> {
        self.events.lock().expect("recorder lock").clone()
    }
}

#[async_trait]
impl EventHandler<Cluster> for Recorder {
    async fn on_add(&self, new: &Cluster) {
        self.events
            .lock()
            .expect("recorder lock")
            .push(format!("add:{}", new.metadata.name));
    }

    async fn on_update(&self, _old: &Cluster, new: &Cluster) {
        self.events
            .lock()
            .expect("recorder lock")
            .push(format!("update:{}:{}", new.metadata.name, new.status.status));
    }

    async fn on_delete(&self, old: &Cluster) {
        self.events
            .lock()
            .expect("recorder lock")
            .push(format!("delete:{}", old.metadata.name));
    }
}

async fn settle() {
    // Informer delivery is asynchronous; give the loop a few ticks.
    for _ in 0..20 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn informer_delivers_lifecycle_callbacks_in_order() {
    let (_dir, store) = fresh_store();

    // One object exists before the informer starts: it must surface as an
    // add during the initial list.
    store.create(Cluster::new("pre")).await.expect("create");

    let recorder = Arc::new(Recorder::default());
    let informer = Informer::<Cluster>::new(store.clone(), None).with_handler(recorder.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let handle = tokio::spawn(informer.clone().run(shutdown_rx));

    informer.wait_synced().await;

    let created = store.create(Cluster::new("c1")).await.expect("create");

    let mut ready = created.clone();
    ready.status.status = ClusterState::Ready;
    store.update_status(ready).await.expect("update");

    store
        .delete::<Cluster>(None, "c1", None)
        .await
        .expect("delete");

    settle().await;

    let log = recorder.log();
    assert_eq!(
        log,
        vec![
            "add:pre".to_string(),
            "add:c1".to_string(),
            "update:c1:READY".to_string(),
            "delete:c1".to_string(),
        ]
    );

    // Cache reflects the store: only the pre-existing object remains.
    let cached = informer.snapshot();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].metadata.name, "pre");
    assert!(informer
        .cached(&ObjectRef::global(Kind::Cluster, "c1"))
        .is_none());

    shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("informer exits cleanly");
}

#[tokio::test]
async fn informer_cache_serves_copies() {
    let (_dir, store) = fresh_store();
    store.create(Cluster::new("c1")).await.expect("create");

    let informer = Informer::<Cluster>::new(store.clone(), None);
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let handle = tokio::spawn(informer.clone().run(shutdown_rx));

    informer.wait_synced().await;

    let mut copy = informer
        .cached(&ObjectRef::global(Kind::Cluster, "c1"))
        .expect("cached");
    copy.status.status = ClusterState::Error;

    // Mutating the copy must not leak into the cache.
    let again = informer
        .cached(&ObjectRef::global(Kind::Cluster, "c1"))
        .expect("cached");
    assert_eq!(again.status.status, ClusterState::Init);

    shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("informer exits cleanly");
}
