//! End-to-end semantics of the object store: optimistic concurrency, watch
//! resume, the status mutation path and namespace cascade.

use std::sync::Arc;

use futures::StreamExt;
use skyshift_store::{EventType, ObjectStore, SledDriver, StoreError};
use skyshift_types::{
    kinds::{Cluster, ClusterState, Job, JobState, Namespace},
    Object,
};

fn fresh_store() -> (tempfile::TempDir, ObjectStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = SledDriver::open(dir.path()).expect("driver opens");
    (dir, ObjectStore::new(Arc::new(driver)))
}

fn test_job(name: &str) -> Job {
    let mut job = Job::new("default", name);
    job.spec.image = "ubuntu:22.04".to_string();
    job
}

#[tokio::test]
async fn create_assigns_resource_version_one() {
    let (_dir, store) = fresh_store();

    let created = store.create(Cluster::new("c1")).await.expect("create");
    assert_eq!(created.metadata.resource_version, 1);
    assert_eq!(created.metadata.generation, 1);
    assert!(created.metadata.creation_timestamp.is_some());
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let (_dir, store) = fresh_store();

    store.create(Cluster::new("c1")).await.expect("create");
    let err = store
        .create(Cluster::new("c1"))
        .await
        .expect_err("duplicate must fail");
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
}

#[tokio::test]
async fn concurrent_updates_with_same_base_version_conflict() {
    let (_dir, store) = fresh_store();

    let base = store.create(test_job("j1")).await.expect("create");

    let mut first = base.clone();
    first.spec.replicas = 2;
    let mut second = base.clone();
    second.spec.replicas = 3;

    let (a, b) = tokio::join!(store.update(first), store.update(second));
    let succeeded = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(succeeded, 1, "exactly one concurrent update may win");

    let conflict = if a.is_err() { a.err() } else { b.err() };
    assert!(matches!(conflict, Some(StoreError::Conflict { .. })));
}

#[tokio::test]
async fn status_updates_do_not_bump_generation() {
    let (_dir, store) = fresh_store();

    let created = store.create(test_job("j1")).await.expect("create");
    assert_eq!(created.metadata.generation, 1);

    let mut with_status = created.clone();
    with_status.status.status = JobState::Scheduled;
    let updated = store.update_status(with_status).await.expect("status");
    assert_eq!(updated.metadata.resource_version, 2);
    assert_eq!(updated.metadata.generation, 1);
    assert_eq!(updated.status.status, JobState::Scheduled);

    // A spec change through the regular path does move generation.
    let mut with_spec = updated.clone();
    with_spec.spec.replicas = 5;
    let updated = store.update(with_spec).await.expect("update");
    assert_eq!(updated.metadata.resource_version, 3);
    assert_eq!(updated.metadata.generation, 2);
}

#[tokio::test]
async fn status_path_cannot_smuggle_spec_changes() {
    let (_dir, store) = fresh_store();

    let created = store.create(test_job("j1")).await.expect("create");

    let mut sneaky = created.clone();
    sneaky.spec.replicas = 99;
    sneaky.status.status = JobState::Pending;
    let updated = store.update_status(sneaky).await.expect("status");

    assert_eq!(updated.spec.replicas, 1, "spec must come from the store");
    assert_eq!(updated.status.status, JobState::Pending);
}

#[tokio::test]
async fn stale_update_conflicts_and_reread_recovers() {
    let (_dir, store) = fresh_store();

    let created = store.create(Cluster::new("c1")).await.expect("create");

    let mut fresh = created.clone();
    fresh.status.status = ClusterState::Ready;
    store.update_status(fresh).await.expect("first update");

    // Same base again: stale.
    let mut stale = created.clone();
    stale.status.status = ClusterState::Error;
    let err = store
        .update_status(stale)
        .await
        .expect_err("stale write must conflict");
    assert!(matches!(err, StoreError::Conflict { .. }));

    // Reread and retry, the controller contract.
    let mut current: Cluster = store.get(None, "c1").await.expect("get");
    current.status.status = ClusterState::Error;
    store.update_status(current).await.expect("retry succeeds");
}

#[tokio::test]
async fn watch_resume_delivers_exactly_the_missed_events_in_order() {
    let (_dir, store) = fresh_store();

    // Watcher from the live head.
    let mut live = store.watch::<Cluster>(None, None).await.expect("watch");

    store.create(Cluster::new("c1")).await.expect("create");
    store.create(Cluster::new("c2")).await.expect("create");
    store.create(Cluster::new("c3")).await.expect("create");

    let e1 = live.next().await.expect("event").expect("ok");
    assert_eq!(e1.object.metadata.name, "c1");

    // Simulate a disconnect after the first event and resume just past it.
    drop(live);
    let mut resumed = store
        .watch::<Cluster>(None, Some(e1.version + 1))
        .await
        .expect("resumed watch");

    let e2 = resumed.next().await.expect("event").expect("ok");
    let e3 = resumed.next().await.expect("event").expect("ok");
    assert_eq!(e2.object.metadata.name, "c2");
    assert_eq!(e3.object.metadata.name, "c3");
    assert!(e2.version < e3.version);
}

#[tokio::test]
async fn watch_without_cursor_starts_with_a_snapshot() {
    let (_dir, store) = fresh_store();

    store.create(Cluster::new("c1")).await.expect("create");
    store.create(Cluster::new("c2")).await.expect("create");

    let mut stream = store.watch::<Cluster>(None, None).await.expect("watch");
    let first = stream.next().await.expect("event").expect("ok");
    let second = stream.next().await.expect("event").expect("ok");

    assert_eq!(first.event_type, EventType::Add);
    assert_eq!(second.event_type, EventType::Add);
    let mut names = vec![first.object.metadata.name, second.object.metadata.name];
    names.sort();
    assert_eq!(names, ["c1", "c2"]);
}

#[tokio::test]
async fn delete_fires_a_delete_event_with_the_last_state() {
    let (_dir, store) = fresh_store();

    let created = store.create(test_job("j1")).await.expect("create");
    let mut stream = store
        .watch::<Job>(Some("default"), None)
        .await
        .expect("watch");

    // Skip the snapshot ADD.
    let _ = stream.next().await.expect("event").expect("ok");

    store
        .delete::<Job>(Some("default"), "j1", None)
        .await
        .expect("delete");
    let event = stream.next().await.expect("event").expect("ok");
    assert_eq!(event.event_type, EventType::Delete);
    assert_eq!(
        event.object.metadata.resource_version,
        created.metadata.resource_version
    );
}

#[tokio::test]
async fn namespace_cascade_removes_every_namespaced_object() {
    let (_dir, store) = fresh_store();

    store
        .create(Namespace::new("team-a"))
        .await
        .expect("namespace");
    store
        .create(Namespace::new("team-b"))
        .await
        .expect("namespace");

    let mut job_a = Job::new("team-a", "j1");
    job_a.spec.image = "ubuntu:22.04".to_string();
    store.create(job_a).await.expect("job");
    let mut job_b = Job::new("team-b", "j2");
    job_b.spec.image = "ubuntu:22.04".to_string();
    store.create(job_b).await.expect("job");

    store
        .delete_namespace_cascade("team-a")
        .await
        .expect("cascade");

    // No orphans observable via list.
    let remaining = store.list::<Job>(None).await.expect("list");
    assert_eq!(remaining.items.len(), 1);
    assert_eq!(remaining.items[0].metadata.namespace.as_deref(), Some("team-b"));

    let err = store
        .get::<Namespace>(None, "team-a")
        .await
        .expect_err("namespace must be gone");
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn list_is_scoped_by_namespace() {
    let (_dir, store) = fresh_store();

    let mut job = Job::new("team-a", "j1");
    job.spec.image = "ubuntu:22.04".to_string();
    store.create(job).await.expect("job");

    let team_a = store.list::<Job>(Some("team-a")).await.expect("list");
    assert_eq!(team_a.items.len(), 1);

    let team_b = store.list::<Job>(Some("team-b")).await.expect("list");
    assert!(team_b.items.is_empty());

    let all = store.list::<Job>(None).await.expect("list");
    assert_eq!(all.items.len(), 1);
    assert_eq!(all.items[0].object_ref().to_string(), "Job/team-a/j1");
}
