//! Controller behavior against a scripted cluster manager: idempotent
//! reconciliation, eviction and replica-state folding.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use skyshift_compat::{
    ClusterInventory, ClusterManager, ExecRequest, ExecSession, LogStream, LogsOptions,
    ManagerError, ReplicaCounts, Result as CompatResult,
};
use skyshift_skylet::controllers::{flow::FlowController, job::JobController};
use skyshift_store::{Informer, ObjectStore, SledDriver};
use skyshift_types::kinds::{Job, JobState, RestartPolicy};
use tokio::sync::watch;

/// A cluster manager double that records calls and serves scripted poll
/// results.
#[derive(Default)]
struct MockManager {
    calls: Mutex<Vec<String>>,
    poll_result: Mutex<ReplicaCounts>,
}

impl MockManager {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock lock").clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().expect("mock lock").push(call.into());
    }

    fn script_poll(&self, counts: ReplicaCounts) {
        *self.poll_result.lock().expect("mock lock") = counts;
    }
}

#[async_trait]
impl ClusterManager for MockManager {
    fn cluster_name(&self) -> &str {
        "mock"
    }

    async fn describe(&self) -> CompatResult<ClusterInventory> {
        Ok(ClusterInventory::default())
    }

    async fn submit_job(&self, job: &Job, replicas: u32) -> CompatResult<String> {
        self.record(format!("submit:{}:{replicas}", job.metadata.name));
        Ok(format!("mock-{}", job.metadata.name))
    }

    async fn delete_job(&self, job: &Job) -> CompatResult<()> {
        self.record(format!("delete:{}", job.metadata.name));
        Ok(())
    }

    async fn poll_job(&self, job: &Job) -> CompatResult<ReplicaCounts> {
        self.record(format!("poll:{}", job.metadata.name));
        Ok(self.poll_result.lock().expect("mock lock").clone())
    }

    async fn job_logs(&self, _job: &Job, _options: LogsOptions) -> CompatResult<LogStream> {
        Err(ManagerError::Unsupported { operation: "logs" })
    }

    async fn exec(&self, _job: &Job, _request: ExecRequest) -> CompatResult<ExecSession> {
        Err(ManagerError::Unsupported { operation: "exec" })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: ObjectStore,
    manager: Arc<MockManager>,
    jobs: Informer<Job>,
    shutdown_tx: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let driver = SledDriver::open(dir.path()).expect("driver opens");
    let store = ObjectStore::new(Arc::new(driver));
    let manager = Arc::new(MockManager::default());

    let jobs: Informer<Job> = Informer::new(store.clone(), None);
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(jobs.clone().run(shutdown_rx.clone()));
    jobs.wait_synced().await;

    Fixture {
        _dir: dir,
        store,
        manager,
        jobs,
        shutdown_tx,
        shutdown_rx,
    }
}

/// A job whose slice on `mock` has been committed by the scheduler.
async fn placed_job(store: &ObjectStore, name: &str, replicas: u32) -> Job {
    let mut job = Job::new("default", name);
    job.spec.image = "ubuntu:22.04".to_string();
    job.spec.replicas = replicas;
    let created = store.create(job).await.expect("job create");

    let mut scheduled = created.clone();
    scheduled.status.status = JobState::Scheduled;
    scheduled
        .status
        .replica_status
        .insert("mock".to_string(), BTreeMap::from([(JobState::Init, replicas)]));
    store.update_status(scheduled).await.expect("job scheduled")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn flow_submits_once_and_stays_idempotent() {
    let fixture = fixture().await;
    placed_job(&fixture.store, "j1", 2).await;

    let flow = FlowController {
        cluster_name: "mock".to_string(),
        store: fixture.store.clone(),
        manager: fixture.manager.clone(),
        jobs: fixture.jobs.clone(),
        interval: Duration::from_millis(20),
        wait_timeout: None,
    };
    let handle = tokio::spawn(flow.run(fixture.shutdown_rx.clone()));

    settle().await;
    fixture.shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("flow exits");

    // Many ticks ran, but the backend saw exactly one submission.
    let submits: Vec<_> = fixture
        .manager
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("submit:"))
        .collect();
    assert_eq!(submits, vec!["submit:j1:2".to_string()]);

    let job: Job = fixture
        .store
        .get(Some("default"), "j1")
        .await
        .expect("job exists");
    assert_eq!(job.status.job_ids.get("mock"), Some(&"mock-j1".to_string()));
    assert_eq!(
        job.status.replica_status.get("mock"),
        Some(&BTreeMap::from([(JobState::Pending, 2)]))
    );
}

#[tokio::test]
async fn flow_evicts_after_pending_timeout() {
    let fixture = fixture().await;
    placed_job(&fixture.store, "j1", 1).await;

    let flow = FlowController {
        cluster_name: "mock".to_string(),
        store: fixture.store.clone(),
        manager: fixture.manager.clone(),
        jobs: fixture.jobs.clone(),
        interval: Duration::from_millis(20),
        wait_timeout: Some(Duration::from_millis(60)),
    };
    let handle = tokio::spawn(flow.run(fixture.shutdown_rx.clone()));

    // Long enough for submission, the timeout and the eviction tick.
    tokio::time::sleep(Duration::from_millis(500)).await;
    fixture.shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("flow exits");

    let job: Job = fixture
        .store
        .get(Some("default"), "j1")
        .await
        .expect("job exists");
    assert_eq!(
        job.status.replica_status.get("mock"),
        Some(&BTreeMap::from([(JobState::Evicted, 1)]))
    );
    assert!(!job.status.job_ids.contains_key("mock"));
    assert!(job
        .status
        .conditions
        .iter()
        .any(|condition| condition.type_ == "Evicted"));
    assert!(fixture
        .manager
        .calls()
        .contains(&"delete:j1".to_string()));
}

#[tokio::test]
async fn job_controller_folds_observed_states() {
    let fixture = fixture().await;
    let placed = placed_job(&fixture.store, "j1", 2).await;

    // Pretend the flow controller already submitted.
    let mut submitted = placed.clone();
    submitted
        .status
        .job_ids
        .insert("mock".to_string(), "mock-j1".to_string());
    submitted.status.replica_status.insert(
        "mock".to_string(),
        BTreeMap::from([(JobState::Pending, 2)]),
    );
    fixture
        .store
        .update_status(submitted)
        .await
        .expect("submission recorded");

    fixture
        .manager
        .script_poll(BTreeMap::from([(JobState::Running, 2)]));

    let controller = JobController {
        cluster_name: "mock".to_string(),
        store: fixture.store.clone(),
        manager: fixture.manager.clone(),
        jobs: fixture.jobs.clone(),
        interval: Duration::from_millis(20),
    };
    let handle = tokio::spawn(controller.run(fixture.shutdown_rx.clone()));

    settle().await;
    fixture.shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("controller exits");

    let job: Job = fixture
        .store
        .get(Some("default"), "j1")
        .await
        .expect("job exists");
    assert_eq!(
        job.status.replica_status.get("mock"),
        Some(&BTreeMap::from([(JobState::Running, 2)]))
    );
    assert_eq!(job.status.status, JobState::Running);
}

#[tokio::test]
async fn completed_never_jobs_freeze() {
    let fixture = fixture().await;
    let mut job = Job::new("default", "batch");
    job.spec.image = "ubuntu:22.04".to_string();
    job.spec.restart_policy = RestartPolicy::Never;
    let created = fixture.store.create(job).await.expect("job create");

    let mut done = created.clone();
    done.status.status = JobState::Completed;
    done.status
        .replica_status
        .insert("mock".to_string(), BTreeMap::from([(JobState::Completed, 1)]));
    done.status
        .job_ids
        .insert("mock".to_string(), "mock-batch".to_string());
    fixture.store.update_status(done).await.expect("job done");

    let controller = JobController {
        cluster_name: "mock".to_string(),
        store: fixture.store.clone(),
        manager: fixture.manager.clone(),
        jobs: fixture.jobs.clone(),
        interval: Duration::from_millis(20),
    };
    let handle = tokio::spawn(controller.run(fixture.shutdown_rx.clone()));

    settle().await;
    fixture.shutdown_tx.send(()).expect("shutdown");
    handle.await.expect("controller exits");

    // Frozen slice: the backend was never polled.
    assert!(fixture.manager.calls().is_empty());
}
