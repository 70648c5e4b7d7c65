//! The compatibility layer: a uniform [`ClusterManager`] contract with one
//! implementation per cluster backend (Kubernetes, Slurm over SSH, Ray).
//!
//! Skylet controllers and the API's logs/exec side paths only ever talk to
//! this trait; nothing above it knows which backend is underneath. A
//! backend that cannot satisfy an operation returns
//! [`ManagerError::Unsupported`], which callers surface as a condition on
//! the affected object.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{future::BoxFuture, stream::BoxStream};
use snafu::Snafu;
use skyshift_types::{
    kinds::{Job, JobState, Link, Service},
    resources::NodeResourceMap,
};

pub mod kubernetes;
pub mod ray;
pub mod registry;
pub mod slurm;

pub use crate::registry::{DefaultManagerFactory, ManagerFactory};

pub type Result<T, E = ManagerError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ManagerError {
    #[snafu(display("operation {operation:?} is not supported by this cluster manager"))]
    Unsupported { operation: &'static str },

    #[snafu(display("cluster access configuration is missing {field:?}"))]
    MissingConfig { field: &'static str },

    #[snafu(display("kubernetes api call failed"))]
    Kubernetes { source: kube::Error },

    #[snafu(display("failed to load kubeconfig"))]
    Kubeconfig { source: kube::config::KubeconfigError },

    #[snafu(display("ssh transport failed"))]
    Ssh { source: async_ssh2_tokio::Error },

    #[snafu(display("remote command {command:?} exited with {code}: {stderr}"))]
    CommandFailed {
        command: String,
        code: u32,
        stderr: String,
    },

    #[snafu(display("http request to the cluster manager failed"))]
    Http { source: reqwest::Error },

    #[snafu(display("failed to parse cluster manager output: {message}"))]
    Parse { message: String },

    #[snafu(display("job {name:?} has no manager-side id on this cluster"))]
    JobNotSubmitted { name: String },

    #[snafu(display("stream i/o failed"))]
    Io { source: std::io::Error },
}

impl ManagerError {
    /// Whether the caller should retry with backoff rather than give up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ManagerError::Kubernetes { .. }
                | ManagerError::Ssh { .. }
                | ManagerError::Http { .. }
                | ManagerError::Io { .. }
        )
    }
}

/// What `describe` reports about a cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterInventory {
    /// `node -> resource -> quantity`, total.
    pub capacity: NodeResourceMap,

    /// `node -> resource -> quantity`, minus reserved and used.
    pub allocatable: NodeResourceMap,

    /// `node -> accelerator type` for nodes advertising accelerators.
    pub accelerator_types: BTreeMap<String, String>,

    /// `node -> labels`, merged into the scheduler's cluster view.
    pub node_labels: BTreeMap<String, BTreeMap<String, String>>,
}

/// Per-state replica counts as observed on the backend.
pub type ReplicaCounts = BTreeMap<JobState, u32>;

#[derive(Debug, Clone, Default)]
pub struct LogsOptions {
    /// Keep the stream open and poll for new output.
    pub follow: bool,

    /// Byte offset to resume from, for restartable log streams.
    pub offset: u64,
}

pub type LogStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Backend task or pod to attach to; `None` picks the first replica.
    pub task: Option<String>,

    /// Container within the task, where the backend distinguishes them.
    pub container: Option<String>,

    pub command: Vec<String>,

    /// Allocate a TTY and keep stdin open.
    pub interactive: bool,
}

/// A running exec attachment: optional stdin sink, interleaved output and
/// the eventual exit code.
pub struct ExecSession {
    pub stdin: Option<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>,
    pub output: LogStream,
    pub exit_code: BoxFuture<'static, i32>,
}

/// The uniform contract every cluster backend implements.
///
/// Link and service operations default to [`ManagerError::Unsupported`], so
/// backends without a mesh or service fabric only implement the job surface.
#[async_trait]
pub trait ClusterManager: Send + Sync + 'static {
    /// The Cluster object this manager serves.
    fn cluster_name(&self) -> &str;

    /// Capacity, allocatable capacity, accelerators and node labels.
    async fn describe(&self) -> Result<ClusterInventory>;

    /// Submits `replicas` replicas of `job` and returns the backend-native
    /// job id. Resubmitting an already-submitted job reconciles the
    /// backend's replica count instead of erroring.
    async fn submit_job(&self, job: &Job, replicas: u32) -> Result<String>;

    async fn delete_job(&self, job: &Job) -> Result<()>;

    /// Observed replica states for this cluster's slice of `job`.
    async fn poll_job(&self, job: &Job) -> Result<ReplicaCounts>;

    async fn job_logs(&self, job: &Job, options: LogsOptions) -> Result<LogStream>;

    async fn exec(&self, job: &Job, request: ExecRequest) -> Result<ExecSession>;

    async fn submit_service(&self, _service: &Service) -> Result<()> {
        UnsupportedSnafu {
            operation: "submit_service",
        }
        .fail()
    }

    async fn delete_service(&self, _service: &Service) -> Result<()> {
        UnsupportedSnafu {
            operation: "delete_service",
        }
        .fail()
    }

    /// Services currently deployed on this cluster, with observed cluster
    /// and external IPs in their status.
    async fn list_services(&self) -> Result<Vec<Service>> {
        UnsupportedSnafu {
            operation: "list_services",
        }
        .fail()
    }

    async fn create_link(&self, _link: &Link) -> Result<()> {
        UnsupportedSnafu {
            operation: "create_link",
        }
        .fail()
    }

    async fn delete_link(&self, _link: &Link) -> Result<()> {
        UnsupportedSnafu {
            operation: "delete_link",
        }
        .fail()
    }

    /// Exports a local service over an established link towards `peer`.
    async fn expose_service(&self, _service: &Service, _peer: &str) -> Result<()> {
        UnsupportedSnafu {
            operation: "expose_service",
        }
        .fail()
    }

    /// Imports a remote service exposed by `peer` into this cluster.
    async fn import_service(&self, _service: &Service, _peer: &str) -> Result<()> {
        UnsupportedSnafu {
            operation: "import_service",
        }
        .fail()
    }
}

/// The deterministic backend-side name for a job: unique per (namespace,
/// name) and stable across reconciliation rounds, which is what makes the
/// flow controller idempotent.
pub fn managed_job_name(job: &Job) -> String {
    let namespace = job.metadata.namespace.as_deref().unwrap_or("default");
    format!("skyshift-{namespace}-{name}", name = job.metadata.name)
}

/// Reads a tokio `AsyncRead` into a bounded stream of byte chunks.
pub(crate) fn read_to_stream<R>(reader: R) -> LogStream
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    use tokio::io::AsyncReadExt;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes>>(16);
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buffer = vec![0u8; 4096];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx
                        .send(Ok(Bytes::copy_from_slice(&buffer[..n])))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(source) => {
                    let _ = tx.send(Err(ManagerError::Io { source })).await;
                    break;
                }
            }
        }
    });

    Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
}
