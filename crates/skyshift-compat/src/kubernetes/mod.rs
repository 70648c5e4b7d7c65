//! The Kubernetes [`ClusterManager`].
//!
//! Jobs with `restart_policy = Always` render as Deployments, everything
//! else as batch Jobs. Allocatable capacity is derived from node status
//! minus the resource requests of pods already on each node. Link
//! operations call out to an external mesh controller binary named in the
//! cluster's access configuration.

pub mod convert;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::{
    apps::v1::Deployment,
    batch::v1::Job as BatchJob,
    core::v1::{Node, Pod, Service as CoreService},
};
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use snafu::ResultExt;
use skyshift_types::{
    kinds::{Cluster, Job, Link, RestartPolicy, Service},
    resources::ResourceMap,
};
use tokio::process::Command;
use tracing::debug;

use crate::{
    ClusterInventory, ClusterManager, ExecRequest, ExecSession, IoSnafu, KubeconfigSnafu,
    KubernetesSnafu, LogStream, LogsOptions, ManagerError, ReplicaCounts, Result,
    managed_job_name,
};
use convert::{
    canonical_resource_name, convert_service, managed_service_name, pod_phase_to_state,
    quantity_to_amount, ACCELERATOR_LABEL, JOB_LABEL, MANAGED_LABEL,
};

pub struct KubernetesManager {
    cluster_name: String,
    client: Client,
    namespace: String,
    mesh_ctl: Option<String>,
}

impl KubernetesManager {
    pub async fn connect(cluster: &Cluster) -> Result<Self> {
        let config = match &cluster.spec.config_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).context(KubeconfigSnafu)?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .context(KubeconfigSnafu)?
            }
            None => Config::infer().await.map_err(|source| {
                ManagerError::Parse {
                    message: format!("could not infer kubernetes config: {source}"),
                }
            })?,
        };
        let client = Client::try_from(config).context(KubernetesSnafu)?;

        Ok(KubernetesManager {
            cluster_name: cluster.metadata.name.clone(),
            client,
            namespace: cluster
                .spec
                .access_config
                .get("namespace")
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
            mesh_ctl: cluster.spec.access_config.get("mesh_ctl").cloned(),
        })
    }

    fn job_selector(job: &Job) -> String {
        format!("{JOB_LABEL}={}", job.metadata.name)
    }

    async fn pods_for(&self, job: &Job) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(&Self::job_selector(job)))
            .await
            .context(KubernetesSnafu)?;
        let mut items = list.items;
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(items)
    }

    async fn run_mesh_ctl(&self, args: &[&str]) -> Result<()> {
        let ctl = self
            .mesh_ctl
            .as_ref()
            .ok_or(ManagerError::Unsupported {
                operation: "link operations (no mesh controller configured)",
            })?;

        let output = Command::new(ctl)
            .args(args)
            .output()
            .await
            .context(IoSnafu)?;
        if !output.status.success() {
            return Err(ManagerError::CommandFailed {
                command: format!("{ctl} {}", args.join(" ")),
                code: output.status.code().unwrap_or(1) as u32,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterManager for KubernetesManager {
    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    async fn describe(&self) -> Result<ClusterInventory> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let pods: Api<Pod> = Api::all(self.client.clone());

        let node_list = nodes
            .list(&ListParams::default())
            .await
            .context(KubernetesSnafu)?;
        let pod_list = pods
            .list(&ListParams::default())
            .await
            .context(KubernetesSnafu)?;

        // Resource requests already claimed on each node.
        let mut used: BTreeMap<String, ResourceMap> = BTreeMap::new();
        for pod in &pod_list.items {
            let Some(spec) = &pod.spec else { continue };
            let Some(node_name) = &spec.node_name else { continue };
            let phase = pod
                .status
                .as_ref()
                .and_then(|status| status.phase.as_deref())
                .unwrap_or("Pending");
            if phase == "Succeeded" || phase == "Failed" {
                continue;
            }

            let node_used = used.entry(node_name.clone()).or_default();
            for container in &spec.containers {
                let Some(requests) = container
                    .resources
                    .as_ref()
                    .and_then(|resources| resources.requests.as_ref())
                else {
                    continue;
                };
                for (resource, quantity) in requests {
                    if let Some(name) = canonical_resource_name(resource) {
                        *node_used.entry(name).or_insert(0.0) +=
                            quantity_to_amount(resource, quantity);
                    }
                }
            }
        }

        let mut inventory = ClusterInventory::default();
        for node in node_list.items {
            let Some(name) = node.metadata.name.clone() else { continue };
            let Some(status) = &node.status else { continue };

            let mut capacity = ResourceMap::new();
            for (resource, quantity) in status.capacity.as_ref().into_iter().flatten() {
                if let Some(canonical) = canonical_resource_name(resource) {
                    capacity.insert(canonical, quantity_to_amount(resource, quantity));
                }
            }

            let mut allocatable = ResourceMap::new();
            for (resource, quantity) in status.allocatable.as_ref().into_iter().flatten() {
                if let Some(canonical) = canonical_resource_name(resource) {
                    allocatable.insert(canonical, quantity_to_amount(resource, quantity));
                }
            }
            if let Some(node_used) = used.get(&name) {
                skyshift_types::resources::subtract_in_place(&mut allocatable, node_used);
            }

            if let Some(labels) = &node.metadata.labels {
                if let Some(accelerator) = labels.get(ACCELERATOR_LABEL) {
                    inventory
                        .accelerator_types
                        .insert(name.clone(), accelerator.clone());
                }
                inventory.node_labels.insert(name.clone(), labels.clone());
            }

            inventory.capacity.insert(name.clone(), capacity);
            inventory.allocatable.insert(name, allocatable);
        }

        Ok(inventory)
    }

    async fn submit_job(&self, job: &Job, replicas: u32) -> Result<String> {
        let name = managed_job_name(job);

        match job.spec.restart_policy {
            RestartPolicy::Always => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
                let deployment = convert::render_deployment(job, replicas);
                match api.create(&PostParams::default(), &deployment).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(response)) if response.code == 409 => {
                        // Already present: reconcile the replica count.
                        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
                        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                            .await
                            .context(KubernetesSnafu)?;
                    }
                    Err(source) => return Err(ManagerError::Kubernetes { source }),
                }
            }
            RestartPolicy::Never | RestartPolicy::OnFailure => {
                let api: Api<BatchJob> = Api::namespaced(self.client.clone(), &self.namespace);
                let batch = convert::render_batch_job(job, replicas);
                match api.create(&PostParams::default(), &batch).await {
                    Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => {}
                    Err(source) => return Err(ManagerError::Kubernetes { source }),
                }
            }
        }

        debug!(job = %name, replicas, "submitted to kubernetes");
        Ok(name)
    }

    async fn delete_job(&self, job: &Job) -> Result<()> {
        let name = managed_job_name(job);

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        match deployments.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(source) => return Err(ManagerError::Kubernetes { source }),
        }

        let batch_jobs: Api<BatchJob> = Api::namespaced(self.client.clone(), &self.namespace);
        match batch_jobs.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(source) => return Err(ManagerError::Kubernetes { source }),
        }

        // Orphaned pods (e.g. from a torn-down controller) go with the job.
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        pods.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&Self::job_selector(job)),
        )
        .await
        .context(KubernetesSnafu)?;

        Ok(())
    }

    async fn poll_job(&self, job: &Job) -> Result<ReplicaCounts> {
        let mut counts = ReplicaCounts::new();
        for pod in self.pods_for(job).await? {
            let phase = pod
                .status
                .as_ref()
                .and_then(|status| status.phase.as_deref())
                .unwrap_or("Pending");
            *counts.entry(pod_phase_to_state(phase)).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn job_logs(&self, job: &Job, options: LogsOptions) -> Result<LogStream> {
        let pods = self.pods_for(job).await?;
        let pod_name = pods
            .first()
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| ManagerError::JobNotSubmitted {
                name: job.metadata.name.clone(),
            })?;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = LogParams {
            follow: options.follow,
            ..LogParams::default()
        };
        let reader = api
            .log_stream(&pod_name, &params)
            .await
            .context(KubernetesSnafu)?;

        let stream = futures_reader_to_stream(Box::pin(reader));
        Ok(skip_bytes(stream, options.offset))
    }

    async fn exec(&self, job: &Job, request: ExecRequest) -> Result<ExecSession> {
        let pods = self.pods_for(job).await?;
        let pod_name = match &request.task {
            Some(task) => task.clone(),
            None => pods
                .first()
                .and_then(|pod| pod.metadata.name.clone())
                .ok_or_else(|| ManagerError::JobNotSubmitted {
                    name: job.metadata.name.clone(),
                })?,
        };

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut params = AttachParams::default()
            .stdin(request.interactive)
            .stdout(true)
            .stderr(!request.interactive)
            .tty(request.interactive);
        if let Some(container) = &request.container {
            params = params.container(container.clone());
        }

        let mut attached = api
            .exec(&pod_name, request.command.clone(), &params)
            .await
            .context(KubernetesSnafu)?;

        let stdin = attached
            .stdin()
            .map(|w| Box::new(w) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>);
        let stdout = attached.stdout().ok_or(ManagerError::Parse {
            message: "exec attachment is missing stdout".to_string(),
        })?;
        let output = crate::read_to_stream(stdout);

        let status = attached.take_status();
        let exit_code = async move {
            let code = match status {
                Some(status) => match status.await {
                    Some(status) => exit_code_from_status(&status),
                    None => 0,
                },
                None => 0,
            };
            // Keep the attachment alive until the status resolves.
            drop(attached);
            code
        }
        .boxed();

        Ok(ExecSession {
            stdin,
            output,
            exit_code,
        })
    }

    async fn submit_service(&self, service: &Service) -> Result<()> {
        let api: Api<CoreService> = Api::namespaced(self.client.clone(), &self.namespace);
        let rendered = convert::render_service(service);
        match api.create(&PostParams::default(), &rendered).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => {
                api.patch(
                    &managed_service_name(service),
                    &PatchParams::default(),
                    &Patch::Merge(&serde_json::json!({ "spec": rendered.spec })),
                )
                .await
                .context(KubernetesSnafu)?;
                Ok(())
            }
            Err(source) => Err(ManagerError::Kubernetes { source }),
        }
    }

    async fn delete_service(&self, service: &Service) -> Result<()> {
        let api: Api<CoreService> = Api::namespaced(self.client.clone(), &self.namespace);
        match api
            .delete(&managed_service_name(service), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(ManagerError::Kubernetes { source }),
        }
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let api: Api<CoreService> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = api
            .list(&ListParams::default().labels(&format!("{MANAGED_LABEL}=true")))
            .await
            .context(KubernetesSnafu)?;
        Ok(list.items.iter().filter_map(convert_service).collect())
    }

    async fn create_link(&self, link: &Link) -> Result<()> {
        self.run_mesh_ctl(&[
            "create",
            "peer",
            &link.metadata.name,
            "--source",
            &link.spec.source,
            "--target",
            &link.spec.target,
        ])
        .await
    }

    async fn delete_link(&self, link: &Link) -> Result<()> {
        self.run_mesh_ctl(&["delete", "peer", &link.metadata.name]).await
    }

    async fn expose_service(&self, service: &Service, peer: &str) -> Result<()> {
        self.run_mesh_ctl(&[
            "create",
            "export",
            &managed_service_name(service),
            "--peer",
            peer,
        ])
        .await
    }

    async fn import_service(&self, service: &Service, peer: &str) -> Result<()> {
        self.run_mesh_ctl(&[
            "create",
            "import",
            &managed_service_name(service),
            "--peer",
            peer,
        ])
        .await
    }
}

/// Reads the exit code out of the status frame the API server sends when
/// an exec attachment terminates. Goes through JSON so the logic matches
/// the wire shape (`status`, `details.causes[reason=ExitCode]`) rather than
/// any particular client-side struct.
fn exit_code_from_status<S: serde::Serialize>(status: &S) -> i32 {
    let Ok(value) = serde_json::to_value(status) else {
        return 1;
    };
    if value.get("status").and_then(|s| s.as_str()) == Some("Success") {
        return 0;
    }
    value
        .get("details")
        .and_then(|details| details.get("causes"))
        .and_then(|causes| causes.as_array())
        .and_then(|causes| {
            causes.iter().find(|cause| {
                cause.get("reason").and_then(|r| r.as_str()) == Some("ExitCode")
            })
        })
        .and_then(|cause| cause.get("message"))
        .and_then(|message| message.as_str())
        .and_then(|message| message.trim().parse().ok())
        .unwrap_or(1)
}

/// Bridges the `futures` flavored reader kube returns for logs into our
/// byte-chunk stream type.
fn futures_reader_to_stream<R>(reader: R) -> LogStream
where
    R: futures::AsyncRead + Send + Unpin + 'static,
{
    use futures::AsyncReadExt;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes>>(16);
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buffer = vec![0u8; 4096];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx
                        .send(Ok(bytes::Bytes::copy_from_slice(&buffer[..n])))
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

/// Drops the first `offset` bytes of a stream, for restartable log reads.
fn skip_bytes(stream: LogStream, offset: u64) -> LogStream {
    let mut remaining = offset;
    stream
        .filter_map(move |item| {
            let forwarded = match item {
                Ok(mut chunk) => {
                    if remaining >= chunk.len() as u64 {
                        remaining -= chunk.len() as u64;
                        None
                    } else {
                        let tail = chunk.split_off(remaining as usize);
                        remaining = 0;
                        Some(Ok(tail))
                    }
                }
                Err(error) => Some(Err(error)),
            };
            async move { forwarded }
        })
        .boxed()
}
