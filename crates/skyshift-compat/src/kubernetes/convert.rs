//! Pure conversions between SkyShift objects and Kubernetes manifests.

use std::collections::BTreeMap;
use std::str::FromStr;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        batch::v1::{Job as BatchJob, JobSpec as BatchJobSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec,
            ResourceRequirements, Service as CoreService, ServicePort as CoreServicePort,
            ServiceSpec as CoreServiceSpec, Volume, VolumeMount as CoreVolumeMount,
        },
    },
    apimachinery::pkg::{
        api::resource::Quantity, apis::meta::v1::LabelSelector, apis::meta::v1::ObjectMeta,
        util::intstr::IntOrString,
    },
};
use skyshift_types::{
    kinds::{Job, JobState, RestartPolicy, Service, ServiceType},
    quantity::{CpuQuantity, MemoryQuantity},
    resources::{ResourceMap, RESOURCE_CPUS, RESOURCE_GPUS, RESOURCE_MEMORY},
};

use crate::managed_job_name;

/// Label carrying the SkyShift job name on every rendered resource.
pub const JOB_LABEL: &str = "skyshift.io/job";
/// Label carrying the SkyShift service name.
pub const SERVICE_LABEL: &str = "skyshift.io/service";
/// Label carrying the SkyShift namespace.
pub const NAMESPACE_LABEL: &str = "skyshift.io/namespace";
/// Marker label selecting everything SkyShift deployed on a cluster.
pub const MANAGED_LABEL: &str = "skyshift.io/managed";
/// Node label advertising an accelerator type.
pub const ACCELERATOR_LABEL: &str = "skyshift.io/accelerator";

const GPU_RESOURCE: &str = "nvidia.com/gpu";

pub fn managed_service_name(service: &Service) -> String {
    let namespace = service.metadata.namespace.as_deref().unwrap_or("default");
    format!("skyshift-{namespace}-{name}", name = service.metadata.name)
}

pub fn job_labels(job: &Job) -> BTreeMap<String, String> {
    BTreeMap::from([
        (JOB_LABEL.to_string(), job.metadata.name.clone()),
        (
            NAMESPACE_LABEL.to_string(),
            job.metadata.namespace.clone().unwrap_or_default(),
        ),
        (MANAGED_LABEL.to_string(), "true".to_string()),
    ])
}

/// Maps a pod phase onto the replica state machine.
pub fn pod_phase_to_state(phase: &str) -> JobState {
    match phase {
        "Pending" => JobState::Pending,
        "Running" => JobState::Running,
        "Succeeded" => JobState::Completed,
        "Failed" => JobState::Failed,
        _ => JobState::Pending,
    }
}

/// Converts a Kubernetes quantity into our unit conventions: CPU counts,
/// memory in MiB, everything else as a bare number.
pub fn quantity_to_amount(resource: &str, quantity: &Quantity) -> f64 {
    match resource {
        "cpu" | RESOURCE_CPUS => CpuQuantity::from_str(&quantity.0)
            .map(|q| q.as_cpu_count())
            .unwrap_or(0.0),
        "memory" | RESOURCE_MEMORY => MemoryQuantity::from_str(&quantity.0)
            .map(|q| q.as_mebibytes())
            .unwrap_or(0.0),
        _ => quantity.0.parse().unwrap_or(0.0),
    }
}

/// The canonical resource name a Kubernetes resource maps onto.
pub fn canonical_resource_name(resource: &str) -> Option<String> {
    match resource {
        "cpu" => Some(RESOURCE_CPUS.to_string()),
        "memory" => Some(RESOURCE_MEMORY.to_string()),
        GPU_RESOURCE => Some(RESOURCE_GPUS.to_string()),
        "pods" | "ephemeral-storage" | "hugepages-1Gi" | "hugepages-2Mi" => None,
        other => Some(other.to_string()),
    }
}

fn resource_requests(resources: &ResourceMap) -> BTreeMap<String, Quantity> {
    let mut requests = BTreeMap::new();
    for (resource, amount) in resources {
        if *amount <= 0.0 {
            continue;
        }
        match resource.as_str() {
            RESOURCE_CPUS => {
                requests.insert(
                    "cpu".to_string(),
                    Quantity(format!("{}m", (amount * 1000.0).round() as u64)),
                );
            }
            RESOURCE_MEMORY => {
                requests.insert(
                    "memory".to_string(),
                    Quantity(format!("{}Mi", amount.round() as u64)),
                );
            }
            RESOURCE_GPUS => {
                requests.insert(
                    GPU_RESOURCE.to_string(),
                    Quantity(format!("{}", amount.round() as u64)),
                );
            }
            // Accelerator types ("V100") all claim the GPU resource; the
            // node selection happens at the scheduler, not here.
            other => {
                requests.insert(other.to_string(), Quantity(format!("{amount}")));
            }
        }
    }
    requests
}

fn pod_template(job: &Job, restart_policy: &str) -> PodTemplateSpec {
    let requests = resource_requests(&job.spec.resources);

    let env = job
        .spec
        .envs
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        })
        .collect::<Vec<_>>();

    let ports = job
        .spec
        .ports
        .iter()
        .map(|port| ContainerPort {
            container_port: i32::from(*port),
            ..ContainerPort::default()
        })
        .collect::<Vec<_>>();

    let mut volumes = vec![];
    let mut mounts = vec![];
    for (name, volume) in &job.spec.volumes {
        volumes.push(Volume {
            name: name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: volume.host_path.clone(),
                type_: None,
            }),
            ..Volume::default()
        });
        mounts.push(CoreVolumeMount {
            name: name.clone(),
            mount_path: volume.container_path.clone(),
            ..CoreVolumeMount::default()
        });
    }

    let command = if job.spec.run.is_empty() {
        None
    } else {
        Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            job.spec.run.clone(),
        ])
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(job_labels(job)),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "workload".to_string(),
                image: Some(job.spec.image.clone()),
                command,
                env: if env.is_empty() { None } else { Some(env) },
                ports: if ports.is_empty() { None } else { Some(ports) },
                resources: if requests.is_empty() {
                    None
                } else {
                    Some(ResourceRequirements {
                        requests: Some(requests.clone()),
                        limits: None,
                        ..ResourceRequirements::default()
                    })
                },
                volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
                ..Container::default()
            }],
            restart_policy: Some(restart_policy.to_string()),
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..PodSpec::default()
        }),
    }
}

/// A Deployment for `restart_policy = Always` jobs.
pub fn render_deployment(job: &Job, replicas: u32) -> Deployment {
    let labels = job_labels(job);
    Deployment {
        metadata: ObjectMeta {
            name: Some(managed_job_name(job)),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas as i32),
            selector: LabelSelector {
                match_labels: Some(labels),
                match_expressions: None,
            },
            template: pod_template(job, "Always"),
            ..DeploymentSpec::default()
        }),
        status: None,
    }
}

/// A batch Job for run-to-completion workloads.
pub fn render_batch_job(job: &Job, replicas: u32) -> BatchJob {
    let restart = match job.spec.restart_policy {
        RestartPolicy::OnFailure => "OnFailure",
        _ => "Never",
    };
    BatchJob {
        metadata: ObjectMeta {
            name: Some(managed_job_name(job)),
            labels: Some(job_labels(job)),
            ..ObjectMeta::default()
        },
        spec: Some(BatchJobSpec {
            parallelism: Some(replicas as i32),
            completions: Some(replicas as i32),
            template: pod_template(job, restart),
            ..BatchJobSpec::default()
        }),
        status: None,
    }
}

/// Renders our Service as a Kubernetes one; types map 1:1.
pub fn render_service(service: &Service) -> CoreService {
    let labels = BTreeMap::from([
        (SERVICE_LABEL.to_string(), service.metadata.name.clone()),
        (
            NAMESPACE_LABEL.to_string(),
            service.metadata.namespace.clone().unwrap_or_default(),
        ),
        (MANAGED_LABEL.to_string(), "true".to_string()),
    ]);

    let ports = service
        .spec
        .ports
        .iter()
        .map(|port| CoreServicePort {
            protocol: Some(port.protocol.to_string()),
            port: i32::from(port.port),
            target_port: Some(IntOrString::Int(i32::from(port.target_port))),
            node_port: port.node_port.map(i32::from),
            ..CoreServicePort::default()
        })
        .collect::<Vec<_>>();

    CoreService {
        metadata: ObjectMeta {
            name: Some(managed_service_name(service)),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: Some(CoreServiceSpec {
            type_: Some(service.spec.service_type.to_string()),
            selector: if service.spec.selector.is_empty() {
                None
            } else {
                Some(service.spec.selector.clone())
            },
            ports: if ports.is_empty() { None } else { Some(ports) },
            ..CoreServiceSpec::default()
        }),
        status: None,
    }
}

/// Reads a managed Kubernetes service back into our model, carrying the
/// observed cluster and external IPs in its status.
pub fn convert_service(core: &CoreService) -> Option<Service> {
    let labels = core.metadata.labels.as_ref()?;
    let name = labels.get(SERVICE_LABEL)?;
    let namespace = labels.get(NAMESPACE_LABEL)?;

    let mut service = Service::new(namespace.clone(), name.clone());
    if let Some(spec) = &core.spec {
        if let Some(selector) = &spec.selector {
            service.spec.selector = selector.clone();
        }
        service.status.cluster_ip = spec.cluster_ip.clone().filter(|ip| ip.as_str() != "None");
    }
    service.status.external_ip = core
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|ingress| ingress.ip.clone());

    Some(service)
}
