//! Per-kind object types: spec, status and validation for every [`Kind`].
//!
//! [`Kind`]: crate::Kind

pub mod cluster;
pub mod endpoints;
pub mod filter_policy;
pub mod job;
pub mod link;
pub mod namespace;
pub mod rbac;
pub mod service;

pub use cluster::{Cluster, ClusterSpec, ClusterState, ClusterStatus, ManagerType};
pub use endpoints::{EndpointSlice, Endpoints, EndpointsSpec};
pub use filter_policy::{ClusterFilter, FilterPolicy, FilterPolicySpec};
pub use job::{
    ImagePullPolicy, Job, JobSpec, JobState, JobStatus, Placement, PlacementPreference,
    RestartPolicy, VolumeMount,
};
pub use link::{Link, LinkSpec, LinkState, LinkStatus};
pub use namespace::{Namespace, NamespacePhase, NamespaceStatus};
pub use rbac::{
    Action, Invite, InvitePhase, InviteSpec, Role, RoleSpec, Rule, User, UserSpec, ADMIN_ROLE, ALL,
};
pub use service::{Protocol, Service, ServicePort, ServiceSpec, ServiceStatus, ServiceType};
