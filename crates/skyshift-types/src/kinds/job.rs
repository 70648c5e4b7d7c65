//! The Job kind: a replicated container workload spread across clusters.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    conditions::Condition,
    labels::LabelSelector,
    metadata::ObjectMeta,
    resources::{self, ResourceMap},
    Kind, Object,
};

/// Lifecycle states. The job-level `status` and the per-cluster replica
/// counters share this enum; `Scheduled` only appears at the job level.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Init,
    Scheduled,
    Pending,
    Running,
    Completed,
    Failed,
    Evicted,
    Deleted,
}

impl JobState {
    /// Terminal states never transition further on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Deleted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, Default)]
pub enum RestartPolicy {
    #[default]
    Always,
    Never,
    OnFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ImagePullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
}

/// A weighted preference. The scheduler adds the highest matching weight to
/// a cluster's score; within a preference list only the single best match
/// counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementPreference {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<crate::labels::MatchExpression>,

    pub weight: u32,
}

impl PlacementPreference {
    pub fn selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: self.match_labels.clone(),
            match_expressions: self.match_expressions.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Placement {
    /// Filters compose disjunctively: a cluster passes if any filter
    /// matches it (composition is a scheduler knob, OR by default).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<LabelSelector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferences: Vec<PlacementPreference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub image: String,

    #[serde(default)]
    pub image_pull_policy: ImagePullPolicy,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub envs: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,

    /// Per-replica resource request.
    #[serde(default = "resources::default_job_resources")]
    pub resources: ResourceMap,

    /// Command to run; empty means the image entrypoint.
    #[serde(default)]
    pub run: String,

    #[serde(default = "default_replicas")]
    pub replicas: u32,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeMount>,

    #[serde(default, skip_serializing_if = "Placement::is_empty")]
    pub placement: Placement,
}

impl Placement {
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.preferences.is_empty()
    }
}

impl Default for JobSpec {
    fn default() -> Self {
        JobSpec {
            image: String::new(),
            image_pull_policy: ImagePullPolicy::default(),
            envs: BTreeMap::new(),
            ports: Vec::new(),
            resources: resources::default_job_resources(),
            run: String::new(),
            replicas: default_replicas(),
            restart_policy: RestartPolicy::default(),
            volumes: BTreeMap::new(),
            placement: Placement::default(),
        }
    }
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobStatus {
    #[serde(default)]
    pub status: JobState,

    /// Per-cluster replica counters: `cluster -> state -> count`. Once the
    /// job is scheduled the counts across all clusters sum to
    /// `spec.replicas`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replica_status: BTreeMap<String, BTreeMap<JobState, u32>>,

    /// Backend-native job handles, `cluster -> id`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub job_ids: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl JobStatus {
    /// Replicas currently accounted to `cluster`, across all states.
    pub fn replicas_on(&self, cluster: &str) -> u32 {
        self.replica_status
            .get(cluster)
            .map(|states| states.values().sum())
            .unwrap_or(0)
    }

    /// Total replicas accounted across all clusters.
    pub fn total_replicas(&self) -> u32 {
        self.replica_status
            .keys()
            .map(|cluster| self.replicas_on(cluster))
            .sum()
    }

    /// Replicas still occupying (or about to occupy) capacity: everything
    /// except evicted and deleted ones. The scheduler places
    /// `spec.replicas - active_replicas()`.
    pub fn active_replicas(&self) -> u32 {
        self.replica_status
            .values()
            .flat_map(|states| states.iter())
            .filter(|(state, _)| !matches!(state, JobState::Evicted | JobState::Deleted))
            .map(|(_, count)| count)
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    #[serde(default = "job_kind")]
    pub kind: Kind,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
}

fn job_kind() -> Kind {
    Kind::Job
}

impl Job {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Job {
            kind: Kind::Job,
            metadata: ObjectMeta::namespaced(name, namespace),
            spec: JobSpec::default(),
            status: JobStatus::default(),
        }
    }
}

impl Object for Job {
    const KIND: Kind = Kind::Job;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = vec![];
        if self.spec.image.is_empty() {
            errors.push("image must not be empty".to_string());
        }
        errors.extend(crate::resources::validate(&self.spec.resources));
        for filter in &self.spec.placement.filters {
            errors.extend(filter.validate());
        }
        for preference in &self.spec.placement.preferences {
            errors.extend(preference.selector().validate());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_are_injected() {
        let job: Job = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "j1", "namespace": "default" },
            "spec": { "image": "ubuntu:22.04" },
        }))
        .expect("job must deserialize");

        assert_eq!(job.kind, Kind::Job);
        assert_eq!(job.spec.replicas, 1);
        assert_eq!(job.spec.restart_policy, RestartPolicy::Always);
        assert_eq!(job.spec.resources.get("cpus"), Some(&1.0));
        assert!(job.validate().is_ok());
    }

    #[test]
    fn unknown_spec_fields_are_rejected() {
        let result = serde_json::from_value::<Job>(serde_json::json!({
            "metadata": { "name": "j1", "namespace": "default" },
            "spec": { "image": "ubuntu:22.04", "imgae_pull_policy": "Always" },
        }));
        assert!(result.is_err());
    }

    #[test]
    fn replica_accounting() {
        let mut job = Job::new("default", "j1");
        job.status.replica_status.insert(
            "c1".into(),
            BTreeMap::from([(JobState::Running, 2), (JobState::Pending, 1)]),
        );
        job.status
            .replica_status
            .insert("c2".into(), BTreeMap::from([(JobState::Init, 1)]));

        assert_eq!(job.status.replicas_on("c1"), 3);
        assert_eq!(job.status.total_replicas(), 4);
        assert_eq!(job.status.replicas_on("c3"), 0);
    }

    #[test]
    fn empty_image_is_invalid() {
        let job = Job::new("default", "j1");
        assert!(job.validate().is_err());
    }
}
