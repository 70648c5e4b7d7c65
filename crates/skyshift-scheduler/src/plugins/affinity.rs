//! The cluster affinity plugin: filter policies, placement filters and
//! weighted preferences.

use skyshift_types::kinds::Job;
use tracing::warn;

use super::{FilterComposition, FilterPlugin, SchedulingContext, ScorePlugin, DEFAULT_MIN_WEIGHT};
use crate::cache::ClusterSnapshot;

pub struct ClusterAffinityPlugin;

impl FilterPlugin for ClusterAffinityPlugin {
    fn name(&self) -> &'static str {
        "ClusterAffinityPlugin"
    }

    /// Applies every filter policy selecting the job, then the job's own
    /// placement filters (OR-composed by default, AND behind the
    /// composition knob).
    fn filter(
        &self,
        job: &Job,
        context: &SchedulingContext,
        clusters: Vec<ClusterSnapshot>,
    ) -> Vec<ClusterSnapshot> {
        clusters
            .into_iter()
            .filter(|cluster| {
                context
                    .policies
                    .iter()
                    .all(|policy| policy.permits(&cluster.name))
            })
            .filter(|cluster| placement_filters_pass(job, context, cluster))
            .collect()
    }
}

fn placement_filters_pass(
    job: &Job,
    context: &SchedulingContext,
    cluster: &ClusterSnapshot,
) -> bool {
    let filters = &job.spec.placement.filters;
    if filters.is_empty() {
        return true;
    }

    let mut matches = filters.iter().map(|filter| {
        filter.matches(&cluster.labels).unwrap_or_else(|error| {
            // Selector validation happens at admission; a malformed one
            // that slipped through must not wedge scheduling.
            warn!(%error, job = %job.metadata.name, "skipping malformed placement filter");
            false
        })
    });

    match context.composition {
        FilterComposition::Or => matches.any(|matched| matched),
        FilterComposition::And => matches.all(|matched| matched),
    }
}

impl ScorePlugin for ClusterAffinityPlugin {
    fn name(&self) -> &'static str {
        "ClusterAffinityPlugin"
    }

    /// The single highest matching preference weight wins; clusters no
    /// preference matches receive [`DEFAULT_MIN_WEIGHT`].
    fn score(&self, job: &Job, _context: &SchedulingContext, cluster: &ClusterSnapshot) -> u32 {
        job.spec
            .placement
            .preferences
            .iter()
            .filter(|preference| {
                preference
                    .selector()
                    .matches(&cluster.labels)
                    .unwrap_or(false)
                    && !preference.selector().is_empty()
            })
            .map(|preference| preference.weight)
            .max()
            .unwrap_or(DEFAULT_MIN_WEIGHT)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use skyshift_types::{
        kinds::{FilterPolicy, PlacementPreference},
        labels::LabelSelector,
        resources::NodeResourceMap,
    };

    use super::*;

    fn cluster(name: &str, labels: &[(&str, &str)]) -> ClusterSnapshot {
        ClusterSnapshot {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            allocatable: NodeResourceMap::new(),
        }
    }

    fn context_with_policies(policies: Vec<FilterPolicy>) -> SchedulingContext {
        SchedulingContext {
            policies,
            composition: FilterComposition::Or,
        }
    }

    fn job() -> Job {
        let mut job = Job::new("default", "j1");
        job.spec.image = "ubuntu:22.04".to_string();
        job
    }

    #[test]
    fn policies_exclude_clusters() {
        let mut policy = FilterPolicy::new("default", "no-c2");
        policy.spec.cluster_filter.exclude = vec!["c2".to_string()];

        let kept = FilterPlugin::filter(
            &ClusterAffinityPlugin,
            &job(),
            &context_with_policies(vec![policy]),
            vec![cluster("c1", &[]), cluster("c2", &[])],
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "c1");
    }

    #[test]
    fn placement_filters_compose_disjunctively() {
        let mut workload = job();
        workload.spec.placement.filters = vec![
            LabelSelector::from_labels(BTreeMap::from([(
                "purpose".to_string(),
                "dev".to_string(),
            )])),
            LabelSelector::from_labels(BTreeMap::from([(
                "region".to_string(),
                "us-east".to_string(),
            )])),
        ];

        let kept = FilterPlugin::filter(
            &ClusterAffinityPlugin,
            &workload,
            &context_with_policies(vec![]),
            vec![
                cluster("dev", &[("purpose", "dev")]),
                cluster("east", &[("region", "us-east")]),
                cluster("other", &[("region", "eu-west")]),
            ],
        );
        let names: Vec<_> = kept.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["dev", "east"]);
    }

    #[test]
    fn and_composition_requires_every_filter() {
        let mut workload = job();
        workload.spec.placement.filters = vec![
            LabelSelector::from_labels(BTreeMap::from([(
                "purpose".to_string(),
                "dev".to_string(),
            )])),
            LabelSelector::from_labels(BTreeMap::from([(
                "region".to_string(),
                "us-east".to_string(),
            )])),
        ];

        let context = SchedulingContext {
            policies: vec![],
            composition: FilterComposition::And,
        };
        let kept = FilterPlugin::filter(
            &ClusterAffinityPlugin,
            &workload,
            &context,
            vec![
                cluster("both", &[("purpose", "dev"), ("region", "us-east")]),
                cluster("dev-only", &[("purpose", "dev")]),
            ],
        );
        let names: Vec<_> = kept.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["both"]);
    }

    #[test]
    fn highest_matching_preference_wins_without_summation() {
        let mut workload = job();
        workload.spec.placement.preferences = vec![
            PlacementPreference {
                match_labels: BTreeMap::from([("purpose".to_string(), "dev".to_string())]),
                match_expressions: vec![],
                weight: 100,
            },
            PlacementPreference {
                match_labels: BTreeMap::from([("purpose".to_string(), "dev".to_string())]),
                match_expressions: vec![],
                weight: 40,
            },
        ];

        let context = context_with_policies(vec![]);
        let labeled = ScorePlugin::score(
            &ClusterAffinityPlugin,
            &workload,
            &context,
            &cluster("dev", &[("purpose", "dev")]),
        );
        let unlabeled = ScorePlugin::score(
            &ClusterAffinityPlugin,
            &workload,
            &context,
            &cluster("plain", &[]),
        );

        // 100, not 140: the weights do not add up.
        assert_eq!(labeled, 100);
        assert_eq!(unlabeled, DEFAULT_MIN_WEIGHT);
    }
}
