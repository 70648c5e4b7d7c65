//! The scheduler's plugin pipeline.
//!
//!   Plugins are a registered set selectable by name in the scheduler
//! configuration; there is no dynamic loading. Filters narrow the candidate
//! set, scorers produce a 0..=100 score per cluster and scores from all
//! scorers are summed before ranking.

pub mod affinity;
pub mod default;

use snafu::Snafu;
use skyshift_types::kinds::{FilterPolicy, Job};

use crate::cache::ClusterSnapshot;

pub use affinity::ClusterAffinityPlugin;
pub use default::DefaultPlugin;

/// The weight a cluster receives when no preference matches it.
pub const DEFAULT_MIN_WEIGHT: u32 = 1;

/// Upper bound for a single scorer's output.
pub const MAX_SCORE: u32 = 100;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum PluginError {
    #[snafu(display("unknown scheduler plugin {name:?}"))]
    UnknownPlugin { name: String },
}

/// How a job's `placement.filters` list composes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterComposition {
    /// A cluster passes if any filter matches (the documented intent).
    #[default]
    Or,
    /// A cluster passes only if every filter matches.
    And,
}

/// Everything a plugin may consult besides the job itself.
pub struct SchedulingContext {
    /// Filter policies of the job's namespace that select this job.
    pub policies: Vec<FilterPolicy>,
    pub composition: FilterComposition,
}

pub trait FilterPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the subset of `clusters` this plugin keeps.
    fn filter(
        &self,
        job: &Job,
        context: &SchedulingContext,
        clusters: Vec<ClusterSnapshot>,
    ) -> Vec<ClusterSnapshot>;
}

pub trait ScorePlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Scores one cluster in `0..=MAX_SCORE`.
    fn score(&self, job: &Job, context: &SchedulingContext, cluster: &ClusterSnapshot) -> u32;
}

/// The configured pipeline: filters run in order, scorer outputs are
/// summed.
pub struct PluginSet {
    filters: Vec<Box<dyn FilterPlugin>>,
    scorers: Vec<Box<dyn ScorePlugin>>,
}

impl std::fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSet")
            .field("filters", &self.filters.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("scorers", &self.scorers.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl PluginSet {
    /// Builds a pipeline from plugin names, preserving order.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, PluginError> {
        let mut set = PluginSet {
            filters: vec![],
            scorers: vec![],
        };
        for name in names {
            match name.as_ref() {
                "DefaultPlugin" => {
                    set.filters.push(Box::new(DefaultPlugin));
                    set.scorers.push(Box::new(DefaultPlugin));
                }
                "ClusterAffinityPlugin" => {
                    set.filters.push(Box::new(ClusterAffinityPlugin));
                    set.scorers.push(Box::new(ClusterAffinityPlugin));
                }
                unknown => {
                    return UnknownPluginSnafu { name: unknown }.fail();
                }
            }
        }
        Ok(set)
    }

    /// The standard pipeline: resource fit, then affinity.
    pub fn standard() -> Self {
        PluginSet::from_names(&["DefaultPlugin", "ClusterAffinityPlugin"])
            .expect("standard plugins are registered")
    }

    pub fn filter(
        &self,
        job: &Job,
        context: &SchedulingContext,
        mut clusters: Vec<ClusterSnapshot>,
    ) -> Vec<ClusterSnapshot> {
        for plugin in &self.filters {
            clusters = plugin.filter(job, context, clusters);
            if clusters.is_empty() {
                break;
            }
        }
        clusters
    }

    pub fn score(&self, job: &Job, context: &SchedulingContext, cluster: &ClusterSnapshot) -> u32 {
        self.scorers
            .iter()
            .map(|plugin| plugin.score(job, context, cluster).min(MAX_SCORE))
            .sum()
    }
}
