//! Condition timelines recorded on object status.
//!
//! Conditions are the user-visible failure surface: the scheduler records
//! `Unschedulable`, controllers record backend failures, and the CLI renders
//! them alongside state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The status of a condition, one of `True`, `False` or `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub last_transition: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Condition {
            type_: type_.into(),
            status,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_transition: Utc::now(),
        }
    }
}

/// Upserts `new` into `conditions`, keyed by condition type.
///
/// If a condition of the same type already exists with the same status, its
/// `last_transition` is preserved; `last_transition` only moves when the
/// status actually changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition = existing.last_transition;
            }
            *existing = new;
        }
        None => conditions.push(new),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_condition_is_appended() {
        let mut conditions = vec![];
        set_condition(
            &mut conditions,
            Condition::new("Unschedulable", ConditionStatus::True, "NoCapacity", "full"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "Unschedulable");
    }

    #[test]
    fn unchanged_status_preserves_transition_time() {
        let mut conditions = vec![];
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "Up", "ok"),
        );
        let first_transition = conditions[0].last_transition;

        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "Up", "still ok"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition, first_transition);
        assert_eq!(conditions[0].message.as_deref(), Some("still ok"));
    }

    #[test]
    fn changed_status_moves_transition_time() {
        let mut conditions = vec![Condition {
            type_: "Ready".into(),
            status: ConditionStatus::True,
            reason: None,
            message: None,
            last_transition: Utc::now() - chrono::Duration::hours(1),
        }];
        let old_transition = conditions[0].last_transition;

        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "Down", "gone"),
        );
        assert_eq!(conditions.len(), 1);
        assert!(conditions[0].last_transition > old_transition);
    }
}
