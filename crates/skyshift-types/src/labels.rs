//! Label selectors evaluated locally against object label maps.
//!
//! Placement filters and preferences, filter policies and service selectors
//! all share this type. Unlike a Kubernetes API call there is no query
//! string to build; the control plane evaluates selectors against its own
//! cluster cache.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

type Result<T, E = SelectorError> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum SelectorError {
    #[snafu(display("match expression on key {key:?} with operator {operator} must have values"))]
    OperatorWithoutValues { key: String, operator: Operator },
}

/// Operators allowed in a [`MatchExpression`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Operator {
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchExpression {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<MatchExpression>,
}

impl LabelSelector {
    pub fn from_labels(match_labels: BTreeMap<String, String>) -> Self {
        LabelSelector {
            match_labels,
            match_expressions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Evaluates this selector against a label map.
    ///
    /// The selector matches when all `match_labels` are present with equal
    /// values OR all `match_expressions` evaluate to true. An entirely empty
    /// selector matches everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        if self.is_empty() {
            return Ok(true);
        }

        if !self.match_labels.is_empty()
            && self
                .match_labels
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
        {
            return Ok(true);
        }

        if !self.match_expressions.is_empty() {
            let mut all = true;
            for expression in &self.match_expressions {
                if !expression.evaluate(labels)? {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Returns every schema violation in this selector, used by object
    /// validation before anything is persisted.
    pub fn validate(&self) -> Vec<String> {
        self.match_expressions
            .iter()
            .filter(|expression| expression.values.is_empty())
            .map(|expression| {
                format!(
                    "match expression on key '{}' with operator {} must have values",
                    expression.key, expression.operator
                )
            })
            .collect()
    }
}

impl MatchExpression {
    fn evaluate(&self, labels: &BTreeMap<String, String>) -> Result<bool> {
        if self.values.is_empty() {
            return OperatorWithoutValuesSnafu {
                key: self.key.clone(),
                operator: self.operator,
            }
            .fail();
        }

        let actual = labels.get(&self.key);
        Ok(match self.operator {
            Operator::In => actual.is_some_and(|value| self.values.contains(value)),
            Operator::NotIn => !actual.is_some_and(|value| self.values.contains(value)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector.matches(&labels(&[])).expect("selector"));
        assert!(selector.matches(&labels(&[("a", "b")])).expect("selector"));
    }

    #[test]
    fn match_labels_require_all_pairs() {
        let selector = LabelSelector::from_labels(labels(&[("purpose", "dev"), ("tier", "gpu")]));

        assert!(selector
            .matches(&labels(&[("purpose", "dev"), ("tier", "gpu"), ("x", "y")]))
            .expect("selector"));
        assert!(!selector
            .matches(&labels(&[("purpose", "dev")]))
            .expect("selector"));
        assert!(!selector
            .matches(&labels(&[("purpose", "prod"), ("tier", "gpu")]))
            .expect("selector"));
    }

    #[test]
    fn expressions_in_and_notin() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![
                MatchExpression {
                    key: "region".into(),
                    operator: Operator::In,
                    values: vec!["us-east".into(), "us-west".into()],
                },
                MatchExpression {
                    key: "tier".into(),
                    operator: Operator::NotIn,
                    values: vec!["spot".into()],
                },
            ],
        };

        assert!(selector
            .matches(&labels(&[("region", "us-east")]))
            .expect("selector"));
        assert!(!selector
            .matches(&labels(&[("region", "eu-central")]))
            .expect("selector"));
        // NotIn holds when the key is absent entirely.
        assert!(!selector
            .matches(&labels(&[("region", "eu-central"), ("tier", "spot")]))
            .expect("selector"));
    }

    #[test]
    fn labels_or_expressions_compose_disjunctively() {
        let selector = LabelSelector {
            match_labels: labels(&[("purpose", "dev")]),
            match_expressions: vec![MatchExpression {
                key: "region".into(),
                operator: Operator::In,
                values: vec!["us-east".into()],
            }],
        };

        // match_labels miss, expressions hit.
        assert!(selector
            .matches(&labels(&[("region", "us-east")]))
            .expect("selector"));
        // match_labels hit, expressions miss.
        assert!(selector
            .matches(&labels(&[("purpose", "dev")]))
            .expect("selector"));
        // Both miss.
        assert!(!selector.matches(&labels(&[("a", "b")])).expect("selector"));
    }

    #[test]
    fn expression_without_values_is_an_error() {
        let expression = MatchExpression {
            key: "region".into(),
            operator: Operator::In,
            values: vec![],
        };
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![expression],
        };

        assert!(selector.matches(&labels(&[])).is_err());
        assert_eq!(selector.validate().len(), 1);
    }
}
