//! Local evaluation of label selectors against cached objects.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single `key op values` clause of a selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map(|v| self.values.contains(v))
                .unwrap_or(false),
            Operator::NotIn => labels
                .get(&self.key)
                .map(|v| !self.values.contains(v))
                .unwrap_or(true),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In if self.values.len() == 1 => write!(f, "{}={}", self.key, values),
            Operator::In => write!(f, "{} in ({})", self.key, values),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, values),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A parsed label selector.
///
/// `Nothing` is what an absent or empty JobBatch selector resolves to: a batch
/// without a selector runs zero templates instead of every template in the
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Nothing,
    Match(Vec<Requirement>),
}

impl Selector {
    /// Equality selector over the given labels
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let requirements = labels
            .into_iter()
            .map(|(k, v)| Requirement {
                key: k.into(),
                operator: Operator::In,
                values: BTreeSet::from([v.into()]),
            })
            .collect::<Vec<_>>();
        if requirements.is_empty() {
            Selector::Nothing
        } else {
            Selector::Match(requirements)
        }
    }

    /// Parse a selector from a JobBatch spec.
    ///
    /// Unknown operators and set operators without values are rejected so a
    /// typo never silently widens or narrows the template set.
    pub fn from_label_selector(selector: Option<&LabelSelector>) -> Result<Self> {
        let selector = match selector {
            Some(s) => s,
            None => return Ok(Selector::Nothing),
        };

        let mut requirements = Vec::new();
        for (key, value) in selector.match_labels.iter().flatten() {
            requirements.push(Requirement {
                key: key.clone(),
                operator: Operator::In,
                values: BTreeSet::from([value.clone()]),
            });
        }

        for expr in selector.match_expressions.iter().flatten() {
            let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();
            let operator = match expr.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => {
                    return Err(Error::InvalidSpec(format!(
                        "invalid selector: unknown operator '{}' for key '{}'",
                        other, expr.key
                    )))
                }
            };
            match operator {
                Operator::In | Operator::NotIn if values.is_empty() => {
                    return Err(Error::InvalidSpec(format!(
                        "invalid selector: operator '{}' for key '{}' requires values",
                        expr.operator, expr.key
                    )));
                }
                Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                    return Err(Error::InvalidSpec(format!(
                        "invalid selector: operator '{}' for key '{}' takes no values",
                        expr.operator, expr.key
                    )));
                }
                _ => {}
            }
            requirements.push(Requirement {
                key: expr.key.clone(),
                operator,
                values,
            });
        }

        if requirements.is_empty() {
            Ok(Selector::Nothing)
        } else {
            Ok(Selector::Match(requirements))
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Selector::Nothing => false,
            Selector::Match(reqs) => reqs.iter().all(|r| r.matches(labels)),
        }
    }

    /// Rendering for the `labelSelector` query parameter, `None` for `Nothing`
    pub fn to_query(&self) -> Option<String> {
        match self {
            Selector::Nothing => None,
            Selector::Match(reqs) => Some(
                reqs.iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        }
    }
}
