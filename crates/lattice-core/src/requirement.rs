//! Agent requirements: predicates over an agent's parameters.

use crate::params::Parameters;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    Equals,
    DoesNotEqual,
    Contains,
    DoesNotContain,
    StartsWith,
    EndsWith,
    Exists,
    DoesNotExist,
    Matches,
    NoLessThanVer,
    NoMoreThanVer,
}

impl RequirementKind {
    /// Whether the predicate compares against a value.
    pub fn needs_value(&self) -> bool {
        !matches!(self, RequirementKind::Exists | RequirementKind::DoesNotExist)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Requirement {
    /// Identifier used by `disabled_settings` to drop an inherited requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: RequirementKind,
    /// Agent parameter the predicate reads.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Requirement {
    pub fn new(kind: RequirementKind, name: impl Into<String>, value: Option<&str>) -> Self {
        Self {
            id: None,
            kind,
            name: name.into(),
            value: value.map(str::to_string),
        }
    }

    /// Check the requirement is well-formed. Returns the reason otherwise.
    pub fn validate(&self) -> Result<(), String> {
        self.compile().map(|_| ())
    }

    /// Prepare the requirement for evaluation against many agents. A
    /// `matches` pattern is compiled here, once.
    pub fn compile(&self) -> Result<Predicate<'_>, String> {
        if self.name.trim().is_empty() {
            return Err("requirement has no parameter name".to_string());
        }
        let pattern = match (&self.value, self.kind.needs_value()) {
            (None, true) => return Err(format!("{:?} requires a value", self.kind)),
            (Some(pattern), true) if self.kind == RequirementKind::Matches => Some(
                Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?,
            ),
            _ => None,
        };
        Ok(Predicate {
            requirement: self,
            pattern,
        })
    }
}

/// A validated requirement ready to be checked against agent parameters.
#[derive(Debug, Clone)]
pub struct Predicate<'a> {
    requirement: &'a Requirement,
    pattern: Option<Regex>,
}

impl Predicate<'_> {
    pub fn requirement(&self) -> &Requirement {
        self.requirement
    }

    /// Evaluate against an agent's parameters.
    pub fn is_satisfied_by(&self, agent: &Parameters) -> bool {
        let requirement = self.requirement;
        let actual = agent.get(&requirement.name).map(String::as_str);
        let expected = requirement.value.as_deref().unwrap_or_default();

        match requirement.kind {
            RequirementKind::Exists => actual.is_some(),
            RequirementKind::DoesNotExist => actual.is_none(),
            RequirementKind::Equals => actual == Some(expected),
            RequirementKind::DoesNotEqual => actual != Some(expected),
            RequirementKind::Contains => actual.is_some_and(|a| a.contains(expected)),
            RequirementKind::DoesNotContain => !actual.is_some_and(|a| a.contains(expected)),
            RequirementKind::StartsWith => actual.is_some_and(|a| a.starts_with(expected)),
            RequirementKind::EndsWith => actual.is_some_and(|a| a.ends_with(expected)),
            RequirementKind::Matches => actual.is_some_and(|a| {
                self.pattern.as_ref().is_some_and(|re| re.is_match(a))
            }),
            RequirementKind::NoLessThanVer => {
                actual.is_some_and(|a| compare_versions(a, expected) != Ordering::Less)
            }
            RequirementKind::NoMoreThanVer => {
                actual.is_some_and(|a| compare_versions(a, expected) != Ordering::Greater)
            }
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{} {:?} {}", self.name, self.kind, value),
            None => write!(f, "{} {:?}", self.name, self.kind),
        }
    }
}

/// Compare dotted versions numerically, segment by segment. Missing segments
/// count as zero; non-numeric suffixes within a segment are ignored.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left = version_segments(left);
    let right = version_segments(right);
    let len = left.len().max(right.len());

    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn version_segments(version: &str) -> Vec<u64> {
    version
        .trim()
        .split('.')
        .map(|segment| {
            let digits: String = segment.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}
