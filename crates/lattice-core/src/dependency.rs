//! Dependency edges between jobs.
//!
//! A consumer declares, per producer, a snapshot dependency, an artifact
//! dependency, or both.

use crate::artifact::{ArtifactRule, rule_lines};
use crate::error::{Error, Result};
use crate::ids::JobId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What happens to a consumer when a snapshot producer fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// The consumer is cancelled and its payload never runs.
    #[default]
    FailToStart,
    /// The consumer runs; the failure is recorded as a problem on it.
    AddProblemToBuild,
    Ignore,
}

impl FailureAction {
    /// Whether a failed producer still lets the consumer run.
    pub fn tolerates_failure(&self) -> bool {
        !matches!(self, FailureAction::FailToStart)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SnapshotDependency {
    #[serde(default)]
    pub on_failure: FailureAction,
    /// Consumer and producer build from the same source revision.
    #[serde(default = "default_synchronize_revisions")]
    pub synchronize_revisions: bool,
}

fn default_synchronize_revisions() -> bool {
    true
}

impl Default for SnapshotDependency {
    fn default() -> Self {
        Self {
            on_failure: FailureAction::default(),
            synchronize_revisions: default_synchronize_revisions(),
        }
    }
}

impl SnapshotDependency {
    pub fn on_failure(action: FailureAction) -> Self {
        Self {
            on_failure: action,
            ..Self::default()
        }
    }
}

/// Artifact dependency as written in a declaration. Each entry may hold
/// several newline-separated rules; parameters are not yet substituted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactDependency {
    pub rules: Vec<String>,
    #[serde(default)]
    pub clean_destination: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DependencyDeclaration {
    pub producer: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactDependency>,
}

impl DependencyDeclaration {
    pub fn snapshot(producer: impl Into<JobId>, snapshot: SnapshotDependency) -> Self {
        Self {
            producer: producer.into(),
            snapshot: Some(snapshot),
            artifacts: None,
        }
    }

    pub fn artifacts(producer: impl Into<JobId>, artifacts: ArtifactDependency) -> Self {
        Self {
            producer: producer.into(),
            snapshot: None,
            artifacts: Some(artifacts),
        }
    }

    /// Resolve into a typed dependency. `substitute` expands parameter
    /// references in each rule line before it is parsed.
    pub fn resolve(
        &self,
        consumer: &JobId,
        mut substitute: impl FnMut(&str) -> Result<String>,
    ) -> Result<Dependency> {
        if self.snapshot.is_none() && self.artifacts.is_none() {
            return Err(Error::InvalidDeclaration {
                job: consumer.clone(),
                reason: format!(
                    "dependency on {} declares neither a snapshot nor artifacts",
                    self.producer
                ),
            });
        }

        let artifacts = match &self.artifacts {
            Some(declared) => {
                let mut rules = Vec::new();
                for block in &declared.rules {
                    let block = substitute(block)?;
                    for line in rule_lines(&block) {
                        let rule =
                            ArtifactRule::parse(line).map_err(|reason| Error::InvalidArtifactRule {
                                job: consumer.clone(),
                                rule: line.to_string(),
                                reason,
                            })?;
                        rules.push(rule);
                    }
                }
                if rules.is_empty() {
                    return Err(Error::InvalidDeclaration {
                        job: consumer.clone(),
                        reason: format!("artifact dependency on {} has no rules", self.producer),
                    });
                }
                Some(ArtifactRules {
                    rules,
                    clean_destination: declared.clean_destination,
                })
            }
            None => None,
        };

        Ok(Dependency {
            producer: self.producer.clone(),
            snapshot: self.snapshot.clone(),
            artifacts,
        })
    }
}

/// Parsed artifact rules of a resolved dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRules {
    pub rules: Vec<ArtifactRule>,
    pub clean_destination: bool,
}

/// A resolved dependency of one consumer on one producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub producer: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactRules>,
}

impl Dependency {
    /// The failure action of the snapshot part, if any.
    pub fn failure_action(&self) -> Option<FailureAction> {
        self.snapshot.as_ref().map(|s| s.on_failure)
    }

    /// Whether a failed producer leaves the consumer free to succeed.
    pub fn tolerates_failure(&self) -> bool {
        self.artifacts.is_none() && self.failure_action().is_some_and(|a| a.tolerates_failure())
    }

    pub fn synchronizes_revisions(&self) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|s| s.synchronize_revisions)
    }
}

/// Graph edge kinds, one per dependency part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EdgeKind {
    Snapshot {
        on_failure: FailureAction,
        synchronize_revisions: bool,
    },
    Artifact {
        rules: Vec<String>,
        clean_destination: bool,
    },
}

impl Dependency {
    /// Split into typed edges, snapshot first.
    pub fn edge_kinds(&self) -> Vec<EdgeKind> {
        let mut kinds = Vec::with_capacity(2);
        if let Some(snapshot) = &self.snapshot {
            kinds.push(EdgeKind::Snapshot {
                on_failure: snapshot.on_failure,
                synchronize_revisions: snapshot.synchronize_revisions,
            });
        }
        if let Some(artifacts) = &self.artifacts {
            kinds.push(EdgeKind::Artifact {
                rules: artifacts.rules.iter().map(ToString::to_string).collect(),
                clean_destination: artifacts.clean_destination,
            });
        }
        kinds
    }
}
