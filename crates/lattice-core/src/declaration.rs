//! The user-authored declaration file: a tree of projects holding parameters,
//! templates, jobs and matrices.

use crate::dependency::{DependencyDeclaration, FailureAction};
use crate::ids::{JobId, TemplateId};
use crate::job::JobDeclaration;
use crate::params::Parameters;
use crate::template::Template;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root of a declaration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BuildDeclaration {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(flatten)]
    pub project: ProjectDeclaration,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectDeclaration {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inherited by every job in this project and its sub-projects.
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub templates: Vec<Template>,
    #[serde(default)]
    pub jobs: Vec<JobDeclaration>,
    #[serde(default)]
    pub matrices: Vec<MatrixDeclaration>,
    #[serde(default)]
    pub projects: Vec<ProjectDeclaration>,
}

impl ProjectDeclaration {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// A cross-product of axes applied to one template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MatrixDeclaration {
    pub id: String,
    pub template: TemplateId,
    /// Axis name to its values. Each value becomes a job-local parameter.
    pub axes: BTreeMap<String, Vec<String>>,
    /// Extra combinations added after exclusion.
    #[serde(default)]
    pub include: Vec<BTreeMap<String, String>>,
    /// Partial combinations; any generated combination matching one is dropped.
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, String>>,
    /// Parameters shared by every generated job.
    #[serde(default)]
    pub params: Parameters,
    #[serde(default)]
    pub dependencies: Vec<DependencyDeclaration>,
    /// Job id with `%axis%` references, e.g. `Test_%os%_%python%`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite: Option<CompositeDeclaration>,
}

/// Aggregator job depending on every job a matrix generates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CompositeDeclaration {
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub on_failure: FailureAction,
    /// Artifact rules applied to every generated job, collecting its outputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_rules: Vec<String>,
}
