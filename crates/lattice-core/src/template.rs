//! Reusable job blueprints and the registry that resolves their inheritance.

use crate::dependency::DependencyDeclaration;
use crate::error::{Error, Result};
use crate::ids::TemplateId;
use crate::job::Step;
use crate::params::{ParameterSpecs, Parameters};
use crate::requirement::Requirement;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named job blueprint. Owns no jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Template {
    pub id: TemplateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Template this one inherits from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TemplateId>,
    #[serde(default)]
    pub params: Parameters,
    /// Parameter metadata. A child's spec for a name replaces the parent's.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub param_specs: ParameterSpecs,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    /// Output rules. A child that sets them replaces the parent's entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_rules: Option<Vec<String>>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
}

impl Template {
    pub fn new(id: impl Into<TemplateId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Value-merge `self` over `base`: parameters and timeout override, steps
    /// and requirements append, output rules replace, and a dependency on a
    /// producer already named by `base` replaces that dependency.
    pub fn merged_onto(&self, base: &Template) -> Template {
        let mut params = base.params.clone();
        params.extend(self.params.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut param_specs = base.param_specs.clone();
        param_specs.extend(
            self.param_specs
                .iter()
                .map(|(k, spec)| (k.clone(), spec.clone())),
        );

        let mut dependencies = base.dependencies.clone();
        for dep in &self.dependencies {
            match dependencies.iter_mut().find(|d| d.producer == dep.producer) {
                Some(existing) => *existing = dep.clone(),
                None => dependencies.push(dep.clone()),
            }
        }

        Template {
            id: self.id.clone(),
            name: self.name.clone().or_else(|| base.name.clone()),
            parent: None,
            params,
            param_specs,
            steps: base.steps.iter().chain(&self.steps).cloned().collect(),
            requirements: base
                .requirements
                .iter()
                .chain(&self.requirements)
                .cloned()
                .collect(),
            artifact_rules: self
                .artifact_rules
                .clone()
                .or_else(|| base.artifact_rules.clone()),
            dependencies,
            timeout_minutes: self.timeout_minutes.or(base.timeout_minutes),
        }
    }
}

/// In-memory template store for one run.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<TemplateId, Template>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: Template) -> Result<()> {
        if self.templates.contains_key(&template.id) {
            return Err(Error::DuplicateTemplate {
                name: template.id.clone(),
            });
        }
        self.templates.insert(template.id.clone(), template);
        Ok(())
    }

    pub fn resolve(&self, name: &TemplateId) -> Result<&Template> {
        self.lookup(name, "registry lookup")
    }

    /// Single-level template with its whole parent chain merged in, parent
    /// first and child winning.
    pub fn flatten(&self, name: &TemplateId) -> Result<Template> {
        let mut chain: Vec<&Template> = Vec::new();
        let mut current = self.resolve(name)?;

        loop {
            if chain.iter().any(|t| t.id == current.id) {
                let mut cycle: Vec<TemplateId> = chain.iter().map(|t| t.id.clone()).collect();
                cycle.push(current.id.clone());
                return Err(Error::CyclicTemplate { chain: cycle });
            }
            chain.push(current);

            match &current.parent {
                Some(parent) => {
                    current = self.lookup(parent, &format!("template {}", current.id))?;
                }
                None => break,
            }
        }

        let mut flattened = Template::default();
        for template in chain.iter().rev() {
            flattened = template.merged_onto(&flattened);
        }
        Ok(flattened)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TemplateId> {
        self.templates.keys()
    }

    fn lookup(&self, name: &TemplateId, referrer: &str) -> Result<&Template> {
        self.templates
            .get(name)
            .ok_or_else(|| Error::UnknownTemplate {
                name: name.clone(),
                referrer: referrer.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{FailureAction, SnapshotDependency};
    use pretty_assertions::assert_eq;

    fn with_params(id: &str, parent: Option<&str>, pairs: &[(&str, &str)]) -> Template {
        Template {
            parent: parent.map(TemplateId::new),
            params: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Template::new(id)
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = TemplateRegistry::new();
        registry.register(Template::new("Build")).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(&"Build".into()).unwrap().id.as_str(), "Build");
    }

    #[test]
    fn test_duplicate_template_is_rejected() {
        let mut registry = TemplateRegistry::new();
        registry.register(Template::new("Build")).unwrap();
        let err = registry.register(Template::new("Build")).unwrap_err();
        assert!(matches!(err, Error::DuplicateTemplate { .. }));
    }

    #[test]
    fn test_unknown_template() {
        let registry = TemplateRegistry::new();
        let err = registry.resolve(&"Missing".into()).unwrap_err();
        assert!(matches!(err, Error::UnknownTemplate { .. }));
    }

    #[test]
    fn test_flatten_merges_parent_first() {
        let mut registry = TemplateRegistry::new();
        registry
            .register(with_params("Base", None, &[("os", "linux"), ("cpu", "x64")]))
            .unwrap();
        registry
            .register(with_params("Python", Some("Base"), &[("cpu", "arm64")]))
            .unwrap();

        let flat = registry.flatten(&"Python".into()).unwrap();
        assert_eq!(flat.parent, None);
        assert_eq!(flat.params["os"], "linux");
        assert_eq!(flat.params["cpu"], "arm64");
    }

    #[test]
    fn test_flatten_unknown_parent() {
        let mut registry = TemplateRegistry::new();
        registry
            .register(with_params("Child", Some("Ghost"), &[]))
            .unwrap();
        match registry.flatten(&"Child".into()).unwrap_err() {
            Error::UnknownTemplate { name, referrer } => {
                assert_eq!(name.as_str(), "Ghost");
                assert_eq!(referrer, "template Child");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_flatten_cyclic_parents() {
        let mut registry = TemplateRegistry::new();
        registry.register(with_params("A", Some("B"), &[])).unwrap();
        registry.register(with_params("B", Some("A"), &[])).unwrap();
        match registry.flatten(&"A".into()).unwrap_err() {
            Error::CyclicTemplate { chain } => {
                let names: Vec<_> = chain.iter().map(TemplateId::as_str).collect();
                assert_eq!(names, vec!["A", "B", "A"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_child_dependency_replaces_parent_dependency() {
        let base = Template {
            dependencies: vec![DependencyDeclaration::snapshot(
                "Core",
                SnapshotDependency::default(),
            )],
            timeout_minutes: Some(30),
            ..Template::new("Base")
        };
        let child = Template {
            dependencies: vec![DependencyDeclaration::snapshot(
                "Core",
                SnapshotDependency::on_failure(FailureAction::Ignore),
            )],
            ..Template::new("Child")
        };

        let merged = child.merged_onto(&base);
        assert_eq!(merged.dependencies.len(), 1);
        assert_eq!(
            merged.dependencies[0].snapshot.as_ref().unwrap().on_failure,
            FailureAction::Ignore
        );
        assert_eq!(merged.timeout_minutes, Some(30));
    }
}
