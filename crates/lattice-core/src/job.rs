//! Job declarations and their fully-resolved form.
//!
//! A [`JobDeclaration`] is what a user writes: a template reference plus
//! local overrides. [`JobResolver`] merges it with its flattened template and
//! the inherited project parameters into an immutable [`ResolvedJob`].

use crate::artifact::{OutputRule, normalize_destination, rule_lines};
use crate::dependency::{Dependency, DependencyDeclaration};
use crate::error::{Error, Result};
use crate::ids::{JobId, TemplateId};
use crate::params::{ParameterResolver, ParameterSpecs, Parameters};
use crate::requirement::Requirement;
use crate::template::{Template, TemplateRegistry};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    #[default]
    Leaf,
    /// No payload; the outcome is derived from the dependencies.
    Composite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run only while every previous step has succeeded.
    #[default]
    OnSuccess,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub script: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

impl Step {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            script: script.into(),
            working_dir: None,
            execution_mode: ExecutionMode::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobDeclaration {
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateId>,
    /// Job-local parameter overrides.
    #[serde(default)]
    pub params: Parameters,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub param_specs: ParameterSpecs,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    /// Output rules; replace the template's when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_rules: Option<Vec<String>>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
    /// Ids of inherited steps or requirements to drop.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_settings: Vec<String>,
}

impl JobDeclaration {
    pub fn new(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn composite(id: impl Into<JobId>) -> Self {
        Self {
            kind: JobKind::Composite,
            ..Self::new(id)
        }
    }

    fn as_template(&self) -> Template {
        Template {
            id: TemplateId::new(self.id.as_str()),
            name: self.name.clone(),
            parent: None,
            params: Parameters::new(),
            param_specs: self.param_specs.clone(),
            steps: self.steps.clone(),
            requirements: self.requirements.clone(),
            artifact_rules: self.artifact_rules.clone(),
            dependencies: self.dependencies.clone(),
            timeout_minutes: self.timeout_minutes,
        }
    }
}

/// A job with every inherited setting merged and every reference substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedJob {
    pub id: JobId,
    pub name: String,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateId>,
    pub params: Parameters,
    pub steps: Vec<Step>,
    pub requirements: Vec<Requirement>,
    pub output_rules: Vec<OutputRule>,
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
}

impl ResolvedJob {
    pub fn is_composite(&self) -> bool {
        self.kind == JobKind::Composite
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_minutes
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
    }
}

/// Turns declarations into resolved jobs against a template registry.
pub struct JobResolver<'a> {
    registry: &'a TemplateRegistry,
    params: ParameterResolver,
}

impl<'a> JobResolver<'a> {
    pub fn new(registry: &'a TemplateRegistry) -> Self {
        Self {
            registry,
            params: ParameterResolver::new(),
        }
    }

    /// Resolve one declaration. `global` is the inherited project layer.
    pub fn resolve(&self, decl: &JobDeclaration, global: &Parameters) -> Result<ResolvedJob> {
        let job = &decl.id;
        if job.as_str().trim().is_empty() {
            return Err(Error::InvalidDeclaration {
                job: job.clone(),
                reason: "job id is empty".to_string(),
            });
        }
        check_unique_producers(job, &decl.dependencies)?;

        let template = match &decl.template {
            Some(name) => self.registry.flatten(name)?,
            None => Template::default(),
        };
        let merged = decl.as_template().merged_onto(&template);

        let params = self
            .params
            .resolve(job, global, &template.params, &decl.params)?;
        self.params.check_specs(job, &merged.param_specs, &params)?;
        let substitute =
            |field: &str, text: &str| self.params.substitute(job, field, text, &params);

        let disabled: BTreeSet<&str> = decl.disabled_settings.iter().map(String::as_str).collect();
        let enabled = |id: &Option<String>| !id.as_deref().is_some_and(|id| disabled.contains(id));

        let mut steps = Vec::new();
        for step in merged.steps.iter().filter(|s| enabled(&s.id)) {
            let field = format!("step '{}'", step.name);
            steps.push(Step {
                id: step.id.clone(),
                name: substitute(&field, &step.name)?,
                script: substitute(&field, &step.script)?,
                working_dir: step
                    .working_dir
                    .as_deref()
                    .map(|dir| substitute(&field, dir))
                    .transpose()?,
                execution_mode: step.execution_mode,
            });
        }

        let mut requirements = Vec::new();
        for requirement in merged.requirements.iter().filter(|r| enabled(&r.id)) {
            let field = format!("requirement on '{}'", requirement.name);
            let resolved = Requirement {
                id: requirement.id.clone(),
                kind: requirement.kind,
                name: substitute(&field, &requirement.name)?,
                value: requirement
                    .value
                    .as_deref()
                    .map(|value| substitute(&field, value))
                    .transpose()?,
            };
            resolved
                .validate()
                .map_err(|reason| Error::InvalidRequirement {
                    job: job.clone(),
                    name: resolved.name.clone(),
                    reason,
                })?;
            requirements.push(resolved);
        }

        let mut output_rules = Vec::new();
        for block in merged.artifact_rules.iter().flatten() {
            let block = substitute("artifact rules", block)?;
            for line in rule_lines(&block) {
                let mut rule =
                    OutputRule::parse(line).map_err(|reason| Error::InvalidArtifactRule {
                        job: job.clone(),
                        rule: line.to_string(),
                        reason,
                    })?;
                if let Some(target) = rule.target.take() {
                    let normalized =
                        normalize_destination(&target).ok_or_else(|| Error::UnsafeArtifactPath {
                            job: job.clone(),
                            rule: line.to_string(),
                            destination: target,
                        })?;
                    rule.target = (!normalized.is_empty()).then_some(normalized);
                }
                output_rules.push(rule);
            }
        }

        let mut dependencies = Vec::with_capacity(merged.dependencies.len());
        for dep in &merged.dependencies {
            let field = format!("artifact rules from {}", dep.producer);
            dependencies.push(dep.resolve(job, |text| substitute(&field, text))?);
        }

        if decl.kind == JobKind::Composite && !steps.is_empty() {
            return Err(Error::InvalidDeclaration {
                job: job.clone(),
                reason: "a composite job cannot have steps".to_string(),
            });
        }

        let name = match &decl.name {
            Some(name) => substitute("name", name)?,
            None => job.to_string(),
        };

        Ok(ResolvedJob {
            id: job.clone(),
            name,
            kind: decl.kind,
            template: decl.template.clone(),
            params,
            steps,
            requirements,
            output_rules,
            dependencies,
            timeout_minutes: merged.timeout_minutes,
        })
    }
}

fn check_unique_producers(job: &JobId, dependencies: &[DependencyDeclaration]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for dep in dependencies {
        if !seen.insert(&dep.producer) {
            return Err(Error::InvalidDeclaration {
                job: job.clone(),
                reason: format!("dependency on {} declared more than once", dep.producer),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{ArtifactDependency, FailureAction, SnapshotDependency};
    use crate::params::ParameterSpec;
    use crate::requirement::RequirementKind;
    use pretty_assertions::assert_eq;

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn registry_with(template: Template) -> TemplateRegistry {
        let mut registry = TemplateRegistry::new();
        registry.register(template).unwrap();
        registry
    }

    fn build_template() -> Template {
        let mut compile = Step::new("Compile %target%", "cmake --build . --target %target%");
        compile.id = Some("compile".to_string());
        let mut arch = Requirement::new(RequirementKind::Equals, "os.arch", Some("%cpu%"));
        arch.id = Some("arch".to_string());

        Template {
            params: params(&[("target", "all"), ("cpu", "amd64")]),
            steps: vec![compile, Step::new("Package", "cpack")],
            requirements: vec![arch],
            artifact_rules: Some(vec!["build/*.tar.gz => dist".to_string()]),
            timeout_minutes: Some(45),
            ..Template::new("Build")
        }
    }

    #[test]
    fn test_resolve_applies_template_and_overrides() {
        let registry = registry_with(build_template());
        let decl = JobDeclaration {
            template: Some("Build".into()),
            params: params(&[("target", "qdb")]),
            ..JobDeclaration::new("Build_Linux")
        };

        let job = JobResolver::new(&registry)
            .resolve(&decl, &params(&[("cpu", "ignored"), ("os", "linux")]))
            .unwrap();

        assert_eq!(job.name, "Build_Linux");
        assert_eq!(job.params["target"], "qdb");
        assert_eq!(job.params["cpu"], "amd64");
        assert_eq!(job.params["os"], "linux");
        assert_eq!(job.steps[0].name, "Compile qdb");
        assert_eq!(job.steps[0].script, "cmake --build . --target qdb");
        assert_eq!(job.requirements[0].value.as_deref(), Some("amd64"));
        assert_eq!(job.output_rules[0].target.as_deref(), Some("dist"));
        assert_eq!(job.timeout(), Some(Duration::from_secs(45 * 60)));
    }

    #[test]
    fn test_disabled_settings_drop_inherited_items() {
        let registry = registry_with(build_template());
        let decl = JobDeclaration {
            template: Some("Build".into()),
            disabled_settings: vec!["compile".to_string(), "arch".to_string()],
            ..JobDeclaration::new("Docs")
        };

        let job = JobResolver::new(&registry)
            .resolve(&decl, &Parameters::new())
            .unwrap();

        let names: Vec<_> = job.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Package"]);
        assert!(job.requirements.is_empty());
    }

    #[test]
    fn test_unresolved_reference_in_step_names_the_field() {
        let registry = TemplateRegistry::new();
        let decl = JobDeclaration {
            steps: vec![Step::new("Test", "pytest --python %python.exe%")],
            ..JobDeclaration::new("Test")
        };

        match JobResolver::new(&registry)
            .resolve(&decl, &Parameters::new())
            .unwrap_err()
        {
            Error::UnresolvedReference {
                field, reference, ..
            } => {
                assert_eq!(field, "step 'Test'");
                assert_eq!(reference, "python.exe");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dependency_rules_are_substituted() {
        let registry = TemplateRegistry::new();
        let decl = JobDeclaration {
            params: params(&[("platform", "linux-64bit")]),
            dependencies: vec![DependencyDeclaration {
                producer: "Build_Linux".into(),
                snapshot: Some(SnapshotDependency::on_failure(FailureAction::AddProblemToBuild)),
                artifacts: Some(ArtifactDependency {
                    rules: vec!["*-%platform%-c-api.tar.gz!**/*=>qdb".to_string()],
                    clean_destination: false,
                }),
            }],
            steps: vec![Step::new("Test", "ctest")],
            ..JobDeclaration::new("Test_Linux")
        };

        let job = JobResolver::new(&registry)
            .resolve(&decl, &Parameters::new())
            .unwrap();
        let rules = &job.dependencies[0].artifacts.as_ref().unwrap().rules;
        assert_eq!(rules[0].source, "*-linux-64bit-c-api.tar.gz");
        assert_eq!(rules[0].inner.as_deref(), Some("**/*"));
    }

    #[test]
    fn test_composite_with_steps_is_invalid() {
        let registry = TemplateRegistry::new();
        let decl = JobDeclaration {
            steps: vec![Step::new("Oops", "true")],
            ..JobDeclaration::composite("All")
        };
        let err = JobResolver::new(&registry)
            .resolve(&decl, &Parameters::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDeclaration { .. }));
    }

    #[test]
    fn test_duplicate_producer_is_invalid() {
        let registry = TemplateRegistry::new();
        let decl = JobDeclaration {
            dependencies: vec![
                DependencyDeclaration::snapshot("A", SnapshotDependency::default()),
                DependencyDeclaration::snapshot("A", SnapshotDependency::default()),
            ],
            ..JobDeclaration::new("B")
        };
        let err = JobResolver::new(&registry)
            .resolve(&decl, &Parameters::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDeclaration { .. }));
    }

    #[test]
    fn test_invalid_requirement_is_reported() {
        let registry = TemplateRegistry::new();
        let decl = JobDeclaration {
            requirements: vec![Requirement::new(RequirementKind::Matches, "os", Some("(("))],
            ..JobDeclaration::new("Bad")
        };
        let err = JobResolver::new(&registry)
            .resolve(&decl, &Parameters::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequirement { .. }));
    }

    #[test]
    fn test_required_template_parameter_must_be_overridden() {
        let registry = registry_with(Template {
            params: params(&[("env.PYTHON_CMD", "")]),
            param_specs: [(
                "env.PYTHON_CMD".to_string(),
                ParameterSpec {
                    label: Some("Python executable".to_string()),
                    ..ParameterSpec::required()
                },
            )]
            .into(),
            ..Template::new("PythonBuild")
        });

        let bare = JobDeclaration {
            template: Some("PythonBuild".into()),
            ..JobDeclaration::new("Python_Build")
        };
        let err = JobResolver::new(&registry)
            .resolve(&bare, &Parameters::new())
            .unwrap_err();
        assert!(matches!(err, Error::EmptyParameter { ref name, .. } if name == "env.PYTHON_CMD"));

        let overridden = JobDeclaration {
            params: params(&[("env.PYTHON_CMD", "%python37%")]),
            ..bare
        };
        let job = JobResolver::new(&registry)
            .resolve(&overridden, &params(&[("python37", "/usr/bin/python3.7")]))
            .unwrap();
        assert_eq!(job.params["env.PYTHON_CMD"], "/usr/bin/python3.7");
    }

    #[test]
    fn test_output_rule_target_must_stay_inside_artifact_root() {
        let registry = TemplateRegistry::new();
        let decl = JobDeclaration {
            artifact_rules: Some(vec!["out/*.txt => ../../escaped".to_string()]),
            ..JobDeclaration::new("Build")
        };
        let err = JobResolver::new(&registry)
            .resolve(&decl, &Parameters::new())
            .unwrap_err();
        assert!(matches!(err, Error::UnsafeArtifactPath { ref destination, .. } if destination == "../../escaped"));

        let decl = JobDeclaration {
            artifact_rules: Some(vec!["out/*.txt => ./pkg/../dist/".to_string()]),
            ..JobDeclaration::new("Build")
        };
        let job = JobResolver::new(&registry)
            .resolve(&decl, &Parameters::new())
            .unwrap();
        assert_eq!(job.output_rules[0].target.as_deref(), Some("dist"));
    }
}
