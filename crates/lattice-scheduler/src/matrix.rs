//! Matrix expansion: one job declaration per combination of axis values.

use lattice_core::declaration::MatrixDeclaration;
use lattice_core::dependency::{ArtifactDependency, DependencyDeclaration, SnapshotDependency};
use lattice_core::ids::JobId;
use lattice_core::job::JobDeclaration;
use lattice_core::params::{ParameterResolver, Parameters};
use lattice_core::{Error, Result};
use std::collections::BTreeMap;

type Combination = BTreeMap<String, String>;

/// Result of matrix expansion.
#[derive(Debug, Clone)]
pub struct MatrixExpansion {
    pub matrix: String,
    pub jobs: Vec<JobDeclaration>,
    /// Aggregator depending on every generated job.
    pub composite: Option<JobDeclaration>,
}

impl MatrixExpansion {
    /// Generated jobs followed by the composite, if any.
    pub fn into_declarations(self) -> Vec<JobDeclaration> {
        let mut jobs = self.jobs;
        jobs.extend(self.composite);
        jobs
    }
}

/// Expander for matrix declarations.
pub struct MatrixExpander {
    params: ParameterResolver,
}

impl MatrixExpander {
    pub fn new() -> Self {
        Self {
            params: ParameterResolver::new(),
        }
    }

    /// Expand a matrix into job declarations. Axis values become job-local
    /// parameters overriding the matrix's shared parameters.
    pub fn expand(&self, matrix: &MatrixDeclaration) -> Result<MatrixExpansion> {
        let mut combinations = self.generate_combinations(&matrix.axes);

        // Apply excludes
        combinations.retain(|combo| {
            !matrix
                .exclude
                .iter()
                .any(|exclude| self.matches_exclude(combo, exclude))
        });

        // Apply includes
        for include in &matrix.include {
            if !combinations.contains(include) {
                combinations.push(include.clone());
            }
        }

        if combinations.is_empty() {
            return Err(Error::InvalidDeclaration {
                job: JobId::new(matrix.id.as_str()),
                reason: "matrix expands to no jobs".to_string(),
            });
        }

        let mut jobs = Vec::with_capacity(combinations.len());
        for combo in combinations {
            let mut params = matrix.params.clone();
            params.extend(combo.iter().map(|(k, v)| (k.clone(), v.clone())));

            let id = self.format_id(matrix, &combo, &params)?;
            let name = self.format_display_name(matrix, &combo, &params, &id)?;
            jobs.push(JobDeclaration {
                name: Some(name),
                template: Some(matrix.template.clone()),
                params,
                dependencies: matrix.dependencies.clone(),
                ..JobDeclaration::new(id)
            });
        }

        let composite = matrix.composite.as_ref().map(|decl| {
            let artifacts = (!decl.artifact_rules.is_empty()).then(|| ArtifactDependency {
                rules: decl.artifact_rules.clone(),
                clean_destination: false,
            });
            JobDeclaration {
                name: decl.name.clone(),
                dependencies: jobs
                    .iter()
                    .map(|job| DependencyDeclaration {
                        producer: job.id.clone(),
                        snapshot: Some(SnapshotDependency::on_failure(decl.on_failure)),
                        artifacts: artifacts.clone(),
                    })
                    .collect(),
                ..JobDeclaration::composite(decl.id.clone())
            }
        });

        Ok(MatrixExpansion {
            matrix: matrix.id.clone(),
            jobs,
            composite,
        })
    }

    fn generate_combinations(&self, axes: &BTreeMap<String, Vec<String>>) -> Vec<Combination> {
        if axes.is_empty() {
            return vec![Combination::new()];
        }

        let mut result = vec![Combination::new()];

        for (key, values) in axes {
            let mut new_result = Vec::with_capacity(result.len() * values.len());

            for combo in result {
                for value in values {
                    let mut new_combo = combo.clone();
                    new_combo.insert(key.clone(), value.clone());
                    new_result.push(new_combo);
                }
            }

            result = new_result;
        }

        result
    }

    fn matches_exclude(&self, combo: &Combination, exclude: &Combination) -> bool {
        exclude
            .iter()
            .all(|(key, value)| combo.get(key) == Some(value))
    }

    fn format_id(
        &self,
        matrix: &MatrixDeclaration,
        combo: &Combination,
        params: &Parameters,
    ) -> Result<JobId> {
        let owner = JobId::new(matrix.id.as_str());
        match &matrix.id_pattern {
            Some(pattern) => self
                .params
                .substitute(&owner, "id pattern", pattern, params)
                .map(JobId::new),
            None => {
                let mut parts = vec![matrix.id.clone()];
                parts.extend(combo.values().cloned());
                Ok(JobId::new(parts.join("_")))
            }
        }
    }

    fn format_display_name(
        &self,
        matrix: &MatrixDeclaration,
        combo: &Combination,
        params: &Parameters,
        id: &JobId,
    ) -> Result<String> {
        if let Some(pattern) = &matrix.name_pattern {
            return self.params.substitute(id, "name pattern", pattern, params);
        }
        if combo.is_empty() {
            return Ok(matrix.id.clone());
        }

        let parts: Vec<String> = combo
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        Ok(format!("{} ({})", matrix.id, parts.join(", ")))
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}
