//! Loading declaration files and resolving them into jobs.

use crate::dag::{BuildGraph, GraphBuilder};
use crate::matrix::MatrixExpander;
use lattice_core::declaration::{BuildDeclaration, ProjectDeclaration};
use lattice_core::job::{JobDeclaration, JobResolver, ResolvedJob};
use lattice_core::params::{ParameterResolver, Parameters};
use lattice_core::template::TemplateRegistry;
use lattice_core::{Error, Result};
use std::path::Path;
use tracing::{debug, info};

/// Parse a YAML declaration.
pub fn parse_declaration(content: &str) -> Result<BuildDeclaration> {
    serde_yaml::from_str(content).map_err(|e| Error::Serialization(e.to_string()))
}

/// Read and parse a YAML declaration file.
pub async fn load_declaration(path: impl AsRef<Path>) -> Result<BuildDeclaration> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await?;
    let declaration: BuildDeclaration = serde_yaml::from_str(&content)
        .map_err(|e| Error::Serialization(format!("{}: {}", path.display(), e)))?;
    debug!(path = %path.display(), "Loaded declaration");
    Ok(declaration)
}

/// Everything resolved from one declaration.
#[derive(Debug)]
pub struct LoadedBuild {
    pub registry: TemplateRegistry,
    pub jobs: Vec<ResolvedJob>,
}

impl LoadedBuild {
    pub fn into_graph(self) -> Result<BuildGraph> {
        GraphBuilder::new().build(self.jobs)
    }
}

/// A job declaration with the inherited project parameters of its owner.
struct PendingJob {
    declaration: JobDeclaration,
    global: Parameters,
}

/// Turns a project tree into resolved jobs.
pub struct DeclarationLoader {
    expander: MatrixExpander,
    params: ParameterResolver,
}

impl DeclarationLoader {
    pub fn new() -> Self {
        Self {
            expander: MatrixExpander::new(),
            params: ParameterResolver::new(),
        }
    }

    /// Resolve every job of the tree, in declaration order: a project's jobs,
    /// then its matrices, then its sub-projects.
    ///
    /// `extra` is merged over the root project's parameters.
    pub fn resolve(&self, declaration: &BuildDeclaration, extra: &Parameters) -> Result<LoadedBuild> {
        let mut registry = TemplateRegistry::new();
        register_templates(&declaration.project, &mut registry)?;

        let mut pending = Vec::new();
        let root_layer = self
            .params
            .merge([&declaration.project.params, extra]);
        self.collect_jobs(&declaration.project, root_layer, &mut pending)?;

        let resolver = JobResolver::new(&registry);
        let jobs = pending
            .iter()
            .map(|job| resolver.resolve(&job.declaration, &job.global))
            .collect::<Result<Vec<_>>>()?;

        info!(
            templates = registry.len(),
            jobs = jobs.len(),
            "Resolved declaration"
        );
        Ok(LoadedBuild { registry, jobs })
    }

    /// Resolve and build the validated graph in one step.
    pub fn build_graph(&self, declaration: &BuildDeclaration, extra: &Parameters) -> Result<BuildGraph> {
        self.resolve(declaration, extra)?.into_graph()
    }

    fn collect_jobs(
        &self,
        project: &ProjectDeclaration,
        global: Parameters,
        pending: &mut Vec<PendingJob>,
    ) -> Result<()> {
        for job in &project.jobs {
            pending.push(PendingJob {
                declaration: job.clone(),
                global: global.clone(),
            });
        }

        for matrix in &project.matrices {
            let expansion = self.expander.expand(matrix)?;
            debug!(
                project = %project.id,
                matrix = %expansion.matrix,
                jobs = expansion.jobs.len(),
                "Expanded matrix"
            );
            for declaration in expansion.into_declarations() {
                pending.push(PendingJob {
                    declaration,
                    global: global.clone(),
                });
            }
        }

        for child in &project.projects {
            let layer = self.params.merge([&global, &child.params]);
            self.collect_jobs(child, layer, pending)?;
        }
        Ok(())
    }
}

impl Default for DeclarationLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Templates are visible to the whole tree, whichever project declares them.
fn register_templates(project: &ProjectDeclaration, registry: &mut TemplateRegistry) -> Result<()> {
    for template in &project.templates {
        registry.register(template.clone())?;
    }
    for child in &project.projects {
        register_templates(child, registry)?;
    }
    Ok(())
}
