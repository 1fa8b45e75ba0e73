//! Filesystem artifact store.
//!
//! Published files are copied to `<root>/<job id>/<path>`. Tar archives
//! (`.tar`, `.tar.gz`, `.tgz`) are published with the list of their file
//! entries so consumers can select single entries with `archive!pattern`.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use lattice_core::artifact::{
    ArtifactSource, PublishedArtifact, StagingPlan, join_path, normalize_destination,
};
use lattice_core::ids::JobId;
use lattice_core::ports::{ArtifactStore, JobContext};
use lattice_core::{Error, Result};
use lattice_scheduler::artifacts::{MATCH_OPTIONS, literal_prefix, relative_to};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Location of a published artifact on disk.
    pub fn artifact_path(&self, producer: &JobId, path: &str) -> PathBuf {
        self.root.join(producer.as_str()).join(path)
    }

    async fn clear(&self, job: &JobId) -> Result<()> {
        let job_root = self.root.join(job.as_str());
        if tokio::fs::try_exists(&job_root).await? {
            tokio::fs::remove_dir_all(&job_root).await?;
        }
        Ok(())
    }

    /// Copy `file` into the job's namespace as `name`, listing archive entries.
    async fn publish_file(&self, job: &JobId, file: &Path, name: &str) -> Result<PublishedArtifact> {
        let target = contained(&self.root.join(job.as_str()), name)
            .ok_or_else(|| Self::staging_error(job, escapes(name)))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(file, &target).await?;

        Ok(if is_tar(name) {
            PublishedArtifact::archive(name, list_entries(target).await?)
        } else {
            PublishedArtifact::file(name)
        })
    }

    fn staging_error(job: &JobId, reason: impl ToString) -> Error {
        Error::Staging {
            job: job.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn publish(&self, ctx: &JobContext) -> Result<Vec<PublishedArtifact>> {
        let job = ctx.job_id();
        self.clear(job).await?;

        let mut published: Vec<PublishedArtifact> = Vec::new();
        for rule in &ctx.job.output_rules {
            let pattern = ctx.workspace.join(&rule.pattern);
            let matches = glob::glob_with(&pattern.to_string_lossy(), MATCH_OPTIONS).map_err(|e| {
                Error::InvalidArtifactRule {
                    job: job.clone(),
                    rule: rule.pattern.clone(),
                    reason: e.to_string(),
                }
            })?;

            let prefix = literal_prefix(&rule.pattern);
            for entry in matches {
                let file = entry.map_err(|e| Error::Io(e.into_error()))?;
                if !file.is_file() {
                    continue;
                }
                let Ok(relative) = file.strip_prefix(&ctx.workspace) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                let name = join_path(
                    rule.target.as_deref().unwrap_or(""),
                    relative_to(&relative, prefix),
                );

                let artifact = self.publish_file(job, &file, &name).await?;
                published.retain(|a| a.path != artifact.path);
                published.push(artifact);
            }
        }

        debug!(job = %job, artifacts = published.len(), "Published artifacts");
        Ok(published)
    }

    async fn publish_staged(
        &self,
        ctx: &JobContext,
        plan: &StagingPlan,
    ) -> Result<Vec<PublishedArtifact>> {
        let job = ctx.job_id();
        self.clear(job).await?;

        let mut published = Vec::with_capacity(plan.operations.len());
        for op in &plan.operations {
            let staged = contained(&ctx.workspace, &op.destination)
                .ok_or_else(|| Self::staging_error(job, escapes(&op.destination)))?;
            published.push(self.publish_file(job, &staged, &op.destination).await?);
        }

        debug!(job = %job, artifacts = published.len(), "Republished staged artifacts");
        Ok(published)
    }

    async fn stage(&self, ctx: &JobContext, plan: &StagingPlan) -> Result<()> {
        let job = ctx.job_id();
        tokio::fs::create_dir_all(&ctx.workspace).await?;

        for root in &plan.clean {
            // The empty root is the whole input namespace.
            let dir = if root.is_empty() {
                ctx.workspace.clone()
            } else {
                contained(&ctx.workspace, root)
                    .ok_or_else(|| Self::staging_error(job, escapes(root)))?
            };
            if tokio::fs::try_exists(&dir).await? {
                tokio::fs::remove_dir_all(&dir).await?;
            }
            tokio::fs::create_dir_all(&dir).await?;
        }

        for op in &plan.operations {
            let target = contained(&ctx.workspace, &op.destination)
                .ok_or_else(|| Self::staging_error(job, escapes(&op.destination)))?;
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            match &op.source {
                ArtifactSource::File { producer, path } => {
                    tokio::fs::copy(self.artifact_path(producer, path), &target)
                        .await
                        .map_err(|e| Self::staging_error(job, format!("{}: {}", path, e)))?;
                }
                ArtifactSource::ArchiveEntry {
                    producer,
                    archive,
                    entry,
                } => {
                    let source = self.artifact_path(producer, archive);
                    let found = extract_entry(source, entry.clone(), target)
                        .await
                        .map_err(|e| Self::staging_error(job, format!("{}!{}: {}", archive, entry, e)))?;
                    if !found {
                        return Err(Self::staging_error(
                            job,
                            format!("{}!{}: entry not found", archive, entry),
                        ));
                    }
                }
            }
        }

        debug!(job = %job, operations = plan.operations.len(), "Staged artifacts");
        Ok(())
    }
}

/// `base/relative`, or `None` when `relative` is empty or leaves `base`.
fn contained(base: &Path, relative: &str) -> Option<PathBuf> {
    normalize_destination(relative)
        .filter(|path| !path.is_empty())
        .map(|path| base.join(path))
}

fn escapes(path: &str) -> String {
    format!("{}: path escapes its root", path)
}

fn is_tar(path: &str) -> bool {
    path.ends_with(".tar") || is_gzip(path)
}

fn is_gzip(path: &str) -> bool {
    path.ends_with(".tar.gz") || path.ends_with(".tgz")
}

fn open_archive(path: &Path) -> std::io::Result<tar::Archive<Box<dyn Read>>> {
    let file = std::fs::File::open(path)?;
    let reader: Box<dyn Read> = if is_gzip(&path.to_string_lossy()) {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

/// File entries of a tar archive, in archive order.
async fn list_entries(path: PathBuf) -> Result<Vec<String>> {
    tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
        let mut archive = open_archive(&path)?;
        let mut entries = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            if entry.header().entry_type().is_file() {
                entries.push(normalize_entry(&entry.path()?.to_string_lossy()));
            }
        }
        Ok(entries)
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))?
    .map_err(Error::Io)
}

/// Unpack one entry to `target`. Returns whether the entry was found.
async fn extract_entry(archive: PathBuf, wanted: String, target: PathBuf) -> Result<bool> {
    tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
        let mut archive = open_archive(&archive)?;
        for entry in archive.entries()? {
            let mut entry = entry?;
            if normalize_entry(&entry.path()?.to_string_lossy()) == wanted {
                entry.unpack(&target)?;
                return Ok(true);
            }
        }
        Ok(false)
    })
    .await
    .map_err(|e| Error::Internal(e.to_string()))?
    .map_err(Error::Io)
}

fn normalize_entry(path: &str) -> String {
    path.trim_start_matches("./").replace('\\', "/")
}
