//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and the
//! adapters that actually run payloads and move files.

use crate::artifact::{PublishedArtifact, StagingPlan};
use crate::ids::{JobId, RunId};
use crate::job::ResolvedJob;
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a payload runner needs to execute one job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: RunId,
    pub job: Arc<ResolvedJob>,
    /// Copy operations applied before the payload started.
    pub staging: StagingPlan,
    pub workspace: PathBuf,
    /// Jobs sharing this id must build from the same source revision.
    pub revision_group: usize,
    /// Name of the matched agent profile, when an agent pool is configured.
    pub agent: Option<String>,
}

impl JobContext {
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

/// Runs the external work of a leaf job.
#[async_trait]
pub trait PayloadRunner: Send + Sync {
    /// Execute the job's steps. Implementations should return promptly once
    /// `cancel` fires.
    async fn execute(&self, ctx: &JobContext, cancel: CancellationToken) -> Result<PayloadOutcome>;
}

/// Stores the files jobs publish and stages them for consumers.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Record which files the job's output rules matched after it succeeded.
    async fn publish(&self, ctx: &JobContext) -> Result<Vec<PublishedArtifact>>;

    /// Materialize a staging plan in the job's input namespace.
    async fn stage(&self, ctx: &JobContext, plan: &StagingPlan) -> Result<()>;

    /// Publish the files a composite job staged under the composite's own id,
    /// so its consumers can select them like any other producer's outputs.
    async fn publish_staged(
        &self,
        ctx: &JobContext,
        plan: &StagingPlan,
    ) -> Result<Vec<PublishedArtifact>>;
}
