//! Main scheduler orchestration.
//!
//! The scheduler walks a [`BuildGraph`] in topological order. Each job moves
//! `Pending -> Ready -> Running -> {Succeeded, Failed, Cancelled}`; leaf
//! payloads run as tokio tasks and the scheduler is the only reader of their
//! completions.

use crate::agents::{AgentMatcher, AgentProfile};
use crate::artifacts::ArtifactResolver;
use crate::dag::BuildGraph;
use crate::queue::{ReadyJob, ReadyQueue};
use chrono::Utc;
use futures::FutureExt;
use lattice_core::artifact::{PublishedArtifact, StagingPlan};
use lattice_core::dependency::FailureAction;
use lattice_core::ids::{JobId, RunId};
use lattice_core::job::ResolvedJob;
use lattice_core::ports::{ArtifactStore, JobContext, PayloadOutcome, PayloadRunner};
use lattice_core::report::{JobRecord, JobState, Problem, RunReport, RunStatus};
use lattice_core::{Error, Result};
use petgraph::graph::NodeIndex;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of payloads running at once.
    pub max_parallel: usize,
    /// Applied to jobs that declare no timeout of their own.
    pub default_timeout: Option<Duration>,
    /// Each job works in `<workspace_root>/<job id>`.
    pub workspace_root: PathBuf,
    /// When non-empty, every leaf job must match one of these agents.
    pub agents: Vec<AgentProfile>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            default_timeout: None,
            workspace_root: PathBuf::from(".lattice/work"),
            agents: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_agents(mut self, agents: Vec<AgentProfile>) -> Self {
        self.agents = agents;
        self
    }
}

/// Result of one leaf task.
enum TaskOutcome {
    Succeeded(Vec<PublishedArtifact>),
    Failed(Error),
}

/// What the dependencies of a ready job allow.
enum Admission {
    Run { problems: Vec<Problem> },
    Cancel(String),
    Fail(String),
}

/// The main scheduler service.
pub struct Scheduler {
    runner: Arc<dyn PayloadRunner>,
    store: Arc<dyn ArtifactStore>,
    config: SchedulerConfig,
    resolver: ArtifactResolver,
    agent_matcher: AgentMatcher,
}

/// Mutable state of one run.
struct RunState<'g> {
    run_id: RunId,
    graph: &'g BuildGraph,
    records: Vec<JobRecord>,
    published: Vec<Vec<PublishedArtifact>>,
    /// Producers of each job that are not yet terminal.
    waiting: Vec<usize>,
    queue: ReadyQueue,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn PayloadRunner>,
        store: Arc<dyn ArtifactStore>,
        config: SchedulerConfig,
    ) -> Self {
        let agent_matcher = AgentMatcher::new(config.agents.clone());
        Self {
            runner,
            store,
            config,
            resolver: ArtifactResolver::new(),
            agent_matcher,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Execute every job of the graph. Cancelling `cancel` stops the run:
    /// waiting jobs become Cancelled and running payloads are signalled.
    pub async fn run(&self, graph: &BuildGraph, cancel: CancellationToken) -> Result<RunReport> {
        let started_at = Utc::now();
        let mut state = RunState::new(graph, self.config.max_parallel);
        info!(
            run_id = %state.run_id,
            jobs = graph.len(),
            max_parallel = state.queue.max_parallel(),
            "Starting run"
        );

        for &node in graph.order() {
            if state.waiting[node.index()] == 0 {
                state.mark_ready(node);
            }
        }

        let mut tasks: JoinSet<(NodeIndex, TaskOutcome)> = JoinSet::new();
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                if !cancelled {
                    cancelled = true;
                    warn!(run_id = %state.run_id, running = tasks.len(), "Run cancelled");
                }
                // Completions may have released consumers since the last pass.
                state.cancel_waiting("run cancelled");
            } else {
                while let Some(ready) = state.queue.dequeue() {
                    self.start(ready, &mut state, &mut tasks, &cancel).await;
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {}
                joined = tasks.join_next() => match joined {
                    Some(Ok((node, outcome))) => {
                        state.queue.complete();
                        self.complete(node, outcome, &mut state, cancel.is_cancelled());
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "Job task aborted");
                        return Err(Error::Internal(format!("job task aborted: {}", err)));
                    }
                    None => {}
                },
            }
        }

        // Every job ends terminal, even one whose producers never finished.
        state.cancel_waiting("never became ready");

        let status = state.status(cancelled);
        let report = state.into_report(status, started_at);
        info!(
            run_id = %report.run_id,
            status = ?report.status,
            succeeded = report.count(JobState::Succeeded),
            failed = report.count(JobState::Failed),
            cancelled = report.count(JobState::Cancelled),
            duration_ms = report.duration_ms(),
            "Run finished"
        );
        Ok(report)
    }

    /// Take a dequeued job from Ready to Running, or settle it right away when
    /// it has no payload to run.
    async fn start(
        &self,
        ready: ReadyJob,
        state: &mut RunState<'_>,
        tasks: &mut JoinSet<(NodeIndex, TaskOutcome)>,
        cancel: &CancellationToken,
    ) {
        let node = ready.node;
        let job = Arc::clone(state.graph.job_at(node));

        let problems = match self.admit(node, &job, state) {
            Admission::Run { problems } => problems,
            Admission::Cancel(reason) => {
                info!(job = %job.id, reason = %reason, "Job cancelled");
                state.settle(node, JobState::Cancelled, Some(reason));
                return;
            }
            Admission::Fail(reason) => {
                info!(job = %job.id, reason = %reason, "Composite job failed");
                state.settle(node, JobState::Failed, Some(reason));
                return;
            }
        };
        for problem in &problems {
            warn!(job = %job.id, producer = %problem.producer, "{}", problem.description);
        }
        state.records[node.index()].problems = problems;

        let staging = match self.plan_staging(node, &job, state) {
            Ok(plan) => plan,
            Err(err) => {
                info!(job = %job.id, error = %err, "Artifact resolution failed");
                state.settle(node, JobState::Failed, Some(err.to_string()));
                return;
            }
        };

        let agent = if job.is_composite() {
            None
        } else {
            match self.agent_matcher.find(&job) {
                Ok(agent) => agent.map(|a| a.name.clone()),
                Err(err) => {
                    info!(job = %job.id, error = %err, "No compatible agent");
                    state.settle(node, JobState::Failed, Some(err.to_string()));
                    return;
                }
            }
        };

        let ctx = JobContext {
            run_id: state.run_id,
            job: Arc::clone(&job),
            staging,
            workspace: self.config.workspace_root.join(job.id.as_str()),
            revision_group: state.graph.revision_group_at(node),
            agent,
        };
        state.records[node.index()].agent = ctx.agent.clone();
        state.records[node.index()].mark_started(Utc::now());

        if job.is_composite() {
            self.finish_composite(node, ctx, state).await;
            return;
        }

        info!(
            job = %job.id,
            agent = ?ctx.agent,
            staged = ctx.staging.operations.len(),
            "Job started"
        );
        let timeout = job.timeout().or(self.config.default_timeout);
        let runner = Arc::clone(&self.runner);
        let store = Arc::clone(&self.store);
        let token = cancel.child_token();
        let job_id = job.id.clone();

        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(execute_job(runner, store, ctx, timeout, token))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    TaskOutcome::Failed(Error::PayloadFailed {
                        job: job_id,
                        reason: "payload panicked".to_string(),
                    })
                });
            (node, outcome)
        });
    }

    /// Apply failure actions of every dependency to a ready job.
    fn admit(&self, node: NodeIndex, job: &ResolvedJob, state: &RunState<'_>) -> Admission {
        let mut problems = Vec::new();

        for (producer, dep) in state.graph.dependencies_of(node) {
            let producer_state = state.records[producer.index()].state;
            if producer_state.is_success() {
                continue;
            }
            let producer_id = &state.graph.job_at(producer).id;
            let description = format!("dependency {} {}", producer_id, describe(producer_state));

            if job.is_composite() {
                match dep.failure_action() {
                    Some(FailureAction::Ignore) => {}
                    Some(FailureAction::AddProblemToBuild) if producer_state == JobState::Failed => {
                        problems.push(problem(producer_id, producer_state, description));
                    }
                    _ => return Admission::Fail(description),
                }
                continue;
            }

            match dep.failure_action() {
                Some(FailureAction::FailToStart) => return Admission::Cancel(description),
                Some(FailureAction::AddProblemToBuild) => {
                    problems.push(problem(producer_id, producer_state, description));
                }
                // Artifact-only dependencies fail later, at resolution.
                Some(FailureAction::Ignore) | None => {}
            }
        }

        Admission::Run { problems }
    }

    fn plan_staging(
        &self,
        node: NodeIndex,
        job: &ResolvedJob,
        state: &RunState<'_>,
    ) -> Result<StagingPlan> {
        let mut plans = Vec::new();
        for (producer, dep) in state.graph.dependencies_of(node) {
            let Some(rules) = &dep.artifacts else {
                continue;
            };
            plans.push(self.resolver.plan(
                &job.id,
                &dep.producer,
                rules,
                &state.published[producer.index()],
            )?);
        }
        Ok(self.resolver.merge(plans))
    }

    /// Composite jobs stage their collected artifacts and republish them.
    async fn finish_composite(&self, node: NodeIndex, ctx: JobContext, state: &mut RunState<'_>) {
        let job_id = ctx.job_id().clone();
        let published = match self.collect_composite(&ctx).await {
            Ok(published) => published,
            Err(err) => {
                let err = staging_failure(&job_id, err);
                info!(job = %job_id, error = %err, "Composite job failed");
                state.settle(node, JobState::Failed, Some(err.to_string()));
                return;
            }
        };

        state.records[node.index()].published = published.clone();
        state.published[node.index()] = published;
        info!(job = %job_id, "Composite job succeeded");
        state.settle(node, JobState::Succeeded, None);
    }

    async fn collect_composite(&self, ctx: &JobContext) -> Result<Vec<PublishedArtifact>> {
        if ctx.staging.operations.is_empty() && ctx.staging.clean.is_empty() {
            return Ok(Vec::new());
        }
        self.store.stage(ctx, &ctx.staging).await?;
        self.store.publish_staged(ctx, &ctx.staging).await
    }

    fn complete(
        &self,
        node: NodeIndex,
        outcome: TaskOutcome,
        state: &mut RunState<'_>,
        run_cancelled: bool,
    ) {
        let job_id = state.graph.job_at(node).id.clone();
        match outcome {
            TaskOutcome::Succeeded(published) => {
                info!(job = %job_id, artifacts = published.len(), "Job succeeded");
                state.records[node.index()].published = published.clone();
                state.published[node.index()] = published;
                state.finish(node, JobState::Succeeded, None);
            }
            TaskOutcome::Failed(err) if run_cancelled => {
                info!(job = %job_id, error = %err, "Job cancelled");
                state.finish(node, JobState::Cancelled, Some("run cancelled".to_string()));
            }
            TaskOutcome::Failed(err) => {
                info!(job = %job_id, error = %err, "Job failed");
                state.finish(node, JobState::Failed, Some(err.to_string()));
            }
        }
    }
}

/// Store errors that already name the staging failure pass through unchanged.
fn staging_failure(job: &JobId, err: Error) -> Error {
    match err {
        Error::Staging { .. } => err,
        other => Error::Staging {
            job: job.clone(),
            reason: other.to_string(),
        },
    }
}

/// Stage inputs, run the payload under its timeout, then publish outputs.
async fn execute_job(
    runner: Arc<dyn PayloadRunner>,
    store: Arc<dyn ArtifactStore>,
    ctx: JobContext,
    timeout: Option<Duration>,
    token: CancellationToken,
) -> TaskOutcome {
    let job = ctx.job_id().clone();

    if !ctx.staging.operations.is_empty() || !ctx.staging.clean.is_empty() {
        if let Err(err) = store.stage(&ctx, &ctx.staging).await {
            return TaskOutcome::Failed(staging_failure(&job, err));
        }
    }

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        outcome = runner.execute(&ctx, token.clone()) => outcome,
        _ = deadline => {
            token.cancel();
            Ok(PayloadOutcome::TimedOut)
        }
        _ = token.cancelled() => Ok(PayloadOutcome::Failed("cancelled".to_string())),
    };

    match outcome {
        Ok(PayloadOutcome::Succeeded) => match store.publish(&ctx).await {
            Ok(published) => TaskOutcome::Succeeded(published),
            Err(err) => TaskOutcome::Failed(err),
        },
        Ok(PayloadOutcome::Failed(reason)) => {
            TaskOutcome::Failed(Error::PayloadFailed { job, reason })
        }
        Ok(PayloadOutcome::TimedOut) => TaskOutcome::Failed(Error::Timeout {
            job,
            timeout: timeout.unwrap_or_default(),
        }),
        Err(err) => TaskOutcome::Failed(err),
    }
}

fn describe(state: JobState) -> &'static str {
    match state {
        JobState::Failed => "failed",
        JobState::Cancelled => "was cancelled",
        _ => "did not succeed",
    }
}

fn problem(producer: &JobId, producer_state: JobState, description: String) -> Problem {
    Problem {
        producer: producer.clone(),
        producer_state,
        description,
    }
}

impl<'g> RunState<'g> {
    fn new(graph: &'g BuildGraph, max_parallel: usize) -> Self {
        let waiting = (0..graph.len())
            .map(|i| graph.dependencies_of(NodeIndex::new(i)).len())
            .collect();

        Self {
            run_id: RunId::new(),
            graph,
            records: vec![JobRecord::default(); graph.len()],
            published: vec![Vec::new(); graph.len()],
            waiting,
            queue: ReadyQueue::new(max_parallel),
        }
    }

    fn mark_ready(&mut self, node: NodeIndex) {
        debug!(job = %self.graph.job_at(node).id, "Job ready");
        self.records[node.index()].state = JobState::Ready;
        self.queue.enqueue(ReadyJob {
            node,
            position: self.graph.position(node),
        });
    }

    /// Settle a dequeued job without running a payload, freeing its slot.
    fn settle(&mut self, node: NodeIndex, state: JobState, failure: Option<String>) {
        self.queue.complete();
        self.finish(node, state, failure);
    }

    /// Record a terminal state and release consumers whose producers are done.
    fn finish(&mut self, node: NodeIndex, state: JobState, failure: Option<String>) {
        self.records[node.index()].mark_finished(state, Utc::now(), failure);

        for consumer in self.graph.successor_nodes(node) {
            let waiting = &mut self.waiting[consumer.index()];
            *waiting = waiting.saturating_sub(1);
            if *waiting == 0 && self.records[consumer.index()].state == JobState::Pending {
                self.mark_ready(consumer);
            }
        }
    }

    /// Cancel every job that has not started; terminal jobs are untouched.
    fn cancel_waiting(&mut self, reason: &str) {
        self.queue.drain();
        let now = Utc::now();
        for record in &mut self.records {
            if matches!(record.state, JobState::Pending | JobState::Ready) {
                record.mark_finished(JobState::Cancelled, now, Some(reason.to_string()));
            }
        }
    }

    /// Failed when a job was cancelled by propagation, or failed with no
    /// consumer tolerating it.
    fn status(&self, cancelled: bool) -> RunStatus {
        if cancelled {
            return RunStatus::Cancelled;
        }
        for &node in self.graph.order() {
            match self.records[node.index()].state {
                JobState::Cancelled => return RunStatus::Failed,
                JobState::Failed => {
                    let tolerated = self
                        .graph
                        .dependents_of(node)
                        .iter()
                        .any(|(_, dep)| dep.tolerates_failure());
                    if !tolerated {
                        return RunStatus::Failed;
                    }
                }
                _ => {}
            }
        }
        RunStatus::Succeeded
    }

    fn into_report(self, status: RunStatus, started_at: chrono::DateTime<Utc>) -> RunReport {
        let graph = self.graph;
        let jobs = graph
            .jobs()
            .into_iter()
            .zip(self.records)
            .map(|(job, record)| (job.id.clone(), record))
            .collect();

        RunReport {
            run_id: self.run_id,
            status,
            started_at,
            completed_at: Utc::now(),
            jobs,
        }
    }
}
