#[cfg(test)]
mod tests {
    use crate::agents::AgentProfile;
    use crate::dag::BuildGraph;
    use crate::loader::{DeclarationLoader, parse_declaration};
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use async_trait::async_trait;
    use lattice_core::artifact::{PublishedArtifact, StagingPlan};
    use lattice_core::ids::JobId;
    use lattice_core::params::Parameters;
    use lattice_core::ports::{ArtifactStore, JobContext, PayloadOutcome, PayloadRunner};
    use lattice_core::report::{JobState, RunReport, RunStatus};
    use lattice_core::{Error, Result};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Sleep(u64),
        /// Waits until the job's token fires.
        WaitForCancel,
        /// Never returns, whatever happens to the token.
        Hang,
        Panic,
    }

    #[derive(Default)]
    struct MockRunner {
        behaviors: HashMap<&'static str, Behavior>,
        events: Mutex<Vec<String>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl MockRunner {
        fn with(mut self, job: &'static str, behavior: Behavior) -> Self {
            self.behaviors.insert(job, behavior);
            self
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn started(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| e.strip_prefix("start ").map(str::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl PayloadRunner for MockRunner {
        async fn execute(&self, ctx: &JobContext, cancel: CancellationToken) -> Result<PayloadOutcome> {
            let job = ctx.job_id().as_str().to_string();
            self.events.lock().unwrap().push(format!("start {}", job));
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            let behavior = self
                .behaviors
                .get(job.as_str())
                .copied()
                .unwrap_or(Behavior::Succeed);
            let outcome = match behavior {
                Behavior::Succeed => PayloadOutcome::Succeeded,
                Behavior::Fail => PayloadOutcome::Failed("exit code 1".to_string()),
                Behavior::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    PayloadOutcome::Succeeded
                }
                Behavior::WaitForCancel => {
                    cancel.cancelled().await;
                    PayloadOutcome::Failed("cancelled".to_string())
                }
                Behavior::Hang => std::future::pending().await,
                Behavior::Panic => panic!("runner bug"),
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(format!("end {}", job));
            Ok(outcome)
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        outputs: HashMap<&'static str, Vec<PublishedArtifact>>,
        staged: Mutex<Vec<(String, StagingPlan)>>,
        /// Staging reason reported for every job, as a disk-backed store would.
        stage_error: Option<&'static str>,
    }

    impl MemoryStore {
        fn with(mut self, job: &'static str, paths: &[&str]) -> Self {
            self.outputs.insert(
                job,
                paths.iter().map(|p| PublishedArtifact::file(*p)).collect(),
            );
            self
        }

        fn staged_for(&self, job: &str) -> Vec<String> {
            self.staged
                .lock()
                .unwrap()
                .iter()
                .filter(|(j, _)| j == job)
                .flat_map(|(_, plan)| plan.operations.iter().map(|op| op.destination.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl ArtifactStore for MemoryStore {
        async fn publish(&self, ctx: &JobContext) -> Result<Vec<PublishedArtifact>> {
            Ok(self
                .outputs
                .get(ctx.job_id().as_str())
                .cloned()
                .unwrap_or_default())
        }

        async fn stage(&self, ctx: &JobContext, plan: &StagingPlan) -> Result<()> {
            if let Some(reason) = self.stage_error {
                return Err(Error::Staging {
                    job: ctx.job_id().clone(),
                    reason: reason.to_string(),
                });
            }
            self.staged
                .lock()
                .unwrap()
                .push((ctx.job_id().as_str().to_string(), plan.clone()));
            Ok(())
        }

        async fn publish_staged(
            &self,
            _ctx: &JobContext,
            plan: &StagingPlan,
        ) -> Result<Vec<PublishedArtifact>> {
            Ok(plan
                .operations
                .iter()
                .map(|op| PublishedArtifact::file(op.destination.clone()))
                .collect())
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn graph(yaml: &str) -> BuildGraph {
        let declaration = parse_declaration(yaml).unwrap();
        DeclarationLoader::new()
            .build_graph(&declaration, &Parameters::new())
            .unwrap()
    }

    async fn run_with(
        yaml: &str,
        runner: Arc<MockRunner>,
        store: Arc<MemoryStore>,
        config: SchedulerConfig,
    ) -> RunReport {
        init_tracing();
        let graph = graph(yaml);
        Scheduler::new(runner, store, config)
            .run(&graph, CancellationToken::new())
            .await
            .unwrap()
    }

    fn state(report: &RunReport, job: &str) -> JobState {
        report.job(&JobId::new(job)).unwrap().state
    }

    const CHAIN: &str = r#"
id: Chain
jobs:
  - id: Compile
  - id: Test
    dependencies:
      - producer: Compile
        snapshot: {}
  - id: Package
    dependencies:
      - producer: Test
        snapshot: {}
"#;

    #[tokio::test]
    async fn test_chain_runs_in_dependency_order() {
        let runner = Arc::new(MockRunner::default());
        let report = run_with(
            CHAIN,
            runner.clone(),
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new(),
        )
        .await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.count(JobState::Succeeded), 3);
        assert_eq!(
            runner.events(),
            vec![
                "start Compile",
                "end Compile",
                "start Test",
                "end Test",
                "start Package",
                "end Package",
            ]
        );
        let record = report.job(&JobId::new("Test")).unwrap();
        assert!(record.started_at.is_some());
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_fail_to_start_cancels_consumers_transitively() {
        let runner = Arc::new(MockRunner::default().with("Compile", Behavior::Fail));
        let report = run_with(
            CHAIN,
            runner.clone(),
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new(),
        )
        .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(state(&report, "Compile"), JobState::Failed);
        assert_eq!(state(&report, "Test"), JobState::Cancelled);
        assert_eq!(state(&report, "Package"), JobState::Cancelled);
        assert_eq!(runner.started(), vec!["Compile"]);

        let test = report.job(&JobId::new("Test")).unwrap();
        assert_eq!(test.failure.as_deref(), Some("dependency Compile failed"));
        assert!(test.started_at.is_none());
        assert!(report
            .job(&JobId::new("Compile"))
            .unwrap()
            .failure
            .as_deref()
            .unwrap()
            .contains("exit code 1"));
    }

    #[tokio::test]
    async fn test_add_problem_runs_consumer_and_records_problem() {
        let yaml = r#"
id: Problems
jobs:
  - id: Lint
  - id: Build
    dependencies:
      - producer: Lint
        snapshot:
          on_failure: add_problem_to_build
"#;
        let runner = Arc::new(MockRunner::default().with("Lint", Behavior::Fail));
        let report = run_with(
            yaml,
            runner.clone(),
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new(),
        )
        .await;

        assert_eq!(state(&report, "Build"), JobState::Succeeded);
        let build = report.job(&JobId::new("Build")).unwrap();
        assert_eq!(build.problems.len(), 1);
        assert_eq!(build.problems[0].producer, JobId::new("Lint"));
        assert_eq!(build.problems[0].producer_state, JobState::Failed);
        // The failure is tolerated by its only consumer.
        assert_eq!(report.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_ignore_runs_consumer_without_problem() {
        let yaml = r#"
id: Ignore
jobs:
  - id: Flaky
  - id: Build
    dependencies:
      - producer: Flaky
        snapshot:
          on_failure: ignore
"#;
        let runner = Arc::new(MockRunner::default().with("Flaky", Behavior::Fail));
        let report = run_with(
            yaml,
            runner.clone(),
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new(),
        )
        .await;

        assert_eq!(state(&report, "Build"), JobState::Succeeded);
        assert!(report.job(&JobId::new("Build")).unwrap().problems.is_empty());
        assert_eq!(report.status, RunStatus::Succeeded);
    }

    const MATRIX: &str = r#"
id: Matrix
templates:
  - id: Build
    artifact_rules:
      - "dist/*.tar.gz"
matrices:
  - id: Build
    template: Build
    axes:
      os: [linux, windows]
    composite:
      id: Build_All
      on_failure: fail_to_start
      artifact_rules:
        - "*.tar.gz=>packages"
"#;

    #[tokio::test]
    async fn test_composite_fails_when_a_leaf_fails() {
        let runner = Arc::new(MockRunner::default().with("Build_windows", Behavior::Fail));
        let store = Arc::new(MemoryStore::default().with("Build_linux", &["linux.tar.gz"]));
        let report = run_with(MATRIX, runner.clone(), store, SchedulerConfig::new()).await;

        assert_eq!(state(&report, "Build_linux"), JobState::Succeeded);
        assert_eq!(state(&report, "Build_windows"), JobState::Failed);
        // Composites fail rather than being cancelled, and never run a payload.
        assert_eq!(state(&report, "Build_All"), JobState::Failed);
        assert!(!runner.started().contains(&"Build_All".to_string()));
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_composite_collects_leaf_artifacts() {
        let runner = Arc::new(MockRunner::default());
        let store = Arc::new(
            MemoryStore::default()
                .with("Build_linux", &["linux.tar.gz"])
                .with("Build_windows", &["windows.tar.gz"]),
        );
        let report = run_with(MATRIX, runner, store.clone(), SchedulerConfig::new()).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(
            store.staged_for("Build_All"),
            vec!["packages/linux.tar.gz", "packages/windows.tar.gz"]
        );
        let composite = report.job(&JobId::new("Build_All")).unwrap();
        assert_eq!(
            composite.published,
            vec![
                PublishedArtifact::file("packages/linux.tar.gz"),
                PublishedArtifact::file("packages/windows.tar.gz"),
            ]
        );
    }

    #[tokio::test]
    async fn test_artifacts_are_staged_before_consumer_runs() {
        let yaml = r#"
id: Artifacts
jobs:
  - id: Build
  - id: Deploy
    dependencies:
      - producer: Build
        artifacts:
          rules:
            - "dist/*.whl=>wheels"
          clean_destination: true
"#;
        let store = Arc::new(
            MemoryStore::default().with("Build", &["dist/app-1.0.whl", "dist/readme.txt"]),
        );
        let report = run_with(
            yaml,
            Arc::new(MockRunner::default()),
            store.clone(),
            SchedulerConfig::new(),
        )
        .await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(store.staged_for("Deploy"), vec!["wheels/app-1.0.whl"]);
        let staged = store.staged.lock().unwrap();
        assert_eq!(staged[0].1.clean, vec!["wheels".to_string()]);
    }

    #[tokio::test]
    async fn test_store_staging_errors_are_reported_once() {
        let yaml = r#"
id: Artifacts
jobs:
  - id: Build
  - id: Deploy
    dependencies:
      - producer: Build
        artifacts:
          rules:
            - "*.whl=>wheels"
  - id: Bundle
    kind: composite
    dependencies:
      - producer: Build
        artifacts:
          rules:
            - "*.whl"
"#;
        let store = MemoryStore {
            stage_error: Some("disk full"),
            ..MemoryStore::default().with("Build", &["app.whl"])
        };
        let runner = Arc::new(MockRunner::default());
        let report = run_with(yaml, runner.clone(), Arc::new(store), SchedulerConfig::new()).await;

        for job in ["Deploy", "Bundle"] {
            assert_eq!(state(&report, job), JobState::Failed);
            assert_eq!(
                report.job(&JobId::new(job)).unwrap().failure.as_deref(),
                Some(format!("Artifact staging failed for {}: disk full", job).as_str())
            );
        }
        assert_eq!(runner.started(), vec!["Build"]);
    }

    #[tokio::test]
    async fn test_unmatched_artifact_rule_fails_consumer() {
        let yaml = r#"
id: Artifacts
jobs:
  - id: Build
  - id: Deploy
    dependencies:
      - producer: Build
        artifacts:
          rules:
            - "*.deb=>debs"
"#;
        let runner = Arc::new(MockRunner::default());
        let report = run_with(
            yaml,
            runner.clone(),
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new(),
        )
        .await;

        assert_eq!(state(&report, "Build"), JobState::Succeeded);
        assert_eq!(state(&report, "Deploy"), JobState::Failed);
        assert!(report
            .job(&JobId::new("Deploy"))
            .unwrap()
            .failure
            .as_deref()
            .unwrap()
            .contains("matched nothing"));
        assert_eq!(runner.started(), vec!["Build"]);
    }

    #[tokio::test]
    async fn test_timeout_fails_job_and_signals_payload() {
        let yaml = r#"
id: Timeout
jobs:
  - id: Slow
  - id: After
    dependencies:
      - producer: Slow
        snapshot: {}
"#;
        let runner = Arc::new(MockRunner::default().with("Slow", Behavior::Hang));
        let report = run_with(
            yaml,
            runner,
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new().with_default_timeout(Duration::from_millis(50)),
        )
        .await;

        assert_eq!(state(&report, "Slow"), JobState::Failed);
        assert!(report
            .job(&JobId::new("Slow"))
            .unwrap()
            .failure
            .as_deref()
            .unwrap()
            .contains("timed out"));
        assert_eq!(state(&report, "After"), JobState::Cancelled);
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_run() {
        let runner = Arc::new(MockRunner::default().with("Compile", Behavior::WaitForCancel));
        init_tracing();
        let graph = graph(CHAIN);
        let scheduler = Scheduler::new(
            runner.clone(),
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = scheduler.run(&graph, cancel).await.unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.count(JobState::Cancelled), 3);
        assert_eq!(runner.started(), vec!["Compile"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let runner = Arc::new(MockRunner::default());
        let graph = graph(CHAIN);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = Scheduler::new(
            runner.clone(),
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new(),
        )
        .run(&graph, cancel)
        .await
        .unwrap();

        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(runner.events().is_empty());
        assert!(report.jobs.values().all(|r| r.state == JobState::Cancelled));
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let yaml = r#"
id: Wide
jobs:
  - id: A
  - id: B
  - id: C
  - id: D
  - id: E
  - id: F
"#;
        let mut runner = MockRunner::default();
        for job in ["A", "B", "C", "D", "E", "F"] {
            runner = runner.with(job, Behavior::Sleep(30));
        }
        let runner = Arc::new(runner);
        let report = run_with(
            yaml,
            runner.clone(),
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new().with_max_parallel(2),
        )
        .await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(runner.max_running.load(Ordering::SeqCst) <= 2);
        // Ties start in declaration order.
        assert_eq!(runner.started(), vec!["A", "B", "C", "D", "E", "F"]);
    }

    #[tokio::test]
    async fn test_no_compatible_agent_fails_job() {
        let yaml = r#"
id: Agents
jobs:
  - id: Linux
    requirements:
      - kind: equals
        name: os
        value: Linux
  - id: Cuda
    requirements:
      - kind: exists
        name: system.cuda
"#;
        let agents = vec![AgentProfile::new(
            "linux-1",
            [("os".to_string(), "Linux".to_string())].into_iter().collect(),
        )];
        let runner = Arc::new(MockRunner::default());
        let report = run_with(
            yaml,
            runner.clone(),
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new().with_agents(agents),
        )
        .await;

        assert_eq!(state(&report, "Linux"), JobState::Succeeded);
        assert_eq!(
            report.job(&JobId::new("Linux")).unwrap().agent.as_deref(),
            Some("linux-1")
        );
        assert_eq!(state(&report, "Cuda"), JobState::Failed);
        assert_eq!(runner.started(), vec!["Linux"]);
    }

    #[tokio::test]
    async fn test_panicking_payload_fails_job() {
        let yaml = r#"
id: Panic
jobs:
  - id: Broken
  - id: Fine
"#;
        let runner = Arc::new(MockRunner::default().with("Broken", Behavior::Panic));
        let report = run_with(
            yaml,
            runner,
            Arc::new(MemoryStore::default()),
            SchedulerConfig::new(),
        )
        .await;

        assert_eq!(state(&report, "Broken"), JobState::Failed);
        assert_eq!(state(&report, "Fine"), JobState::Succeeded);
        assert!(report
            .job(&JobId::new("Broken"))
            .unwrap()
            .failure
            .as_deref()
            .unwrap()
            .contains("panicked"));
    }
}
