#[cfg(test)]
mod tests {
    use crate::executor::ShellRunner;
    use crate::store::FsArtifactStore;
    use lattice_core::ids::JobId;
    use lattice_core::params::Parameters;
    use lattice_core::report::{JobState, RunStatus};
    use lattice_scheduler::{DeclarationLoader, Scheduler, SchedulerConfig, parse_declaration};
    use std::path::Path;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn scheduler(root: &Path, max_parallel: usize) -> Scheduler {
        Scheduler::new(
            Arc::new(ShellRunner::new("sh").quiet()),
            Arc::new(FsArtifactStore::new(root.join("artifacts"))),
            SchedulerConfig::new()
                .with_max_parallel(max_parallel)
                .with_workspace_root(root.join("work")),
        )
    }

    #[tokio::test]
    async fn test_independent_jobs_run_in_parallel() {
        // Both jobs take 2s; in parallel the run should take about 2s, not 4s.
        let yaml = r#"
id: Parallel
templates:
  - id: Sleep
    steps:
      - name: sleep
        script: sleep 2
jobs:
  - id: A
    template: Sleep
  - id: B
    template: Sleep
"#;
        let declaration = parse_declaration(yaml).unwrap();
        let graph = DeclarationLoader::new()
            .build_graph(&declaration, &Parameters::new())
            .unwrap();
        let root = tempfile::tempdir().unwrap();

        let start = std::time::Instant::now();
        let report = scheduler(root.path(), 2)
            .run(&graph, CancellationToken::new())
            .await
            .unwrap();
        let duration = start.elapsed();

        assert_eq!(report.status, RunStatus::Succeeded);
        println!("Duration: {:?}", duration);
        assert!(
            duration.as_secs_f64() < 3.5,
            "Run took too long: {:?}, expected parallel execution ~2s",
            duration
        );
    }

    #[tokio::test]
    async fn test_artifacts_flow_from_producer_to_consumer() {
        let yaml = r#"
id: Flow
params:
  version: "1.2.3"
jobs:
  - id: Build
    steps:
      - name: build
        script: mkdir -p dist && echo "app %version%" > dist/app.txt
    artifact_rules:
      - "dist/*.txt => packages"
  - id: Deploy
    steps:
      - name: deploy
        script: cat input/app.txt > deployed.txt
    dependencies:
      - producer: Build
        snapshot: {}
        artifacts:
          rules:
            - "packages/*.txt => input"
"#;
        let declaration = parse_declaration(yaml).unwrap();
        let graph = DeclarationLoader::new()
            .build_graph(&declaration, &Parameters::new())
            .unwrap();
        let root = tempfile::tempdir().unwrap();

        let report = scheduler(root.path(), 4)
            .run(&graph, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Succeeded);
        let build = report.job(&JobId::new("Build")).unwrap();
        assert_eq!(build.published.len(), 1);
        assert_eq!(build.published[0].path, "packages/app.txt");

        let deployed =
            std::fs::read_to_string(root.path().join("work/Deploy/deployed.txt")).unwrap();
        assert_eq!(deployed.trim(), "app 1.2.3");
    }

    #[tokio::test]
    async fn test_composites_forward_artifacts_to_each_other() {
        let yaml = r#"
id: Nested
jobs:
  - id: Build
    steps:
      - name: build
        script: mkdir -p dist && echo built > dist/a.txt
    artifact_rules:
      - "dist/*.txt"
  - id: Inner
    kind: composite
    dependencies:
      - producer: Build
        snapshot: {}
        artifacts:
          rules:
            - "*.txt=>x"
  - id: Outer
    kind: composite
    dependencies:
      - producer: Inner
        snapshot: {}
        artifacts:
          rules:
            - "x/*"
  - id: Check
    steps:
      - name: check
        script: cat in/a.txt > seen.txt
    dependencies:
      - producer: Outer
        snapshot: {}
        artifacts:
          rules:
            - "*.txt => in"
"#;
        let declaration = parse_declaration(yaml).unwrap();
        let graph = DeclarationLoader::new()
            .build_graph(&declaration, &Parameters::new())
            .unwrap();
        let root = tempfile::tempdir().unwrap();

        let report = scheduler(root.path(), 4)
            .run(&graph, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Succeeded);
        let outer = report.job(&JobId::new("Outer")).unwrap();
        assert_eq!(outer.published.len(), 1);
        assert_eq!(outer.published[0].path, "a.txt");
        assert!(root.path().join("artifacts/Inner/x/a.txt").exists());

        let seen = std::fs::read_to_string(root.path().join("work/Check/seen.txt")).unwrap();
        assert_eq!(seen.trim(), "built");
    }

    #[tokio::test]
    async fn test_failing_step_cancels_dependents() {
        let yaml = r#"
id: Failing
jobs:
  - id: Compile
    steps:
      - name: compile
        script: exit 1
  - id: Test
    steps:
      - name: test
        script: touch ran
    dependencies:
      - producer: Compile
        snapshot: {}
"#;
        let declaration = parse_declaration(yaml).unwrap();
        let graph = DeclarationLoader::new()
            .build_graph(&declaration, &Parameters::new())
            .unwrap();
        let root = tempfile::tempdir().unwrap();

        let report = scheduler(root.path(), 4)
            .run(&graph, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.job(&JobId::new("Compile")).unwrap().state, JobState::Failed);
        assert_eq!(report.job(&JobId::new("Test")).unwrap().state, JobState::Cancelled);
        assert!(!root.path().join("work/Test/ran").exists());
    }
}
