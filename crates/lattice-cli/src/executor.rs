//! Local payload runner: executes job steps as shell commands.
//!
//! Parameters named `env.X` are exported to each step as the environment
//! variable `X`. Every step also sees `LATTICE_JOB_ID`, `LATTICE_RUN_ID` and
//! `LATTICE_REVISION_GROUP`.

use async_trait::async_trait;
use console::style;
use lattice_core::job::{ExecutionMode, Step};
use lattice_core::ports::{JobContext, PayloadOutcome, PayloadRunner};
use lattice_core::Result;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const ENV_PREFIX: &str = "env.";

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Succeeded,
    Failed { exit_code: i32 },
    Cancelled,
}

/// Runs each step with `<shell> -c <script>` in the job's workspace.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    /// Echo step output to stdout.
    verbose: bool,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            verbose: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.verbose = false;
        self
    }

    async fn run_step(
        &self,
        ctx: &JobContext,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<StepResult> {
        let work_dir = step
            .working_dir
            .as_ref()
            .map(|dir| ctx.workspace.join(dir))
            .unwrap_or_else(|| ctx.workspace.clone());
        tokio::fs::create_dir_all(&work_dir).await?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&step.script);
        cmd.current_dir(&work_dir);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        for (key, value) in &ctx.job.params {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                cmd.env(name, value);
            }
        }
        cmd.env("LATTICE_JOB_ID", ctx.job_id().as_str());
        cmd.env("LATTICE_RUN_ID", ctx.run_id.to_string());
        cmd.env("LATTICE_REVISION_GROUP", ctx.revision_group.to_string());

        debug!(job = %ctx.job_id(), step = %step.name, dir = %work_dir.display(), "Spawning step");
        let mut child = cmd.spawn()?;

        let prefix = format!("[{}]", ctx.job_id());
        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(stream_lines(out, prefix.clone(), false, self.verbose)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(stream_lines(err, prefix, true, self.verbose)));

        let result = tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    StepResult::Succeeded
                } else {
                    StepResult::Failed { exit_code: status.code().unwrap_or(-1) }
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                StepResult::Cancelled
            }
        };

        for handle in [stdout, stderr].into_iter().flatten() {
            // Grandchildren of a killed shell may still hold the pipes open.
            if result == StepResult::Cancelled {
                handle.abort();
            } else {
                let _ = handle.await;
            }
        }
        Ok(result)
    }
}

async fn stream_lines<R>(reader: R, prefix: String, is_stderr: bool, verbose: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !verbose {
            continue;
        }
        if is_stderr {
            println!("{} {}", style(&prefix).dim(), style(&line).red().dim());
        } else {
            println!("{} {}", style(&prefix).dim(), line);
        }
    }
}

#[async_trait]
impl PayloadRunner for ShellRunner {
    async fn execute(&self, ctx: &JobContext, cancel: CancellationToken) -> Result<PayloadOutcome> {
        tokio::fs::create_dir_all(&ctx.workspace).await?;
        let total = ctx.job.steps.len();
        let mut failure: Option<String> = None;

        for (i, step) in ctx.job.steps.iter().enumerate() {
            if failure.is_some() && step.execution_mode == ExecutionMode::OnSuccess {
                debug!(job = %ctx.job_id(), step = %step.name, "Skipping step after failure");
                continue;
            }
            info!(job = %ctx.job_id(), step = %step.name, "Step {}/{}", i + 1, total);

            match self.run_step(ctx, step, &cancel).await? {
                StepResult::Succeeded => {}
                StepResult::Failed { exit_code } => {
                    failure.get_or_insert_with(|| {
                        format!("step '{}' exited with code {}", step.name, exit_code)
                    });
                }
                StepResult::Cancelled => {
                    return Ok(PayloadOutcome::Failed(format!(
                        "step '{}' cancelled",
                        step.name
                    )));
                }
            }
        }

        Ok(match failure {
            Some(reason) => PayloadOutcome::Failed(reason),
            None => PayloadOutcome::Succeeded,
        })
    }
}

/// Find a declaration file in standard locations.
pub fn find_declaration_file(path: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = path {
        let path = PathBuf::from(p);
        return path.exists().then_some(path);
    }

    ["lattice.yaml", "lattice.yml", ".lattice/build.yaml", ".lattice/build.yml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
}
