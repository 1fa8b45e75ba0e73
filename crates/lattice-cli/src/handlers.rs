//! Command handlers.

use crate::commands::{OutputFormat, RunArgs, SourceArgs};
use crate::config::CliConfig;
use crate::executor::{ShellRunner, find_declaration_file};
use crate::store::FsArtifactStore;
use console::style;
use lattice_core::declaration::BuildDeclaration;
use lattice_core::ids::JobId;
use lattice_core::params::Parameters;
use lattice_core::report::{JobState, RunReport};
use lattice_scheduler::{BuildGraph, DeclarationLoader, Scheduler, load_declaration};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Parse `KEY=VALUE` pairs.
pub fn parse_params(pairs: &[String]) -> Result<Parameters, String> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(format!("Invalid parameter '{}', expected KEY=VALUE", pair)),
        })
        .collect()
}

/// Load, resolve and validate the declaration named by `source`.
pub async fn load_graph(source: &SourceArgs) -> Result<BuildGraph, Box<dyn Error>> {
    let path = find_declaration_file(source.path.as_deref()).ok_or_else(|| {
        format!(
            "Declaration file not found: {}",
            source.path.as_deref().unwrap_or("lattice.yaml")
        )
    })?;
    let declaration = load_declaration(&path).await?;
    let extra = parse_params(&source.params)?;
    DeclarationLoader::new()
        .build_graph(&declaration, &extra)
        .map_err(|err| {
            error!(phase = ?err.phase(), "Declaration rejected");
            err.into()
        })
}

/// Validate a declaration.
pub async fn validate(source: &SourceArgs) -> Result<(), Box<dyn Error>> {
    let graph = load_graph(source).await?;
    let groups = graph
        .revision_groups()
        .into_iter()
        .filter(|g| g.len() > 1)
        .count();

    println!("{} Declaration is valid", style("✓").green());
    println!("  Jobs: {}", graph.len());
    println!("  Dependencies: {}", graph.edge_count());
    println!("  Shared revision groups: {}", groups);
    for job in graph.roots() {
        println!("    - {} (root)", job.id);
    }
    Ok(())
}

/// Print the execution plan.
pub async fn plan(source: &SourceArgs, format: OutputFormat) -> Result<(), Box<dyn Error>> {
    let graph = load_graph(source).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&graph.snapshot())?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&graph.snapshot())?),
        OutputFormat::Table => print_plan(&graph),
    }
    Ok(())
}

fn print_plan(graph: &BuildGraph) {
    println!("{}", style("Execution order").bold());
    for (i, job) in graph.topological_order().into_iter().enumerate() {
        let kind = if job.is_composite() { " [composite]" } else { "" };
        println!(
            "  {:>3}. {}{} {}",
            i + 1,
            style(&job.id).bold(),
            kind,
            style(&job.name).dim()
        );
        for dep in &job.dependencies {
            let mut kinds = Vec::new();
            if let Some(snapshot) = &dep.snapshot {
                kinds.push(format!("snapshot, on failure {:?}", snapshot.on_failure));
            }
            if let Some(artifacts) = &dep.artifacts {
                kinds.push(format!("{} artifact rules", artifacts.rules.len()));
            }
            println!("         <- {} ({})", dep.producer, kinds.join("; "));
        }
    }

    let shared: Vec<Vec<JobId>> = graph
        .revision_groups()
        .into_iter()
        .filter(|g| g.len() > 1)
        .collect();
    if !shared.is_empty() {
        println!("\n{}", style("Revision groups").bold());
        for (i, group) in shared.iter().enumerate() {
            let ids: Vec<&str> = group.iter().map(JobId::as_str).collect();
            println!("  {}: {}", i + 1, ids.join(", "));
        }
    }
}

/// Execute a declaration locally. Returns whether the run succeeded.
pub async fn run(config: &CliConfig, args: &RunArgs) -> Result<bool, Box<dyn Error>> {
    let mut graph = load_graph(&args.source).await?;
    if !args.jobs.is_empty() {
        let targets: Vec<JobId> = args.jobs.iter().map(|j| JobId::new(j.as_str())).collect();
        graph = graph.restrict_to(&targets)?;
    }

    if args.dry_run {
        print_plan(&graph);
        return Ok(true);
    }

    let mut scheduler_config = config.scheduler_config();
    if let Some(max_parallel) = args.max_parallel {
        scheduler_config = scheduler_config.with_max_parallel(max_parallel);
    }

    println!(
        "{} Running {} jobs ({} at a time)",
        style("▶").cyan(),
        style(graph.len()).bold(),
        scheduler_config.max_parallel
    );

    let runner = ShellRunner::new(config.shell.clone());
    let runner = if args.quiet { runner.quiet() } else { runner };
    let scheduler = Scheduler::new(
        Arc::new(runner),
        Arc::new(FsArtifactStore::new(config.artifact_root.clone())),
        scheduler_config,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let report = scheduler.run(&graph, cancel).await?;
    print_report(&graph, &report);

    if let Some(path) = &args.report {
        write_report(&report, path).await?;
        println!("  Report written to {}", path.display());
    }

    Ok(report.is_success())
}

fn print_report(graph: &BuildGraph, report: &RunReport) {
    println!();
    for job in graph.topological_order() {
        let Some(record) = report.job(&job.id) else {
            continue;
        };
        let marker = match record.state {
            JobState::Succeeded => style("✓").green(),
            JobState::Failed => style("✗").red(),
            JobState::Cancelled => style("-").yellow(),
            _ => style("?").dim(),
        };
        let duration = record
            .duration_ms
            .map(|ms| format!(" ({:.2}s)", ms as f64 / 1000.0))
            .unwrap_or_default();
        println!("  {} {}{}", marker, job.id, style(duration).dim());
        if let Some(failure) = &record.failure {
            println!("      {}", style(failure).dim());
        }
        for problem in &record.problems {
            println!("      {} {}", style("!").yellow(), problem.description);
        }
    }

    let status = if report.is_success() {
        style(format!("{:?}", report.status)).green()
    } else {
        style(format!("{:?}", report.status)).red()
    };
    println!(
        "\n{} {} succeeded, {} failed, {} cancelled in {:.2}s",
        status,
        report.count(JobState::Succeeded),
        report.count(JobState::Failed),
        report.count(JobState::Cancelled),
        report.duration_ms() as f64 / 1000.0
    );
}

pub async fn write_report(report: &RunReport, path: &Path) -> Result<(), Box<dyn Error>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, serde_json::to_string_pretty(report)?).await?;
    Ok(())
}

/// Print the JSON schema of the declaration format.
pub fn schema() -> Result<(), Box<dyn Error>> {
    let schema = schemars::schema_for!(BuildDeclaration);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Show current configuration.
pub fn show_config(config: &CliConfig) -> Result<(), Box<dyn Error>> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

/// Set a configuration value.
pub fn set_config(key: &str, value: &str) -> Result<(), Box<dyn Error>> {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

pub fn config_path() -> Result<(), Box<dyn Error>> {
    println!("{}", CliConfig::config_path()?.display());
    Ok(())
}
