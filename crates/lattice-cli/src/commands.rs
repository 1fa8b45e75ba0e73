//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve a declaration and check the dependency graph
    Validate {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Show the execution order, dependency edges and revision groups
    Plan {
        #[command(flatten)]
        source: SourceArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Execute a declaration locally
    Run(RunArgs),

    /// Print the JSON schema of the declaration format
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Path to the declaration file (defaults to lattice.yaml)
    pub path: Option<String>,

    /// Parameter overriding the root project's, as KEY=VALUE
    #[arg(short = 'p', long = "param")]
    pub params: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Maximum number of jobs running at once
    #[arg(short = 'j', long)]
    pub max_parallel: Option<usize>,

    /// Run only these jobs and the jobs they depend on
    #[arg(long = "job")]
    pub jobs: Vec<String>,

    /// Print the plan without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Write the JSON run report to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Do not echo step output
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key, e.g. `max_parallel` or `agents.<name>.<param>`
        key: String,

        /// Value
        value: String,
    },

    /// Print the configuration file path
    Path,
}
