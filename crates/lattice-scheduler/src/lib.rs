//! Graph construction and run orchestration for Lattice build matrices.
//!
//! [`DeclarationLoader`] turns a project tree into resolved jobs,
//! [`GraphBuilder`] validates them into a [`BuildGraph`], and [`Scheduler`]
//! executes the graph against a payload runner and an artifact store.

pub mod agents;
pub mod artifacts;
pub mod dag;
pub mod loader;
pub mod matrix;
pub mod queue;
pub mod scheduler;

#[cfg(test)]
mod scheduler_tests;

pub use agents::{AgentMatcher, AgentProfile};
pub use artifacts::ArtifactResolver;
pub use dag::{BuildGraph, GraphBuilder, GraphSnapshot};
pub use loader::{DeclarationLoader, LoadedBuild, load_declaration, parse_declaration};
pub use matrix::{MatrixExpander, MatrixExpansion};
pub use queue::{ReadyJob, ReadyQueue};
pub use scheduler::{Scheduler, SchedulerConfig};
