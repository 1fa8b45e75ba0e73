//! Lattice Core
//!
//! Core domain types, traits, and error handling for Lattice build matrices.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates: templates, jobs, dependency edges, artifact
//! rules, agent requirements, and the parameter resolver.

pub mod artifact;
pub mod declaration;
pub mod dependency;
pub mod error;
pub mod ids;
pub mod job;
pub mod params;
pub mod ports;
pub mod report;
pub mod requirement;
pub mod template;

pub use error::{Error, ErrorPhase, Result};
pub use ids::*;
