//! Error types for Lattice.

use crate::ids::{JobId, TemplateId};
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Declaration errors
    #[error("Template already registered: {name}")]
    DuplicateTemplate { name: TemplateId },

    #[error("Unknown template '{name}' referenced by {referrer}")]
    UnknownTemplate { name: TemplateId, referrer: String },

    #[error("Template inheritance cycle: {}", join(.chain, " -> "))]
    CyclicTemplate { chain: Vec<TemplateId> },

    #[error("Job declared more than once: {job}")]
    DuplicateJob { job: JobId },

    #[error("Unknown job: {job}")]
    UnknownJob { job: JobId },

    #[error("Invalid declaration of {job}: {reason}")]
    InvalidDeclaration { job: JobId, reason: String },

    #[error("Job {consumer} depends on undeclared job {producer}")]
    DanglingDependency { consumer: JobId, producer: JobId },

    #[error("Artifact rule '{rule}' of {job} has unsafe destination '{destination}'")]
    UnsafeArtifactPath {
        job: JobId,
        rule: String,
        destination: String,
    },

    #[error("Invalid artifact rule '{rule}' in {job}: {reason}")]
    InvalidArtifactRule {
        job: JobId,
        rule: String,
        reason: String,
    },

    #[error("Invalid requirement on '{name}' in {job}: {reason}")]
    InvalidRequirement {
        job: JobId,
        name: String,
        reason: String,
    },

    // Resolution errors
    #[error("Unresolved reference %{reference}% in {field} of {job}")]
    UnresolvedReference {
        job: JobId,
        field: String,
        reference: String,
    },

    #[error("Cyclic parameter reference in {job}: {}", join(.chain, " -> "))]
    CyclicParameter { job: JobId, chain: Vec<String> },

    #[error("Required parameter '{name}' of {job} resolved to an empty value")]
    EmptyParameter { job: JobId, name: String },

    // Structural errors
    #[error("Cyclic dependency: {}", join(.cycle, " -> "))]
    CyclicDependency { cycle: Vec<JobId> },

    // Runtime errors
    #[error("Job {job} failed: {reason}")]
    PayloadFailed { job: JobId, reason: String },

    #[error("Job {job} timed out after {}s", .timeout.as_secs_f64())]
    Timeout { job: JobId, timeout: Duration },

    #[error("Artifact rule '{pattern}' of {consumer} matched nothing published by {producer}")]
    NoArtifactMatch {
        consumer: JobId,
        producer: JobId,
        pattern: String,
    },

    #[error("No agent satisfies the requirements of {job}: {}", join(.unmet, ", "))]
    NoCompatibleAgent { job: JobId, unmet: Vec<String> },

    #[error("Artifact staging failed for {job}: {reason}")]
    Staging { job: JobId, reason: String },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The phase of an orchestration run an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPhase {
    /// Malformed declarations, detected before anything runs.
    Declaration,
    /// Parameter substitution failures.
    Resolution,
    /// Graph shape violations.
    Structural,
    /// Failures local to a single job while the run is in progress.
    Runtime,
    Infrastructure,
}

impl Error {
    pub fn phase(&self) -> ErrorPhase {
        match self {
            Error::DuplicateTemplate { .. }
            | Error::UnknownTemplate { .. }
            | Error::CyclicTemplate { .. }
            | Error::DuplicateJob { .. }
            | Error::UnknownJob { .. }
            | Error::InvalidDeclaration { .. }
            | Error::DanglingDependency { .. }
            | Error::UnsafeArtifactPath { .. }
            | Error::InvalidArtifactRule { .. }
            | Error::InvalidRequirement { .. } => ErrorPhase::Declaration,
            Error::UnresolvedReference { .. }
            | Error::CyclicParameter { .. }
            | Error::EmptyParameter { .. } => ErrorPhase::Resolution,
            Error::CyclicDependency { .. } => ErrorPhase::Structural,
            Error::PayloadFailed { .. }
            | Error::Timeout { .. }
            | Error::NoArtifactMatch { .. }
            | Error::NoCompatibleAgent { .. }
            | Error::Staging { .. } => ErrorPhase::Runtime,
            Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => {
                ErrorPhase::Infrastructure
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

fn join<T: Display>(items: &[T], separator: &str) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_every_job() {
        let err = Error::CyclicDependency {
            cycle: vec![JobId::new("a"), JobId::new("b"), JobId::new("a")],
        };
        assert_eq!(err.to_string(), "Cyclic dependency: a -> b -> a");
        assert_eq!(err.phase(), ErrorPhase::Structural);
    }

    #[test]
    fn test_timeout_is_a_runtime_error() {
        let err = Error::Timeout {
            job: JobId::new("build"),
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Job build timed out after 1.5s");
        assert_eq!(err.phase(), ErrorPhase::Runtime);
    }
}
