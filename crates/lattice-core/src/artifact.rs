//! Artifact rules, published artifacts and staging plans.
//!
//! Consumer rules have the shape `<source-glob>[!<inner-glob>][=><dest>]`.
//! Producer output rules have the shape `<glob>[=><target-dir>]`.

use crate::ids::JobId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

const ARROW: &str = "=>";
const ARCHIVE_SEPARATOR: char = '!';

/// A single consumer-side artifact rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRule {
    /// Glob matched against the names of the producer's published artifacts.
    pub source: String,
    /// Glob matched against entries inside a matched archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<String>,
    /// Destination directory, relative to the consumer's input root.
    pub destination: String,
}

impl ArtifactRule {
    /// Parse one rule line. Returns the reason on malformed input.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        if line.is_empty() {
            return Err("empty rule".to_string());
        }

        let (pattern, destination) = match line.split_once(ARROW) {
            Some((pattern, destination)) => (pattern.trim(), destination.trim().to_string()),
            None => (line, ".".to_string()),
        };

        let (source, inner) = match pattern.split_once(ARCHIVE_SEPARATOR) {
            Some((source, inner)) => {
                let inner = inner.trim();
                if inner.is_empty() {
                    return Err("empty archive entry pattern after '!'".to_string());
                }
                (source.trim(), Some(inner.to_string()))
            }
            None => (pattern, None),
        };

        if source.is_empty() {
            return Err("empty source pattern".to_string());
        }

        Ok(Self {
            source: source.to_string(),
            inner,
            destination,
        })
    }
}

impl fmt::Display for ArtifactRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)?;
        if let Some(inner) = &self.inner {
            write!(f, "!{}", inner)?;
        }
        write!(f, "=>{}", self.destination)
    }
}

/// A producer-side output rule: which workspace files a job publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OutputRule {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl OutputRule {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (pattern, target) = match line.split_once(ARROW) {
            Some((pattern, target)) => {
                let target = target.trim();
                let target = (!target.is_empty() && target != ".").then(|| target.to_string());
                (pattern.trim(), target)
            }
            None => (line, None),
        };

        if pattern.is_empty() {
            return Err("empty output pattern".to_string());
        }

        Ok(Self {
            pattern: pattern.to_string(),
            target,
        })
    }
}

/// Split a multi-line rule block into trimmed, non-empty lines.
pub fn rule_lines(block: &str) -> impl Iterator<Item = &str> {
    block.lines().map(str::trim).filter(|line| !line.is_empty())
}

/// A file a producer actually published after succeeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PublishedArtifact {
    /// Path in the producer's artifact namespace.
    pub path: String,
    /// Entries inside the artifact when it is an archive.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<String>,
}

impl PublishedArtifact {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
        }
    }

    pub fn archive(path: impl Into<String>, entries: Vec<String>) -> Self {
        Self {
            path: path.into(),
            entries,
        }
    }
}

/// Where a staged file comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactSource {
    File {
        producer: JobId,
        path: String,
    },
    ArchiveEntry {
        producer: JobId,
        archive: String,
        entry: String,
    },
}

/// A single copy into the consumer's input namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyOperation {
    pub source: ArtifactSource,
    pub destination: String,
}

/// Concrete copy operations for one artifact dependency.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingPlan {
    /// Destination roots emptied before copying.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clean: Vec<String>,
    pub operations: Vec<CopyOperation>,
}

/// Normalize a destination relative to an input root.
///
/// Returns `None` when the path is empty, absolute, or climbs above the root.
/// The root itself normalizes to the empty string.
pub fn normalize_destination(destination: &str) -> Option<String> {
    let destination = destination.trim();
    if destination.is_empty() {
        return None;
    }

    let unified = destination.replace('\\', "/");
    if unified.starts_with('/') || has_drive_prefix(&unified) {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in unified.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    Some(parts.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Join a normalized directory and a relative path.
pub fn join_path(dir: &str, rest: &str) -> String {
    match (dir.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => dir.to_string(),
        (false, false) => format!("{}/{}", dir, rest),
    }
}
