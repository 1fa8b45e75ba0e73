//! Matching artifact rules against published outputs.

use glob::{MatchOptions, Pattern};
use lattice_core::artifact::{
    ArtifactRule, ArtifactSource, CopyOperation, PublishedArtifact, StagingPlan, join_path,
    normalize_destination,
};
use lattice_core::dependency::ArtifactRules;
use lattice_core::ids::JobId;
use lattice_core::{Error, Result};
use std::collections::HashSet;
use tracing::debug;

/// `*` stays within one path segment; `**` crosses segments.
pub const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Computes staging plans from a producer's published artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArtifactResolver;

impl ArtifactResolver {
    pub fn new() -> Self {
        Self
    }

    /// Copy operations for one artifact dependency, in rule order.
    ///
    /// Fails with [`Error::NoArtifactMatch`] when a rule's outer pattern
    /// matches nothing the producer published.
    pub fn plan(
        &self,
        consumer: &JobId,
        producer: &JobId,
        rules: &ArtifactRules,
        published: &[PublishedArtifact],
    ) -> Result<StagingPlan> {
        let mut plan = StagingPlan::default();

        for rule in &rules.rules {
            let destination = normalize_destination(&rule.destination).ok_or_else(|| {
                Error::UnsafeArtifactPath {
                    job: consumer.clone(),
                    rule: rule.to_string(),
                    destination: rule.destination.clone(),
                }
            })?;
            let source = compile(consumer, rule, &rule.source)?;
            let source_prefix = literal_prefix(&rule.source);

            let matched: Vec<&PublishedArtifact> = published
                .iter()
                .filter(|artifact| source.matches_with(&artifact.path, MATCH_OPTIONS))
                .collect();
            if matched.is_empty() {
                return Err(Error::NoArtifactMatch {
                    consumer: consumer.clone(),
                    producer: producer.clone(),
                    pattern: rule.source.clone(),
                });
            }

            if rules.clean_destination && !plan.clean.contains(&destination) {
                plan.clean.push(destination.clone());
            }

            match &rule.inner {
                Some(inner) => {
                    let entry_pattern = compile(consumer, rule, inner)?;
                    let entry_prefix = literal_prefix(inner);
                    for artifact in matched {
                        for entry in &artifact.entries {
                            if !entry_pattern.matches_with(entry, MATCH_OPTIONS) {
                                continue;
                            }
                            plan.operations.push(CopyOperation {
                                source: ArtifactSource::ArchiveEntry {
                                    producer: producer.clone(),
                                    archive: artifact.path.clone(),
                                    entry: entry.clone(),
                                },
                                destination: staged_path(
                                    consumer,
                                    rule,
                                    &destination,
                                    relative_to(entry, entry_prefix),
                                )?,
                            });
                        }
                    }
                }
                None => {
                    for artifact in matched {
                        plan.operations.push(CopyOperation {
                            source: ArtifactSource::File {
                                producer: producer.clone(),
                                path: artifact.path.clone(),
                            },
                            destination: staged_path(
                                consumer,
                                rule,
                                &destination,
                                relative_to(&artifact.path, source_prefix),
                            )?,
                        });
                    }
                }
            }
        }

        debug!(
            consumer = %consumer,
            producer = %producer,
            operations = plan.operations.len(),
            "Planned artifact staging"
        );
        Ok(last_write_wins(plan))
    }

    /// Concatenate plans, keeping rule order across dependencies.
    pub fn merge(&self, plans: impl IntoIterator<Item = StagingPlan>) -> StagingPlan {
        let mut merged = StagingPlan::default();
        for plan in plans {
            for root in plan.clean {
                if !merged.clean.contains(&root) {
                    merged.clean.push(root);
                }
            }
            merged.operations.extend(plan.operations);
        }
        last_write_wins(merged)
    }
}

fn compile(consumer: &JobId, rule: &ArtifactRule, pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|e| Error::InvalidArtifactRule {
        job: consumer.clone(),
        rule: rule.to_string(),
        reason: e.to_string(),
    })
}

/// Final location of one staged file. Published names and archive entries
/// come from producers, so the joined path is checked against the input root.
fn staged_path(
    consumer: &JobId,
    rule: &ArtifactRule,
    destination: &str,
    relative: &str,
) -> Result<String> {
    let joined = join_path(destination, relative);
    normalize_destination(&joined)
        .filter(|path| !path.is_empty())
        .ok_or_else(|| Error::UnsafeArtifactPath {
            job: consumer.clone(),
            rule: rule.to_string(),
            destination: joined,
        })
}

/// Keep only the last operation per destination, preserving relative order.
fn last_write_wins(mut plan: StagingPlan) -> StagingPlan {
    let mut seen = HashSet::new();
    let mut kept: Vec<CopyOperation> = plan
        .operations
        .into_iter()
        .rev()
        .filter(|op| seen.insert(op.destination.clone()))
        .collect();
    kept.reverse();
    plan.operations = kept;
    plan
}

/// Leading directory components of a pattern that contain no glob syntax.
/// A pattern without any glob syntax keeps its final component out of the
/// prefix, so a literal file name survives into the destination.
pub fn literal_prefix(pattern: &str) -> &str {
    let mut end = 0;
    let mut offset = 0;
    for component in pattern.split('/') {
        let next = offset + component.len();
        if next >= pattern.len() || component.contains(['*', '?', '[']) {
            break;
        }
        end = next;
        offset = next + 1;
    }
    &pattern[..end]
}

/// Path relative to `prefix`, or the path unchanged when outside it.
pub fn relative_to<'a>(path: &'a str, prefix: &str) -> &'a str {
    if prefix.is_empty() {
        return path;
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(path)
}
