//! Parameter layering and `%name%` reference substitution.
//!
//! Parameters are merged from several layers (project chain, template,
//! job-local overrides), later layers winning. References of the form
//! `%name%` are then substituted; `%%` produces a literal `%`.

use crate::error::{Error, Result};
use crate::ids::JobId;
use regex::{Captures, Regex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// A parameter mapping. Sorted so that resolution and serialized output are
/// reproducible.
pub type Parameters = BTreeMap<String, String>;

/// Declared metadata for a parameter, keyed by parameter name.
pub type ParameterSpecs = BTreeMap<String, ParameterSpec>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// When false, the parameter must resolve to a non-empty value.
    #[serde(default = "default_allow_empty")]
    pub allow_empty: bool,
}

fn default_allow_empty() -> bool {
    true
}

impl Default for ParameterSpec {
    fn default() -> Self {
        Self {
            label: None,
            description: None,
            allow_empty: default_allow_empty(),
        }
    }
}

impl ParameterSpec {
    pub fn required() -> Self {
        Self {
            allow_empty: false,
            ..Self::default()
        }
    }
}

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%%|%([A-Za-z0-9_.\-]+)%").expect("reference pattern is valid")
});

/// Resolver for layered parameters.
///
/// Stateless; the same layers always produce the same mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterResolver;

impl ParameterResolver {
    pub fn new() -> Self {
        Self
    }

    /// Merge layers in precedence order: each layer overrides the ones before it.
    pub fn merge<'a>(&self, layers: impl IntoIterator<Item = &'a Parameters>) -> Parameters {
        let mut merged = Parameters::new();
        for layer in layers {
            for (key, value) in layer {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Merge `global < template < local` and substitute every reference.
    pub fn resolve(
        &self,
        job: &JobId,
        global: &Parameters,
        template: &Parameters,
        local: &Parameters,
    ) -> Result<Parameters> {
        self.resolve_layers(job, [global, template, local])
    }

    /// Merge an arbitrary number of layers and substitute every reference.
    pub fn resolve_layers<'a>(
        &self,
        job: &JobId,
        layers: impl IntoIterator<Item = &'a Parameters>,
    ) -> Result<Parameters> {
        let merged = self.merge(layers);
        let mut expansion = Expansion {
            job,
            merged: &merged,
            resolved: Parameters::new(),
            in_progress: Vec::new(),
        };
        for key in merged.keys() {
            expansion.resolve_key(key)?;
        }
        Ok(expansion.resolved)
    }

    /// Substitute references in a free-form field against already-resolved
    /// parameters. Substituted text is not scanned again.
    pub fn substitute(
        &self,
        job: &JobId,
        field: &str,
        text: &str,
        params: &Parameters,
    ) -> Result<String> {
        expand(text, |name| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UnresolvedReference {
                    job: job.clone(),
                    field: field.to_string(),
                    reference: name.to_string(),
                })
        })
    }

    /// Fail when a parameter declared with `allow_empty: false` is missing
    /// or resolved to an empty string.
    pub fn check_specs(&self, job: &JobId, specs: &ParameterSpecs, params: &Parameters) -> Result<()> {
        for (name, spec) in specs {
            if spec.allow_empty {
                continue;
            }
            if params.get(name).is_none_or(|value| value.is_empty()) {
                return Err(Error::EmptyParameter {
                    job: job.clone(),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }
}

struct Expansion<'a> {
    job: &'a JobId,
    merged: &'a Parameters,
    resolved: Parameters,
    in_progress: Vec<String>,
}

impl Expansion<'_> {
    fn resolve_key(&mut self, key: &str) -> Result<String> {
        if let Some(value) = self.resolved.get(key) {
            return Ok(value.clone());
        }

        if let Some(start) = self.in_progress.iter().position(|k| k == key) {
            let mut chain = self.in_progress[start..].to_vec();
            chain.push(key.to_string());
            return Err(Error::CyclicParameter {
                job: self.job.clone(),
                chain,
            });
        }

        let merged = self.merged;
        let job = self.job;
        let Some(raw) = merged.get(key) else {
            return Err(Error::Internal(format!("parameter {} vanished", key)));
        };

        self.in_progress.push(key.to_string());
        let value = expand(raw, |name| {
            if merged.contains_key(name) {
                self.resolve_key(name)
            } else {
                Err(Error::UnresolvedReference {
                    job: job.clone(),
                    field: format!("parameter {}", key),
                    reference: name.to_string(),
                })
            }
        });
        self.in_progress.pop();

        let value = value?;
        self.resolved.insert(key.to_string(), value.clone());
        Ok(value)
    }
}

/// Scan `text` once left to right, replacing each reference with `lookup`.
fn expand(text: &str, mut lookup: impl FnMut(&str) -> Result<String>) -> Result<String> {
    let mut output = String::with_capacity(text.len());
    let mut last = 0;

    for caps in REFERENCE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        output.push_str(&text[last..whole.start()]);
        output.push_str(&replacement(&caps, &mut lookup)?);
        last = whole.end();
    }

    output.push_str(&text[last..]);
    Ok(output)
}

fn replacement(caps: &Captures<'_>, lookup: &mut impl FnMut(&str) -> Result<String>) -> Result<String> {
    match caps.get(1) {
        Some(name) => lookup(name.as_str()),
        None => Ok("%".to_string()),
    }
}
