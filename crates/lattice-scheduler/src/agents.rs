//! Agent matching for job assignment.

use lattice_core::job::ResolvedJob;
use lattice_core::params::Parameters;
use lattice_core::requirement::Predicate;
use lattice_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// A build agent described by the parameters it advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    #[serde(default)]
    pub params: Parameters,
}

impl AgentProfile {
    pub fn new(name: impl Into<String>, params: Parameters) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Matcher for assigning jobs to agents.
#[derive(Debug, Clone, Default)]
pub struct AgentMatcher {
    agents: Vec<AgentProfile>,
}

impl AgentMatcher {
    pub fn new(agents: Vec<AgentProfile>) -> Self {
        Self { agents }
    }

    /// Whether any agent pool is configured at all.
    pub fn is_enabled(&self) -> bool {
        !self.agents.is_empty()
    }

    pub fn agents(&self) -> &[AgentProfile] {
        &self.agents
    }

    /// First agent, in declared order, satisfying every requirement of the job.
    ///
    /// Without a pool every job runs locally and `None` is returned. With a
    /// pool and no compatible agent, the requirements the closest agent misses
    /// are reported.
    pub fn find(&self, job: &ResolvedJob) -> Result<Option<&AgentProfile>> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let predicates = job
            .requirements
            .iter()
            .map(|requirement| {
                requirement
                    .compile()
                    .map_err(|reason| Error::InvalidRequirement {
                        job: job.id.clone(),
                        name: requirement.name.clone(),
                        reason,
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut closest: Option<Vec<String>> = None;
        for agent in &self.agents {
            let unmet = unmet(&predicates, agent);
            if unmet.is_empty() {
                return Ok(Some(agent));
            }
            if closest.as_ref().is_none_or(|c| unmet.len() < c.len()) {
                closest = Some(unmet);
            }
        }

        Err(Error::NoCompatibleAgent {
            job: job.id.clone(),
            unmet: closest.unwrap_or_default(),
        })
    }
}

/// Requirements the agent does not satisfy.
fn unmet(predicates: &[Predicate<'_>], agent: &AgentProfile) -> Vec<String> {
    predicates
        .iter()
        .filter(|p| !p.is_satisfied_by(&agent.params))
        .map(|p| p.requirement().to_string())
        .collect()
}
