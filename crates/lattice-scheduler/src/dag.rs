//! Dependency graph of resolved jobs.
//!
//! Jobs live in an arena (`petgraph::DiGraph`); every edge points from a
//! producer to its consumer and carries the consumer's [`Dependency`].

use lattice_core::artifact::normalize_destination;
use lattice_core::dependency::{Dependency, EdgeKind};
use lattice_core::ids::{JobId, TemplateId};
use lattice_core::job::{JobKind, ResolvedJob};
use lattice_core::{Error, Result};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;

/// Validated, acyclic dependency graph with a deterministic execution order.
#[derive(Debug)]
pub struct BuildGraph {
    graph: DiGraph<Arc<ResolvedJob>, Dependency>,
    index: HashMap<JobId, NodeIndex>,
    order: Vec<NodeIndex>,
    /// Topological position per node index.
    positions: Vec<usize>,
    /// Revision group per node index.
    groups: Vec<usize>,
}

impl BuildGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn job(&self, id: &JobId) -> Option<&Arc<ResolvedJob>> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn node(&self, id: &JobId) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn job_at(&self, node: NodeIndex) -> &Arc<ResolvedJob> {
        &self.graph[node]
    }

    /// Jobs in declaration order.
    pub fn jobs(&self) -> Vec<&Arc<ResolvedJob>> {
        self.graph.node_weights().collect()
    }

    /// Node indices in topological order.
    pub fn order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Jobs in topological order; ties keep declaration order.
    pub fn topological_order(&self) -> Vec<&Arc<ResolvedJob>> {
        self.order.iter().map(|&idx| &self.graph[idx]).collect()
    }

    pub fn position(&self, node: NodeIndex) -> usize {
        self.positions[node.index()]
    }

    /// Jobs without producers.
    pub fn roots(&self) -> Vec<&Arc<ResolvedJob>> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Consumers of a job, in declaration order.
    pub fn successors(&self, id: &JobId) -> Vec<&Arc<ResolvedJob>> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn successor_nodes(&self, node: NodeIndex) -> Vec<NodeIndex> {
        sorted_neighbors(&self.graph, node, Direction::Outgoing)
    }

    /// Incoming edges of a node: producer and the consumer's dependency on it.
    pub fn dependencies_of(&self, node: NodeIndex) -> Vec<(NodeIndex, &Dependency)> {
        let mut deps: Vec<_> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|edge| (edge.source(), edge.weight()))
            .collect();
        deps.sort_by_key(|(producer, _)| *producer);
        deps
    }

    /// Outgoing edges of a node: each consumer and its dependency.
    pub fn dependents_of(&self, node: NodeIndex) -> Vec<(NodeIndex, &Dependency)> {
        let mut deps: Vec<_> = self
            .graph
            .edges_directed(node, Direction::Outgoing)
            .map(|edge| (edge.target(), edge.weight()))
            .collect();
        deps.sort_by_key(|(consumer, _)| *consumer);
        deps
    }

    pub fn revision_group(&self, id: &JobId) -> Option<usize> {
        self.index.get(id).map(|idx| self.groups[idx.index()])
    }

    pub fn revision_group_at(&self, node: NodeIndex) -> usize {
        self.groups[node.index()]
    }

    /// Groups of jobs that must build from the same revision, in order of
    /// first declaration. Singleton groups are included.
    pub fn revision_groups(&self) -> Vec<Vec<JobId>> {
        let mut groups: BTreeMap<usize, Vec<JobId>> = BTreeMap::new();
        for idx in self.graph.node_indices() {
            groups
                .entry(self.groups[idx.index()])
                .or_default()
                .push(self.graph[idx].id.clone());
        }
        groups.into_values().collect()
    }

    /// Serializable view of the graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        let nodes = self
            .graph
            .node_indices()
            .map(|idx| {
                let job = &self.graph[idx];
                SnapshotNode {
                    id: job.id.clone(),
                    name: job.name.clone(),
                    kind: job.kind,
                    template: job.template.clone(),
                    revision_group: self.groups[idx.index()],
                }
            })
            .collect();

        let mut edges = Vec::new();
        for consumer in self.graph.node_indices() {
            for (producer, dep) in self.dependencies_of(consumer) {
                for kind in dep.edge_kinds() {
                    edges.push(SnapshotEdge {
                        producer: self.graph[producer].id.clone(),
                        consumer: self.graph[consumer].id.clone(),
                        kind,
                    });
                }
            }
        }

        GraphSnapshot {
            nodes,
            edges,
            order: self
                .order
                .iter()
                .map(|&idx| self.graph[idx].id.clone())
                .collect(),
        }
    }

    /// Subgraph holding `targets` and everything they transitively depend on.
    pub fn restrict_to(&self, targets: &[JobId]) -> Result<BuildGraph> {
        let mut keep = BTreeSet::new();
        let mut stack = Vec::new();
        for target in targets {
            let idx = self
                .node(target)
                .ok_or_else(|| Error::UnknownJob { job: target.clone() })?;
            stack.push(idx);
        }
        while let Some(idx) = stack.pop() {
            if keep.insert(idx) {
                stack.extend(self.graph.neighbors_directed(idx, Direction::Incoming));
            }
        }

        let jobs = keep
            .into_iter()
            .map(|idx| ResolvedJob::clone(&self.graph[idx]))
            .collect();
        GraphBuilder::new().build(jobs)
    }

    fn neighbors(&self, id: &JobId, direction: Direction) -> Vec<&Arc<ResolvedJob>> {
        self.index
            .get(id)
            .map(|&idx| {
                sorted_neighbors(&self.graph, idx, direction)
                    .into_iter()
                    .map(|n| &self.graph[n])
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn sorted_neighbors<N, E>(
    graph: &DiGraph<N, E>,
    node: NodeIndex,
    direction: Direction,
) -> Vec<NodeIndex> {
    let mut neighbors: Vec<_> = graph.neighbors_directed(node, direction).collect();
    neighbors.sort();
    neighbors.dedup();
    neighbors
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<SnapshotNode>,
    pub edges: Vec<SnapshotEdge>,
    pub order: Vec<JobId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: JobId,
    pub name: String,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateId>,
    pub revision_group: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub producer: JobId,
    pub consumer: JobId,
    #[serde(flatten)]
    pub kind: EdgeKind,
}

/// Builder for validated build graphs.
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build and validate a graph from resolved jobs, in declaration order.
    pub fn build(&self, jobs: Vec<ResolvedJob>) -> Result<BuildGraph> {
        let mut graph = DiGraph::with_capacity(jobs.len(), jobs.len());
        let mut index = HashMap::with_capacity(jobs.len());

        for job in jobs {
            if index.contains_key(&job.id) {
                return Err(Error::DuplicateJob { job: job.id });
            }
            let id = job.id.clone();
            let idx = graph.add_node(Arc::new(job));
            index.insert(id, idx);
        }

        let consumers: Vec<NodeIndex> = graph.node_indices().collect();
        for consumer in consumers {
            let job = Arc::clone(&graph[consumer]);
            for dep in &job.dependencies {
                let producer = *index.get(&dep.producer).ok_or_else(|| {
                    Error::DanglingDependency {
                        consumer: job.id.clone(),
                        producer: dep.producer.clone(),
                    }
                })?;
                check_destinations(&job.id, dep)?;
                graph.add_edge(producer, consumer, dep.clone());
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(Error::CyclicDependency {
                cycle: cycle.into_iter().map(|idx| graph[idx].id.clone()).collect(),
            });
        }

        let order = topological_order(&graph);
        let mut positions = vec![0; graph.node_count()];
        for (position, idx) in order.iter().enumerate() {
            positions[idx.index()] = position;
        }
        let groups = revision_groups(&graph);

        Ok(BuildGraph {
            graph,
            index,
            order,
            positions,
            groups,
        })
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn check_destinations(consumer: &JobId, dep: &Dependency) -> Result<()> {
    let Some(artifacts) = &dep.artifacts else {
        return Ok(());
    };
    for rule in &artifacts.rules {
        if normalize_destination(&rule.destination).is_none() {
            return Err(Error::UnsafeArtifactPath {
                job: consumer.clone(),
                rule: rule.to_string(),
                destination: rule.destination.clone(),
            });
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS. Returns the first cycle found, closed on its first node.
fn find_cycle<N, E>(graph: &DiGraph<N, E>) -> Option<Vec<NodeIndex>> {
    let mut color = vec![Color::White; graph.node_count()];
    let mut path: Vec<NodeIndex> = Vec::new();

    for start in graph.node_indices() {
        if color[start.index()] != Color::White {
            continue;
        }

        // Explicit stack of (node, remaining successors) to avoid recursion.
        let mut stack: Vec<(NodeIndex, std::vec::IntoIter<NodeIndex>)> = Vec::new();
        color[start.index()] = Color::Gray;
        path.push(start);
        stack.push((
            start,
            sorted_neighbors(graph, start, Direction::Outgoing).into_iter(),
        ));

        while let Some((node, successors)) = stack.last_mut() {
            let node = *node;
            match successors.next() {
                Some(next) => match color[next.index()] {
                    Color::White => {
                        color[next.index()] = Color::Gray;
                        path.push(next);
                        let next_successors =
                            sorted_neighbors(graph, next, Direction::Outgoing).into_iter();
                        stack.push((next, next_successors));
                    }
                    Color::Gray => {
                        let start_at = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle = path[start_at..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Color::Black => {}
                },
                None => {
                    color[node.index()] = Color::Black;
                    path.pop();
                    stack.pop();
                }
            }
        }
    }
    None
}

/// Kahn's algorithm; among ready nodes the earliest declared goes first.
fn topological_order<N, E>(graph: &DiGraph<N, E>) -> Vec<NodeIndex> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|idx| graph.edges_directed(idx, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|idx| in_degree[idx.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for edge in graph.edges_directed(node, Direction::Outgoing) {
            let target = edge.target();
            in_degree[target.index()] -= 1;
            if in_degree[target.index()] == 0 {
                ready.push(Reverse(target));
            }
        }
    }
    order
}

/// Union-find over snapshot edges that synchronize revisions. Group ids are
/// assigned in declaration order of each group's first member.
fn revision_groups(graph: &DiGraph<Arc<ResolvedJob>, Dependency>) -> Vec<usize> {
    let mut sets = UnionFind::<usize>::new(graph.node_count());
    for edge in graph.edge_references() {
        if edge.weight().synchronizes_revisions() {
            sets.union(edge.source().index(), edge.target().index());
        }
    }

    let mut ids: HashMap<usize, usize> = HashMap::new();
    (0..graph.node_count())
        .map(|node| {
            let next = ids.len();
            *ids.entry(sets.find_mut(node)).or_insert(next)
        })
        .collect()
}
