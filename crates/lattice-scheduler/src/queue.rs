//! Queue of ready jobs, bounded by the worker-pool size.

use petgraph::graph::NodeIndex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A job whose producers are all terminal.
#[derive(Debug, Clone, Copy)]
pub struct ReadyJob {
    pub node: NodeIndex,
    /// Position in the topological order; lower runs first.
    pub position: usize,
}

impl PartialEq for ReadyJob {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position
    }
}

impl Eq for ReadyJob {}

impl PartialOrd for ReadyJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position.cmp(&other.position)
    }
}

/// Ready jobs in topological order, released while a slot is free.
pub struct ReadyQueue {
    queue: BinaryHeap<Reverse<ReadyJob>>,
    max_parallel: usize,
    running: usize,
}

impl ReadyQueue {
    /// A limit of zero is treated as one.
    pub fn new(max_parallel: usize) -> Self {
        Self {
            queue: BinaryHeap::new(),
            max_parallel: max_parallel.max(1),
            running: 0,
        }
    }

    pub fn enqueue(&mut self, job: ReadyJob) {
        self.queue.push(Reverse(job));
    }

    /// Next job to start, if a slot is free. Takes the slot.
    pub fn dequeue(&mut self) -> Option<ReadyJob> {
        if self.running >= self.max_parallel {
            return None;
        }
        let Reverse(job) = self.queue.pop()?;
        self.running += 1;
        Some(job)
    }

    /// Release a slot taken by [`dequeue`](Self::dequeue).
    pub fn complete(&mut self) {
        self.running = self.running.saturating_sub(1);
    }

    /// Drop every waiting job, returning them.
    pub fn drain(&mut self) -> Vec<ReadyJob> {
        let mut jobs: Vec<_> = self.queue.drain().map(|Reverse(job)| job).collect();
        jobs.sort();
        jobs
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}
