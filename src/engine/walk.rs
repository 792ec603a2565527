use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use tracing::{debug, warn};

use super::eval::{self, effective_children};
use super::{Failure, Skipped, Task, Taskmaster};
use crate::builder::ScanContext;
use crate::error::BuildError;
use crate::graph::{BatchId, NodeId, NodeKind, NodeState};

/// A node being expanded by the walk.
#[derive(Debug)]
pub(crate) struct Frame {
    node: NodeId,
    children: Vec<NodeId>,
    next: usize,
}

impl Frame {
    fn new(node: NodeId, children: Vec<NodeId>) -> Self {
        Self {
            node,
            children,
            next: 0,
        }
    }

    fn next_child(&mut self) -> Option<NodeId> {
        let child = self.children.get(self.next).copied()?;
        self.next += 1;
        Some(child)
    }
}

/// Rotates a cycle so it starts at its smallest member, so the same cycle
/// found from different entry points compares equal.
fn normalize_cycle(mut cycle: Vec<NodeId>) -> Vec<NodeId> {
    if let Some(pos) = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(pos, _)| pos)
    {
        cycle.rotate_left(pos);
    }
    cycle
}

/// Finds the cycles among `nodes`, following `edges`, with a depth-first
/// search on an explicit stack. Every node is expanded once.
pub(crate) fn find_cycles(
    nodes: &[NodeId],
    mut edges: impl FnMut(NodeId) -> Vec<NodeId>,
) -> Vec<Vec<NodeId>> {
    let mut cycles = Vec::new();
    let mut visited = HashSet::new();

    for &start in nodes {
        if !visited.insert(start) {
            continue;
        }

        let mut stack = vec![Frame::new(start, edges(start))];
        let mut on_path = HashMap::from([(start, 0)]);

        while let Some(frame) = stack.last_mut() {
            let Some(child) = frame.next_child() else {
                if let Some(frame) = stack.pop() {
                    on_path.remove(&frame.node);
                }
                continue;
            };

            if let Some(&pos) = on_path.get(&child) {
                cycles.push(stack[pos..].iter().map(|frame| frame.node).collect());
            } else if visited.insert(child) {
                on_path.insert(child, stack.len());
                stack.push(Frame::new(child, edges(child)));
            }
        }
    }
    cycles
}

impl Taskmaster {
    /// Walks until a task is ready or there is nothing left to walk.
    pub(super) fn fill(&mut self) {
        while self.ready.is_empty() && !self.stopped && self.step() {}
    }

    /// Takes one step of the walk. Returns `false` once the walk is exhausted.
    fn step(&mut self) -> bool {
        let Some(frame) = self.stack.last_mut() else {
            while let Some(root) = self.roots.pop_front() {
                if self.graph.node(root).state == NodeState::Unvisited {
                    self.push(root);
                    return true;
                }
            }
            return false;
        };

        match frame.next_child() {
            Some(child) => match self.graph.node(child).state {
                NodeState::Unvisited => self.push(child),
                NodeState::Pending => {
                    if let Some(&pos) = self.on_path.get(&child) {
                        let cycle = self.stack[pos..].iter().map(|frame| frame.node).collect();
                        self.record_cycle(cycle);
                    }
                }
                _ => {}
            },
            None => {
                if let Some(frame) = self.stack.pop() {
                    self.on_path.remove(&frame.node);
                    self.close(frame.node);
                    self.propagate();
                }
            }
        }
        true
    }

    fn push(&mut self, id: NodeId) {
        self.graph.node_mut(id).state = NodeState::Pending;
        let children = effective_children(&self.graph, id);
        self.on_path.insert(id, self.stack.len());
        self.stack.push(Frame::new(id, children));
    }

    /// Reports a cycle the first time it is seen. Its members fail once the
    /// walk closes them.
    fn record_cycle(&mut self, cycle: Vec<NodeId>) {
        let cycle = normalize_cycle(cycle);
        self.cyclic.extend(cycle.iter().copied());
        if !self.seen_cycles.contains(&cycle) {
            let names: Vec<String> = cycle
                .iter()
                .map(|&id| self.graph.name(id).to_string())
                .collect();
            warn!("Dependency cycle: {}", names.join(" -> "));
            self.report.failures.push(Failure {
                targets: names.clone(),
                error: BuildError::Cycle(cycle.iter().map(|&id| self.graph.arc_name(id)).collect()),
            });
            self.report.cycles.push(names);
            self.seen_cycles.insert(cycle);
        }
    }

    /// Called once the walk has expanded all children of `id`. Registers
    /// `id` with every child it still has to wait for, or evaluates it.
    fn close(&mut self, id: NodeId) {
        if self.graph.node(id).state != NodeState::Pending {
            return;
        }

        if self.cyclic.contains(&id) {
            self.graph.node_mut(id).state = NodeState::Failed;
            self.settled.push(id);
            return;
        }

        let children = effective_children(&self.graph, id);
        if let Some(&failed) = children
            .iter()
            .find(|&&child| self.graph.node(child).state == NodeState::Failed)
        {
            self.skip(id, failed);
            return;
        }

        let mut waiting = 0;
        for child in children {
            match self.graph.node(child).state {
                NodeState::UpToDate | NodeState::Built | NodeState::Failed => continue,
                // Discovered late by a scanner.
                NodeState::Unvisited => self.roots.push_front(child),
                NodeState::Pending | NodeState::Building => {}
            }
            self.waiters.entry(child).or_default().push(id);
            waiting += 1;
        }

        self.graph.node_mut(id).waiting = waiting;
        if waiting == 0 {
            self.evaluate(id);
        }
    }

    /// Tells the waiters of every settled node, evaluating those that have
    /// nothing left to wait for.
    pub(super) fn propagate(&mut self) {
        while let Some(done) = self.settled.pop() {
            let Some(waiters) = self.waiters.remove(&done) else {
                continue;
            };
            let failed = self.graph.node(done).state == NodeState::Failed;

            for waiter in waiters {
                if self.graph.node(waiter).state != NodeState::Pending {
                    continue;
                }
                if failed {
                    self.skip(waiter, done);
                    continue;
                }

                let node = self.graph.node_mut(waiter);
                node.waiting = node.waiting.saturating_sub(1);
                if node.waiting == 0 {
                    self.evaluate(waiter);
                }
            }
        }
    }

    fn skip(&mut self, id: NodeId, cause: NodeId) {
        debug!(
            "Skipping {} because {} failed",
            self.graph.name(id),
            self.graph.name(cause)
        );
        self.graph.node_mut(id).state = NodeState::Failed;
        self.report.skipped.push(Skipped {
            node: self.graph.name(id).to_string(),
            cause: self.graph.name(cause).to_string(),
        });
        self.settled.push(id);
    }

    fn settle(&mut self, id: NodeId, state: NodeState) {
        self.graph.node_mut(id).state = state;
        self.settled.push(id);
    }

    /// Decides a node whose children are all done.
    fn evaluate(&mut self, id: NodeId) {
        let node = self.graph.node(id);
        let Some(batch) = node.batch() else {
            let on_disk = matches!(node.kind(), NodeKind::File(_) | NodeKind::Dir(_));
            if on_disk && !node.exists() && !self.graph.is_side_effect(id) {
                let name = self.graph.arc_name(id);
                self.fail(&[id], BuildError::MissingSource(name));
            } else {
                self.settle(id, NodeState::UpToDate);
            }
            return;
        };

        let targets = self.graph.batch(batch).targets.clone();
        if self.graph.batch(batch).builder.scanner.is_some() && !node.scanned {
            for &target in &targets {
                self.graph.node_mut(target).scanned = true;
            }
            match self.scan(batch) {
                Ok(deps) => {
                    for &target in &targets {
                        self.graph.add_implicit(target, &deps);
                    }
                    // New dependencies may have to be walked first.
                    self.close(id);
                }
                Err(e) => self.fail(&targets, e),
            }
            return;
        }

        let decider = self.config.decider;
        let evaluation = eval::evaluate(&self.graph, &self.store, decider, batch);

        if !evaluation.is_stale() {
            for &target in &targets {
                debug!("{} is up to date", self.graph.name(target));
                self.report.up_to_date += 1;
                self.settle(target, NodeState::UpToDate);
            }
            return;
        }

        for (target, reason) in &evaluation.reasons {
            debug!("Rebuilding {} because {reason}", self.graph.name(*target));
        }

        let task = Task::new(
            &self.graph,
            batch,
            evaluation.action_sig,
            evaluation.bsig,
            evaluation.children,
        );
        for &target in &targets {
            self.graph.node_mut(target).state = NodeState::Building;
        }
        self.ready.push_back(task);
    }

    /// Implicit dependencies of a batch, either recorded at the last build
    /// or freshly scanned.
    fn scan(&mut self, batch: BatchId) -> Result<Vec<NodeId>, BuildError> {
        let info = self.graph.batch(batch);
        let first = info.targets[0];
        let Some(scanner) = info.builder.scanner.clone() else {
            return Ok(Vec::new());
        };

        if self.config.implicit_cache
            && let Some(record) = self.store.get(self.graph.name(first))
            && let Some(implicit) = &record.implicit
            && eval::explicit_unchanged(
                &self.graph,
                &self.store,
                self.config.decider,
                batch,
                &record,
            )
        {
            debug!("Reusing recorded dependencies of {}", self.graph.name(first));
            return Ok(implicit
                .iter()
                .map(|name| match self.graph.lookup(name) {
                    Some(id) => id,
                    None => self.graph.file(name),
                })
                .collect());
        }

        let targets: Vec<Utf8PathBuf> = info
            .targets
            .iter()
            .map(|&id| self.graph.node(id).action_path())
            .collect();
        let sources: Vec<Utf8PathBuf> = info
            .sources
            .iter()
            .map(|&id| self.graph.node(id).action_path())
            .collect();

        let found = scanner
            .scan(&ScanContext {
                targets: &targets,
                sources: &sources,
            })
            .map_err(|e| BuildError::Scan(self.graph.arc_name(first), Arc::new(e)))?;

        debug!(
            "Scanned {} dependencies of {}",
            found.len(),
            self.graph.name(first)
        );
        Ok(found.iter().map(|path| self.graph.file(path)).collect())
    }

    /// Called when nothing is ready, nothing is in flight and the walk is
    /// exhausted. Nodes still pending wait for each other: reports the cycles
    /// among them and fails them. Returns `false` if nothing was pending.
    pub(super) fn resolve_stall(&mut self) -> bool {
        let pending: Vec<NodeId> = self
            .graph
            .node_ids()
            .filter(|&id| self.graph.node(id).state == NodeState::Pending)
            .collect();
        if pending.is_empty() {
            return false;
        }

        let graph = &self.graph;
        let cycles = find_cycles(&pending, |id| {
            effective_children(graph, id)
                .into_iter()
                .filter(|&child| graph.node(child).state == NodeState::Pending)
                .collect()
        });

        for cycle in cycles {
            self.record_cycle(cycle);
        }
        for &id in &pending {
            if self.cyclic.contains(&id) {
                self.settle(id, NodeState::Failed);
            }
        }
        self.propagate();

        for id in pending {
            if self.graph.node(id).state == NodeState::Pending {
                let name = self.graph.arc_name(id);
                self.fail(&[id], BuildError::Stalled(name));
            }
        }
        self.propagate();
        true
    }
}

#[cfg(test)]
mod tests {
    use petgraph::graph::NodeIndex;

    use super::*;

    fn ids(raw: &[u32]) -> Vec<NodeId> {
        raw.iter().map(|&i| NodeIndex::new(i as usize)).collect()
    }

    #[test]
    fn test_normalize_cycle() {
        assert_eq!(normalize_cycle(ids(&[3, 1, 2])), ids(&[1, 2, 3]));
        assert_eq!(normalize_cycle(ids(&[1, 2])), ids(&[1, 2]));
        assert_eq!(normalize_cycle(vec![]), vec![]);
    }

    #[test]
    fn test_find_cycles() {
        // 0 -> 1 -> 0, 2 -> 3 -> 4 -> 2, 5 -> 5, 6 -> 0
        let edges: HashMap<NodeId, Vec<NodeId>> = HashMap::from([
            (NodeIndex::new(0), ids(&[1])),
            (NodeIndex::new(1), ids(&[0])),
            (NodeIndex::new(2), ids(&[3])),
            (NodeIndex::new(3), ids(&[4])),
            (NodeIndex::new(4), ids(&[2])),
            (NodeIndex::new(5), ids(&[5])),
            (NodeIndex::new(6), ids(&[0])),
        ]);
        let nodes = ids(&[6, 0, 1, 2, 3, 4, 5]);

        let cycles: HashSet<Vec<NodeId>> = find_cycles(&nodes, |id| edges[&id].clone())
            .into_iter()
            .map(normalize_cycle)
            .collect();

        assert_eq!(
            cycles,
            HashSet::from([ids(&[0, 1]), ids(&[2, 3, 4]), ids(&[5])])
        );
    }
}
