//! Dependency graph: nodes, typed edges and builder invocations.
//!
//! Edges point from a node to what it depends on. Their weights carry a kind
//! and a global sequence number so that `children` reproduces declaration
//! order independently of how `petgraph` stores adjacency lists.

mod node;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;

use camino::Utf8Path;
use petgraph::Direction;
use petgraph::visit::EdgeRef;
use tracing::{debug, warn};

use crate::builder::Builder;
use crate::core::{ArcStr, Blake3Hasher, Hash32};
use crate::decider::Decider;
use crate::error::DeclarationError;
use crate::sig::{SignatureRecord, SignatureStore};

pub use node::{BatchId, Node, NodeId, NodeInfo, NodeKind, NodeState, normalize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeKind {
    Source,
    Depends,
    Implicit,
    /// From the owner to the side effect.
    SideEffect,
}

#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub kind: EdgeKind,
    seq: u32,
}

/// One builder invocation: all of its targets are built by a single task.
#[derive(Debug, Clone)]
pub struct Batch {
    pub builder: Builder,
    pub targets: Vec<NodeId>,
    pub sources: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct Graph {
    pub(crate) graph: petgraph::Graph<Node, Edge>,
    names: HashMap<ArcStr, NodeId>,
    batches: Vec<Batch>,
    seq: u32,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, name: &str, kind: impl FnOnce() -> NodeKind) -> NodeId {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        let name: ArcStr = Arc::from(name);
        let id = self.graph.add_node(Node::new(name.clone(), kind()));
        self.names.insert(name, id);
        id
    }

    /// Returns the file node for `path`, creating it on first use.
    pub fn file(&mut self, path: impl AsRef<Utf8Path>) -> NodeId {
        let path = normalize(path.as_ref());
        self.intern(path.as_str(), || NodeKind::File(path.clone()))
    }

    pub fn dir(&mut self, path: impl AsRef<Utf8Path>) -> NodeId {
        let path = normalize(path.as_ref());
        self.intern(path.as_str(), || NodeKind::Dir(path.clone()))
    }

    pub fn alias(&mut self, name: &str) -> NodeId {
        self.intern(name, || NodeKind::Alias)
    }

    pub fn value(&mut self, name: &str, bytes: impl Into<Arc<[u8]>>) -> NodeId {
        self.intern(name, || NodeKind::Value(bytes.into()))
    }

    pub fn lookup(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.graph[id]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.graph[id]
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.graph[id].name
    }

    pub(crate) fn arc_name(&self, id: NodeId) -> ArcStr {
        self.graph[id].name.clone()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.node_indices()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn batch(&self, id: BatchId) -> &Batch {
        &self.batches[id.0]
    }

    pub fn is_derived(&self, id: NodeId) -> bool {
        self.graph[id].batch.is_some()
    }

    pub fn builder_of(&self, id: NodeId) -> Option<&Builder> {
        self.graph[id].batch.map(|b| &self.batches[b.0].builder)
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) {
        let seq = self.seq;
        self.seq += 1;
        self.graph.add_edge(from, to, Edge { kind, seq });
    }

    fn edges_of(&self, id: NodeId, kinds: &[EdgeKind]) -> Vec<NodeId> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Outgoing)
            .filter(|edge| kinds.contains(&edge.weight().kind))
            .map(|edge| (edge.weight().kind, edge.weight().seq, edge.target()))
            .collect();
        edges.sort_unstable_by_key(|&(kind, seq, _)| (kind, seq));

        let mut seen = HashSet::with_capacity(edges.len());
        edges
            .into_iter()
            .filter_map(|(_, _, target)| seen.insert(target).then_some(target))
            .collect()
    }

    /// Sources, then explicit dependencies, then implicit dependencies, each
    /// in insertion order. Later duplicates are dropped.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.edges_of(
            id,
            &[EdgeKind::Source, EdgeKind::Depends, EdgeKind::Implicit],
        )
    }

    pub fn explicit_children(&self, id: NodeId) -> Vec<NodeId> {
        self.edges_of(id, &[EdgeKind::Source, EdgeKind::Depends])
    }

    pub fn implicit(&self, id: NodeId) -> Vec<NodeId> {
        self.edges_of(id, &[EdgeKind::Implicit])
    }

    /// Nodes that list `id` as a child.
    pub fn parents(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut parents: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .filter(|edge| edge.weight().kind != EdgeKind::SideEffect)
            .map(|edge| (edge.weight().seq, edge.source()))
            .collect();
        parents.sort_unstable_by_key(|&(seq, _)| seq);
        parents
            .into_iter()
            .filter_map(|(_, parent)| seen.insert(parent).then_some(parent))
            .collect()
    }

    pub fn side_effects(&self, owner: NodeId) -> Vec<NodeId> {
        self.edges_of(owner, &[EdgeKind::SideEffect])
    }

    /// Targets that produce `id` as a side effect.
    pub fn side_effect_owners(&self, id: NodeId) -> Vec<NodeId> {
        let mut owners: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Incoming)
            .filter(|edge| edge.weight().kind == EdgeKind::SideEffect)
            .map(|edge| edge.source())
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }

    pub fn is_side_effect(&self, id: NodeId) -> bool {
        self.graph
            .edges_directed(id, Direction::Incoming)
            .any(|edge| edge.weight().kind == EdgeKind::SideEffect)
    }

    /// Side effects of every target of a batch.
    pub fn batch_side_effects(&self, batch: BatchId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.batches[batch.0]
            .targets
            .iter()
            .flat_map(|&target| self.side_effects(target))
            .filter(|&id| seen.insert(id))
            .collect()
    }

    /// Declares that `builder` produces `targets` from `sources`.
    ///
    /// Repeating an equivalent declaration returns the existing batch. A
    /// `multi` builder may repeat a declaration with new sources, which are
    /// appended.
    pub fn declare(
        &mut self,
        builder: Builder,
        targets: &[NodeId],
        sources: &[NodeId],
    ) -> Result<BatchId, DeclarationError> {
        if targets.is_empty() {
            return Err(DeclarationError::NoTargets);
        }

        for &target in targets {
            if self.is_side_effect(target) {
                return Err(DeclarationError::SideEffectIsTarget {
                    node: self.arc_name(target),
                });
            }
        }

        let mut unique_targets = Vec::with_capacity(targets.len());
        for &target in targets {
            if !unique_targets.contains(&target) {
                unique_targets.push(target);
            }
        }

        let Some(existing) = unique_targets.iter().find_map(|&t| self.graph[t].batch) else {
            return Ok(self.new_batch(builder, unique_targets, sources));
        };

        let batch = &self.batches[existing.0];
        let first = unique_targets
            .iter()
            .copied()
            .find(|&t| self.graph[t].batch == Some(existing))
            .unwrap_or(unique_targets[0]);

        if batch.builder.action.signature() != builder.action.signature() {
            return Err(DeclarationError::ConflictingActions {
                target: self.arc_name(first),
                first: batch.builder.action.describe(),
                second: builder.action.describe(),
            });
        }

        let old: HashSet<_> = batch.targets.iter().copied().collect();
        let new: HashSet<_> = unique_targets.iter().copied().collect();
        if old != new {
            let target = unique_targets
                .iter()
                .chain(batch.targets.iter())
                .copied()
                .find(|t| !old.contains(t) || !new.contains(t))
                .unwrap_or(first);
            return Err(DeclarationError::TargetListsCollide {
                target: self.arc_name(target),
            });
        }

        if batch.sources == sources {
            debug!("equivalent declaration for {}", self.name(first));
            return Ok(existing);
        }

        if !(builder.multi && batch.builder.multi) {
            return Err(DeclarationError::MultipleSources {
                target: self.arc_name(first),
            });
        }

        let added: Vec<_> = sources
            .iter()
            .copied()
            .filter(|s| !self.batches[existing.0].sources.contains(s))
            .collect();
        let batch_targets = self.batches[existing.0].targets.clone();
        for &source in &added {
            for &target in &batch_targets {
                self.add_edge(target, source, EdgeKind::Source);
            }
        }
        self.batches[existing.0].sources.extend(added);
        Ok(existing)
    }

    fn new_batch(&mut self, builder: Builder, targets: Vec<NodeId>, sources: &[NodeId]) -> BatchId {
        let id = BatchId(self.batches.len());
        for &target in &targets {
            self.graph[target].batch = Some(id);
            for &source in sources {
                self.add_edge(target, source, EdgeKind::Source);
            }
        }
        self.batches.push(Batch {
            builder,
            targets,
            sources: sources.to_vec(),
        });
        id
    }

    /// Adds explicit dependencies that are not sources.
    pub fn depends(&mut self, target: NodeId, deps: &[NodeId]) {
        for &dep in deps {
            self.add_edge(target, dep, EdgeKind::Depends);
        }
    }

    /// Declares `node` as produced incidentally by the tasks building `owners`.
    pub fn side_effect(&mut self, node: NodeId, owners: &[NodeId]) -> Result<(), DeclarationError> {
        if self.is_derived(node) {
            return Err(DeclarationError::SideEffectIsTarget {
                node: self.arc_name(node),
            });
        }
        for &owner in owners {
            if !self.side_effects(owner).contains(&node) {
                self.add_edge(owner, node, EdgeKind::SideEffect);
            }
        }
        Ok(())
    }

    /// Replaces the implicit dependencies of `id` with `deps`.
    pub fn add_implicit(&mut self, id: NodeId, deps: &[NodeId]) {
        let mut stale: Vec<_> = self
            .graph
            .edges_directed(id, Direction::Outgoing)
            .filter(|edge| edge.weight().kind == EdgeKind::Implicit)
            .map(|edge| edge.id())
            .collect();

        // Removal swaps the last edge into the hole, so go from the back.
        stale.sort_unstable_by(|a, b| b.cmp(a));
        for edge in stale {
            self.graph.remove_edge(edge);
        }

        for &dep in deps {
            if dep != id {
                self.add_edge(id, dep, EdgeKind::Implicit);
            }
        }
        self.graph[id].invalidate();
    }

    pub fn set_decider(&mut self, id: NodeId, decider: Decider) {
        self.graph[id].decider = Some(decider);
    }

    /// Always rebuild `id`, regardless of its dependencies.
    pub fn always_build(&mut self, id: NodeId) {
        self.graph[id].always_build = true;
    }

    /// Keep the old file in place while `id` is rebuilt.
    pub fn precious(&mut self, id: NodeId) {
        self.graph[id].precious = true;
    }

    /// Never push `id` to or retrieve it from the build cache.
    pub fn no_cache(&mut self, id: NodeId) {
        self.graph[id].no_cache = true;
    }

    /// Content signature of a node, computed at most once per round.
    ///
    /// With the hybrid decider a stored record whose timestamp and size match
    /// the file is trusted instead of hashing. Fresh hashes of source files
    /// are written back so the next run can skip them.
    pub fn csig(&self, id: NodeId, store: &SignatureStore, default: Decider) -> Option<Hash32> {
        let node = &self.graph[id];
        *node.csig.get_or_init(|| self.compute_csig(id, store, default))
    }

    fn compute_csig(&self, id: NodeId, store: &SignatureStore, default: Decider) -> Option<Hash32> {
        let node = &self.graph[id];
        let info = node.info();

        match &node.kind {
            NodeKind::Value(bytes) => Some(Hash32::hash(bytes)),
            NodeKind::Alias => {
                let mut hasher = Blake3Hasher::new();
                for child in self.children(id) {
                    hasher.field(self.name(child));
                    match self.csig(child, store, default) {
                        Some(csig) => hasher.field(csig.as_bytes()),
                        None => hasher.field([]),
                    };
                }
                Some(hasher.finish32())
            }
            NodeKind::Dir(path) => {
                if !info.exists {
                    return None;
                }
                let mut names: Vec<_> = fs::read_dir(path)
                    .ok()?
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .collect();
                names.sort_unstable();

                let mut hasher = Blake3Hasher::new();
                for name in &names {
                    hasher.field(name);
                }
                Some(hasher.finish32())
            }
            NodeKind::File(path) => {
                if !info.exists {
                    return None;
                }

                let record = store.get(&node.name);
                if node.decider(default) == Decider::ContentTimestamp
                    && let Some(record) = &record
                    && record.csig.is_some()
                    && record.timestamp == info.timestamp
                    && record.size == info.size
                {
                    return record.csig;
                }

                let csig = info.file_csig(path).unwrap_or_else(|e| {
                    warn!("couldn't hash {path}: {e}");
                    None
                });

                if !node.is_derived() {
                    store.put(
                        &node.name,
                        SignatureRecord::source(csig, info.timestamp, info.size),
                    );
                }
                csig
            }
        }
    }
}
