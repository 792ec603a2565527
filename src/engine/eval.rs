use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::time::SystemTime;

use serde::Serialize;

use crate::core::{Blake3Hasher, Hash32};
use crate::decider::{Decider, Observed};
use crate::graph::{BatchId, Graph, NodeId, NodeKind};
use crate::sig::{DepRecord, SignatureRecord, SignatureStore};

/// Why a target has to be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "node", rename_all = "snake_case")]
pub enum Reason {
    NoRecord,
    TargetMissing,
    TargetChanged,
    AlwaysBuild,
    ActionChanged,
    ChildChanged(String),
    ChildAdded(String),
    ChildRemoved(String),
    SignatureChanged,
}

impl Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::NoRecord => f.write_str("it has never been built"),
            Reason::TargetMissing => f.write_str("it does not exist"),
            Reason::TargetChanged => f.write_str("it changed since it was last built"),
            Reason::AlwaysBuild => f.write_str("it is always built"),
            Reason::ActionChanged => f.write_str("its build action changed"),
            Reason::ChildChanged(name) => write!(f, "'{name}' changed"),
            Reason::ChildAdded(name) => write!(f, "'{name}' is a new dependency"),
            Reason::ChildRemoved(name) => write!(f, "'{name}' is no longer a dependency"),
            Reason::SignatureChanged => f.write_str("its build signature changed"),
        }
    }
}

/// A node as seen by a [`Decider`], reading through the graph.
pub(crate) struct Current<'a> {
    pub(crate) graph: &'a Graph,
    pub(crate) store: &'a SignatureStore,
    pub(crate) id: NodeId,
    pub(crate) default: Decider,
}

impl Observed for Current<'_> {
    fn timestamp(&self) -> Option<SystemTime> {
        self.graph.node(self.id).info().timestamp
    }

    fn size(&self) -> Option<u64> {
        self.graph.node(self.id).info().size
    }

    fn csig(&self) -> Option<Hash32> {
        self.graph.csig(self.id, self.store, self.default)
    }
}

/// Children a node has to wait for: the union of the children of every
/// target in its batch, plus the owners of a side effect.
pub(crate) fn effective_children(graph: &Graph, id: NodeId) -> Vec<NodeId> {
    let node = graph.node(id);

    let mut children = match node.batch() {
        Some(batch) => {
            let targets = &graph.batch(batch).targets;
            let mut seen = HashSet::new();
            targets
                .iter()
                .flat_map(|&target| graph.children(target))
                .filter(|child| !targets.contains(child))
                .filter(|&child| seen.insert(child))
                .collect()
        }
        None => graph.children(id),
    };

    for owner in graph.side_effect_owners(id) {
        if !children.contains(&owner) {
            children.push(owner);
        }
    }
    children
}

/// Explicit children of the whole batch, used to decide whether cached
/// implicit dependencies can be trusted.
fn explicit_children(graph: &Graph, batch: BatchId) -> Vec<NodeId> {
    let targets = &graph.batch(batch).targets;
    let mut seen = HashSet::new();
    targets
        .iter()
        .flat_map(|&target| graph.explicit_children(target))
        .filter(|child| !targets.contains(child))
        .filter(|&child| seen.insert(child))
        .collect()
}

fn observe(graph: &Graph, store: &SignatureStore, id: NodeId, default: Decider) -> DepRecord {
    let node = graph.node(id);
    let decider = node.decider(default);
    let info = node.info();
    DepRecord {
        name: node.name().to_string(),
        csig: (decider.uses_content() || info.timestamp.is_none())
            .then(|| graph.csig(id, store, default))
            .flatten(),
        timestamp: info.timestamp,
        size: info.size,
    }
}

pub(crate) struct Evaluation {
    pub(crate) action_sig: Hash32,
    pub(crate) bsig: Hash32,
    /// Current state of every child, in `effective_children` order.
    pub(crate) children: Vec<DepRecord>,
    pub(crate) reasons: Vec<(NodeId, Reason)>,
}

impl Evaluation {
    pub(crate) fn is_stale(&self) -> bool {
        !self.reasons.is_empty()
    }
}

/// Decides whether the targets of `batch` are up to date. All children must
/// already be built or up to date.
pub(crate) fn evaluate(
    graph: &Graph,
    store: &SignatureStore,
    default: Decider,
    batch: BatchId,
) -> Evaluation {
    let info = graph.batch(batch);
    let action_sig = info.builder.action.signature();
    let children = effective_children(graph, info.targets[0]);

    let mut hasher = Blake3Hasher::new();
    hasher.field(action_sig.as_bytes());
    for &child in &children {
        let current = Current {
            graph,
            store,
            id: child,
            default,
        };
        hasher.field(graph.name(child));
        graph.node(child).decider(default).stamp(&mut hasher, &current);
    }
    let bsig = hasher.finish32();

    let mut reasons = Vec::new();
    for &target in &info.targets {
        for reason in target_reasons(graph, store, default, target, &children, action_sig, bsig) {
            reasons.push((target, reason));
        }
    }

    Evaluation {
        action_sig,
        bsig,
        children: children
            .iter()
            .map(|&child| observe(graph, store, child, default))
            .collect(),
        reasons,
    }
}

fn target_reasons(
    graph: &Graph,
    store: &SignatureStore,
    default: Decider,
    target: NodeId,
    children: &[NodeId],
    action_sig: Hash32,
    bsig: Hash32,
) -> Vec<Reason> {
    let node = graph.node(target);
    let mut reasons = Vec::new();

    if node.always_build {
        reasons.push(Reason::AlwaysBuild);
    }
    if matches!(node.kind(), NodeKind::File(_) | NodeKind::Dir(_)) && !node.exists() {
        reasons.push(Reason::TargetMissing);
    }

    let record = match store.get(node.name()) {
        Some(record) if record.is_derived() => record,
        _ => {
            reasons.push(Reason::NoRecord);
            return reasons;
        }
    };

    if record.action_sig != Some(action_sig) {
        reasons.push(Reason::ActionChanged);
    }
    if target_changed(graph, store, default, target, &record) {
        reasons.push(Reason::TargetChanged);
    }

    reasons.extend(child_reasons(graph, store, default, children, &record));

    if reasons.is_empty() && record.bsig != Some(bsig) {
        reasons.push(Reason::SignatureChanged);
    }
    reasons
}

/// A file target that is not what the last successful build left behind,
/// e.g. the output of a failed rebuild.
fn target_changed(
    graph: &Graph,
    store: &SignatureStore,
    default: Decider,
    target: NodeId,
    record: &SignatureRecord,
) -> bool {
    let node = graph.node(target);
    if !matches!(node.kind(), NodeKind::File(_)) || !node.exists() {
        return false;
    }

    let built = DepRecord {
        name: node.name().to_string(),
        csig: record.csig,
        timestamp: record.timestamp,
        size: record.size,
    };
    let current = Current {
        graph,
        store,
        id: target,
        default,
    };
    node.decider(default).changed(&current, Some(&built))
}

fn child_reasons(
    graph: &Graph,
    store: &SignatureStore,
    default: Decider,
    children: &[NodeId],
    record: &SignatureRecord,
) -> Vec<Reason> {
    let previous: HashMap<&str, &DepRecord> = record
        .children
        .iter()
        .map(|dep| (dep.name.as_str(), dep))
        .collect();

    let mut reasons = Vec::new();
    for &child in children {
        let name = graph.name(child);
        let Some(&dep) = previous.get(name) else {
            reasons.push(Reason::ChildAdded(name.to_string()));
            continue;
        };

        let current = Current {
            graph,
            store,
            id: child,
            default,
        };
        if graph.node(child).decider(default).changed(&current, Some(dep)) {
            reasons.push(Reason::ChildChanged(name.to_string()));
        }
    }

    let current: HashSet<&str> = children.iter().map(|&child| graph.name(child)).collect();
    for dep in &record.children {
        if !current.contains(dep.name.as_str()) {
            reasons.push(Reason::ChildRemoved(dep.name.clone()));
        }
    }
    reasons
}

/// Returns `true` if no explicit child of `batch` changed since `record` was
/// written, so the implicit dependencies it lists are still valid.
pub(crate) fn explicit_unchanged(
    graph: &Graph,
    store: &SignatureStore,
    default: Decider,
    batch: BatchId,
    record: &SignatureRecord,
) -> bool {
    explicit_children(graph, batch).into_iter().all(|child| {
        let current = Current {
            graph,
            store,
            id: child,
            default,
        };
        let dep = record.child(graph.name(child));
        dep.is_some() && !graph.node(child).decider(default).changed(&current, dep)
    })
}
