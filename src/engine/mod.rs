//! Scheduling of build tasks.
//!
//! The [`Taskmaster`] walks the dependency graph from a set of roots, decides
//! which batches are stale and hands them out as [`Task`]s. Whoever executes
//! the tasks reports back through [`Taskmaster::mark_done`], which unblocks
//! the dependents. [`run`] drives the whole loop on a thread pool.

mod eval;
mod report;
mod runner;
mod task;
mod walk;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::cache::CacheDir;
use crate::config::Config;
use crate::error::BuildError;
use crate::graph::{Graph, NodeId, NodeState};
use crate::sig::SignatureStore;

pub use eval::Reason;
pub use report::{BuildReport, Failure, Skipped, TaskExecution};
pub use runner::run;
pub use task::{Outcome, Stage, Task, TaskContext};

pub(crate) use eval::evaluate;
pub(crate) use task::Claims;

use walk::Frame;

pub struct Taskmaster {
    graph: Graph,
    config: Config,
    store: Arc<SignatureStore>,
    cache: Option<Arc<CacheDir>>,
    claims: Arc<Claims>,
    /// Nodes the walk starts from, in order.
    roots: VecDeque<NodeId>,
    stack: Vec<Frame>,
    /// Position of every node on the open walk path.
    on_path: HashMap<NodeId, usize>,
    ready: VecDeque<Task>,
    /// Ready tasks that share a node with a task in flight.
    deferred: Vec<Task>,
    /// Targets and side effects of the tasks in flight.
    busy: HashSet<NodeId>,
    in_flight: usize,
    /// Nodes waiting for the key to settle.
    waiters: HashMap<NodeId, Vec<NodeId>>,
    /// Nodes that reached a terminal state but whose waiters weren't told yet.
    settled: Vec<NodeId>,
    cyclic: HashSet<NodeId>,
    seen_cycles: HashSet<Vec<NodeId>>,
    report: BuildReport,
    stopped: bool,
}

impl Taskmaster {
    /// Creates a taskmaster building `targets`, with the signature store
    /// described by the configuration. Without targets, every node is built.
    pub fn new(graph: Graph, config: Config, targets: &[NodeId]) -> Self {
        let store = Arc::new(SignatureStore::open(config.signatures.clone()));
        Self::with_store(graph, config, store, targets)
    }

    pub fn with_store(
        graph: Graph,
        config: Config,
        store: Arc<SignatureStore>,
        targets: &[NodeId],
    ) -> Self {
        let cache = config
            .cache
            .as_ref()
            .map(|cache| Arc::new(CacheDir::new(cache)));

        let mut tm = Self {
            graph,
            config,
            store,
            cache,
            claims: Arc::new(Claims::default()),
            roots: VecDeque::new(),
            stack: Vec::new(),
            on_path: HashMap::new(),
            ready: VecDeque::new(),
            deferred: Vec::new(),
            busy: HashSet::new(),
            in_flight: 0,
            waiters: HashMap::new(),
            settled: Vec::new(),
            cyclic: HashSet::new(),
            seen_cycles: HashSet::new(),
            report: BuildReport::default(),
            stopped: false,
        };
        tm.roots = tm.default_roots(targets);
        tm
    }

    fn default_roots(&self, targets: &[NodeId]) -> VecDeque<NodeId> {
        if !targets.is_empty() {
            return targets.iter().copied().collect();
        }
        self.graph.node_ids().collect()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable access to the graph, for declaring more nodes between rounds.
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    pub fn store(&self) -> &Arc<SignatureStore> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<CacheDir>> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resources shared with the tasks handed out by this taskmaster.
    pub fn context(&self) -> TaskContext {
        TaskContext {
            store: self.store.clone(),
            cache: self.cache.clone(),
            claims: self.claims.clone(),
        }
    }

    pub fn report(&self) -> &BuildReport {
        &self.report
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Nothing left to hand out or wait for.
    pub fn is_finished(&self) -> bool {
        self.in_flight == 0
            && self.ready.is_empty()
            && self.deferred.is_empty()
            && self.stack.is_empty()
            && self.roots.is_empty()
    }

    /// Starts a new round over the same graph. Every node is walked and
    /// decided again, signatures recorded by earlier rounds are kept.
    pub fn restart(&mut self, targets: &[NodeId]) {
        if self.in_flight > 0 {
            warn!("restarting with {} tasks still in flight", self.in_flight);
        }

        let ids: Vec<_> = self.graph.node_ids().collect();
        for id in ids {
            let node = self.graph.node_mut(id);
            node.state = NodeState::Unvisited;
            node.waiting = 0;
            node.scanned = false;
            node.invalidate();
        }

        self.roots = self.default_roots(targets);
        self.stack.clear();
        self.on_path.clear();
        self.ready.clear();
        self.deferred.clear();
        self.busy.clear();
        self.in_flight = 0;
        self.waiters.clear();
        self.settled.clear();
        self.cyclic.clear();
        self.seen_cycles.clear();
        self.report = BuildReport::default();
        self.stopped = false;
    }

    /// Returns the next task whose prerequisites are all built or up to
    /// date. `None` means nothing can be handed out right now: the build is
    /// finished or stopped, or every remaining task waits for one in flight.
    pub fn next_task(&mut self) -> Option<Task> {
        loop {
            if self.stopped {
                return None;
            }

            self.fill();
            if let Some(task) = self.pop_ready() {
                self.in_flight += 1;
                self.busy.extend(task.nodes());
                return Some(task);
            }

            if self.in_flight > 0 {
                return None;
            }
            if !self.deferred.is_empty() {
                self.ready.extend(self.deferred.drain(..));
                continue;
            }
            if !self.resolve_stall() {
                return None;
            }
        }
    }

    fn pop_ready(&mut self) -> Option<Task> {
        while let Some(task) = self.ready.pop_front() {
            if task.nodes().any(|id| self.busy.contains(&id)) {
                self.deferred.push(task);
                continue;
            }
            return Some(task);
        }
        None
    }

    /// Records the outcome of a task handed out by [`next_task`](Self::next_task).
    pub fn mark_done(&mut self, mut task: Task, outcome: Outcome) {
        self.in_flight = self.in_flight.saturating_sub(1);
        for id in task.nodes() {
            self.busy.remove(&id);
        }

        if let Some(execution) = task.execution.take() {
            self.report
                .execution_times
                .insert(task.targets[0].name.to_string(), execution);
        }

        let targets: Vec<NodeId> = task.targets.iter().map(|node| node.id).collect();
        match outcome {
            Outcome::Executed | Outcome::Retrieved => {
                let names = task.targets.iter().map(|node| node.name.to_string());
                if matches!(outcome, Outcome::Retrieved) {
                    self.report.retrieved.extend(names);
                } else {
                    self.report.executed.extend(names);
                }

                for &id in &targets {
                    let node = self.graph.node_mut(id);
                    node.invalidate();
                    node.state = NodeState::Built;
                    self.settled.push(id);
                }
                for side_effect in &task.side_effects {
                    self.graph.node_mut(side_effect.id).invalidate();
                }
            }
            Outcome::Failed(error) => self.fail(&targets, error),
        }

        self.propagate();

        for task in self.deferred.drain(..).rev() {
            self.ready.push_front(task);
        }
    }

    /// Fails `targets` with `error`. Without `keep_going` no further tasks
    /// are handed out.
    fn fail(&mut self, targets: &[NodeId], error: BuildError) {
        let names: Vec<String> = targets
            .iter()
            .map(|&id| self.graph.name(id).to_string())
            .collect();
        error!("{}: {error}", names.join(", "));

        for &id in targets {
            let node = self.graph.node_mut(id);
            node.invalidate();
            node.state = NodeState::Failed;
            self.settled.push(id);
        }
        self.report.failures.push(Failure {
            targets: names,
            error,
        });

        if !self.config.keep_going {
            self.stop();
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            info!("Stopping after the first failure, waiting for running tasks");
            self.stopped = true;
        }
    }

    /// Saves the signatures and returns the report of this round.
    pub fn finish(&mut self) -> BuildReport {
        if let Err(e) = self.store.flush() {
            warn!("Couldn't save signatures: {e}");
        }

        if let Some(cache) = &self.cache {
            let counts = cache.stats().counts();
            info!(
                "Cache: {} hits, {} misses, {} pushed, {} failed",
                counts.hits, counts.misses, counts.pushes, counts.failures
            );
            self.report.cache = Some(counts);
        }

        self.report.stopped_early = self.stopped;
        std::mem::take(&mut self.report)
    }
}
