use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::builder::{Action, ActionContext};
use crate::cache::CacheDir;
use crate::core::{ArcStr, Hash32};
use crate::engine::TaskExecution;
use crate::error::BuildError;
use crate::graph::{BatchId, Graph, NodeId, NodeInfo, NodeKind};
use crate::sig::{DepRecord, SignatureRecord, SignatureStore};

/// Nodes currently being built, shared by every task of a build.
#[derive(Debug, Default)]
pub(crate) struct Claims(Mutex<HashSet<ArcStr>>);

impl Claims {
    /// Claims all of `names` or none of them.
    fn claim(&self, names: &[ArcStr]) -> Result<(), BuildError> {
        let mut claimed = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(name) = names.iter().find(|name| claimed.contains(*name)) {
            return Err(BuildError::AlreadyBuilding(name.clone()));
        }
        claimed.extend(names.iter().cloned());
        Ok(())
    }

    fn release(&self, names: &[ArcStr]) {
        let mut claimed = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        for name in names {
            claimed.remove(name);
        }
    }
}

/// Shared resources a task needs while it runs on a worker.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub(crate) store: Arc<SignatureStore>,
    pub(crate) cache: Option<Arc<CacheDir>>,
    pub(crate) claims: Arc<Claims>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Created,
    Preparing,
    Ready,
    Executing,
    Executed,
    Failed,
    Finalized,
}

/// How a task ended.
#[derive(Debug, Clone)]
pub enum Outcome {
    Executed,
    /// All targets were restored from the cache, the action did not run.
    Retrieved,
    Failed(BuildError),
}

#[derive(Debug, Clone)]
pub(crate) struct TaskNode {
    pub(crate) id: NodeId,
    pub(crate) name: ArcStr,
    /// Handed to the action.
    pub(crate) path: Utf8PathBuf,
    /// Files are checked, removed and cached; directories and virtual nodes
    /// are not.
    pub(crate) file: bool,
    pub(crate) precious: bool,
    pub(crate) no_cache: bool,
}

impl TaskNode {
    fn new(graph: &Graph, id: NodeId) -> Self {
        let node = graph.node(id);
        Self {
            id,
            name: graph.arc_name(id),
            path: node.action_path(),
            file: matches!(node.kind(), NodeKind::File(_)),
            precious: node.precious,
            no_cache: node.no_cache,
        }
    }
}

/// All targets of one builder invocation, built together.
#[derive(Debug)]
pub struct Task {
    pub(crate) batch: BatchId,
    pub(crate) targets: Vec<TaskNode>,
    pub(crate) side_effects: Vec<TaskNode>,
    sources: Vec<Utf8PathBuf>,
    action: Arc<Action>,
    action_sig: Hash32,
    bsig: Hash32,
    children: Vec<DepRecord>,
    implicit: Option<Vec<String>>,
    stage: Stage,
    retrieved: bool,
    claimed: bool,
    pub(crate) execution: Option<TaskExecution>,
}

impl Task {
    pub(crate) fn new(
        graph: &Graph,
        batch: BatchId,
        action_sig: Hash32,
        bsig: Hash32,
        children: Vec<DepRecord>,
    ) -> Self {
        let info = graph.batch(batch);
        let first = info.targets[0];

        let implicit = info.builder.scanner.as_ref().map(|_| {
            graph
                .implicit(first)
                .into_iter()
                .map(|id| graph.name(id).to_string())
                .collect()
        });

        Self {
            batch,
            targets: info
                .targets
                .iter()
                .map(|&id| TaskNode::new(graph, id))
                .collect(),
            side_effects: graph
                .batch_side_effects(batch)
                .into_iter()
                .map(|id| TaskNode::new(graph, id))
                .collect(),
            sources: info
                .sources
                .iter()
                .map(|&id| graph.node(id).action_path())
                .collect(),
            action: info.builder.action.clone(),
            action_sig,
            bsig,
            children,
            implicit,
            stage: Stage::Created,
            retrieved: false,
            claimed: false,
            execution: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|node| &*node.name)
    }

    pub fn bsig(&self) -> Hash32 {
        self.bsig
    }

    pub fn is_retrieved(&self) -> bool {
        self.retrieved
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.targets
            .iter()
            .chain(self.side_effects.iter())
            .map(|node| node.id)
    }

    fn claim_names(&self) -> Vec<ArcStr> {
        self.targets
            .iter()
            .chain(self.side_effects.iter())
            .map(|node| node.name.clone())
            .collect()
    }

    fn target_paths(&self) -> Vec<Utf8PathBuf> {
        self.targets.iter().map(|node| node.path.clone()).collect()
    }

    /// The command line or function call this task stands for.
    pub fn describe(&self) -> String {
        let targets = self.target_paths();
        self.action.describe_for(&ActionContext {
            targets: &targets,
            sources: &self.sources,
        })
    }

    fn cacheable(&self) -> bool {
        self.targets.iter().all(|node| node.file && !node.no_cache)
    }

    /// Claims the targets, clears the way for the action and tries the cache.
    pub fn prepare(&mut self, ctx: &TaskContext) -> Result<(), BuildError> {
        self.stage = Stage::Preparing;

        ctx.claims.claim(&self.claim_names())?;
        self.claimed = true;

        for node in &self.targets {
            if !node.file {
                continue;
            }
            if let Some(parent) = node.path.parent()
                && !parent.as_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .map_err(|e| BuildError::io(format!("couldn't create {parent}"), e))?;
            }
            if !node.precious {
                remove(&node.path)?;
            }
        }

        for node in &self.side_effects {
            if node.file {
                remove(&node.path)?;
            }
        }

        if let Some(cache) = &ctx.cache
            && self.cacheable()
        {
            self.retrieved = self.retrieve(cache);
        }

        self.stage = Stage::Ready;
        Ok(())
    }

    fn retrieve(&self, cache: &CacheDir) -> bool {
        for node in &self.targets {
            let key = CacheDir::key(self.bsig, &node.name);
            match cache.retrieve(key, &node.path) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!("{e}; building {} instead", node.name);
                    return false;
                }
            }
        }

        if cache.show() {
            info!("{}", self.describe());
        } else {
            info!(
                "Retrieved `{}` from cache",
                self.targets().collect::<Vec<_>>().join("`, `")
            );
        }
        true
    }

    /// Runs the action unless the targets came from the cache.
    pub fn execute(&mut self) -> Result<(), BuildError> {
        if self.retrieved {
            self.stage = Stage::Executed;
            return Ok(());
        }
        self.stage = Stage::Executing;

        let targets = self.target_paths();
        let ctx = ActionContext {
            targets: &targets,
            sources: &self.sources,
        };

        let result = match self.action.execute(&ctx) {
            Ok(0) => self.check_targets(),
            Ok(status) => Err(BuildError::Action { status }),
            Err(e) => Err(BuildError::ActionFailed(Arc::new(e))),
        };

        self.stage = match result {
            Ok(()) => Stage::Executed,
            Err(_) => Stage::Failed,
        };
        result
    }

    fn check_targets(&self) -> Result<(), BuildError> {
        let missing: Vec<_> = self
            .targets
            .iter()
            .filter(|node| node.file && fs::symlink_metadata(&node.path).is_err())
            .map(|node| node.name.clone())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BuildError::MissingTargets(missing))
        }
    }

    /// Records signatures and fills the cache after a successful build.
    /// Records of a failed build are left alone. Claims are always released.
    pub fn finalize(&mut self, ctx: &TaskContext, success: bool) {
        if success {
            self.record(ctx);
        }

        if self.claimed {
            ctx.claims.release(&self.claim_names());
            self.claimed = false;
        }
        self.stage = Stage::Finalized;
    }

    fn record(&self, ctx: &TaskContext) {
        let action = self.describe();

        for node in &self.targets {
            let (info, csig) = stat(node);
            ctx.store.put(
                &node.name,
                SignatureRecord {
                    csig,
                    bsig: Some(self.bsig),
                    timestamp: info.timestamp,
                    size: info.size,
                    children: self.children.clone(),
                    action_sig: Some(self.action_sig),
                    action: Some(action.clone()),
                    implicit: self.implicit.clone(),
                },
            );
        }

        for node in &self.side_effects {
            let (info, csig) = stat(node);
            if info.exists {
                ctx.store.put(
                    &node.name,
                    SignatureRecord::source(csig, info.timestamp, info.size),
                );
            }
        }

        if let Some(cache) = &ctx.cache
            && !self.retrieved
            && self.cacheable()
        {
            for node in &self.targets {
                cache.push_quietly(CacheDir::key(self.bsig, &node.name), &node.path);
            }
        }
    }

    /// Prepares, executes and finalizes the task. Panics of the action are
    /// caught and reported as failures.
    pub fn run(&mut self, ctx: &TaskContext) -> Outcome {
        let start = Instant::now();

        let result = self.prepare(ctx).and_then(|()| {
            match panic::catch_unwind(AssertUnwindSafe(|| self.execute())) {
                Ok(result) => result,
                Err(payload) => Err(BuildError::Panic(panic_message(payload))),
            }
        });

        if result.is_err() {
            self.stage = Stage::Failed;
        }
        self.finalize(ctx, result.is_ok());

        self.execution = Some(TaskExecution {
            start,
            duration: start.elapsed(),
        });

        match result {
            Ok(()) if self.retrieved => Outcome::Retrieved,
            Ok(()) => Outcome::Executed,
            Err(e) => {
                debug!("task for {} failed: {e}", self.targets[0].name);
                Outcome::Failed(e)
            }
        }
    }
}

fn stat(node: &TaskNode) -> (NodeInfo, Option<Hash32>) {
    if !node.file {
        return (NodeInfo::virtual_node(), None);
    }
    let info = NodeInfo::stat(&node.path);
    let csig = info.file_csig(&node.path).unwrap_or_else(|e| {
        warn!("couldn't hash {}: {e}", node.path);
        None
    });
    (info, csig)
}

fn remove(path: &Utf8Path) -> Result<(), BuildError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::io(format!("couldn't remove {path}"), e)),
        },
        Err(_) => Ok(()),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::builder::Builder;
    use crate::config::CacheConfig;

    struct Fixture {
        _guard: tempfile::TempDir,
        root: Utf8PathBuf,
        graph: Graph,
        ctx: TaskContext,
    }

    fn fixture(cache: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cache = cache.then(|| {
            Arc::new(CacheDir::new(&CacheConfig {
                dir: root.join("cache"),
                readonly: false,
                show: false,
            }))
        });
        Fixture {
            _guard: dir,
            root,
            graph: Graph::new(),
            ctx: TaskContext {
                store: Arc::new(SignatureStore::memory()),
                cache,
                claims: Arc::new(Claims::default()),
            },
        }
    }

    fn task(graph: &Graph, batch: BatchId) -> Task {
        Task::new(graph, batch, Hash32::hash("action"), Hash32::hash("bsig"), vec![])
    }

    fn write_targets(contents: &'static str) -> Action {
        Action::function("write", move |ctx: &ActionContext| {
            for target in ctx.targets {
                fs::write(target, contents)?;
            }
            Ok(0)
        })
    }

    #[test]
    fn test_success_records_every_target() {
        let mut f = fixture(false);
        let a = f.graph.file(f.root.join("out/a"));
        let b = f.graph.file(f.root.join("out/b"));
        let batch = f
            .graph
            .declare(Builder::new("w", write_targets("x")), &[a, b], &[])
            .unwrap();

        let mut task = task(&f.graph, batch);
        assert_matches!(task.run(&f.ctx), Outcome::Executed);
        assert_eq!(task.stage(), Stage::Finalized);

        for id in [a, b] {
            let record = f.ctx.store.get(f.graph.name(id)).unwrap();
            assert_eq!(record.bsig, Some(Hash32::hash("bsig")));
            assert_eq!(record.csig, Some(Hash32::hash("x")));
        }
    }

    #[test]
    fn test_partial_output_fails_without_records() {
        let mut f = fixture(false);
        let a = f.graph.file(f.root.join("a"));
        let b = f.graph.file(f.root.join("b"));
        let only_a = Action::function("only-a", |ctx: &ActionContext| {
            fs::write(&ctx.targets[0], "a")?;
            Ok(0)
        });
        let batch = f
            .graph
            .declare(Builder::new("w", only_a), &[a, b], &[])
            .unwrap();

        let mut task = task(&f.graph, batch);
        assert_matches!(
            task.run(&f.ctx),
            Outcome::Failed(BuildError::MissingTargets(missing)) if missing.len() == 1
        );
        assert!(f.ctx.store.get(f.graph.name(a)).is_none());
        assert!(f.ctx.store.get(f.graph.name(b)).is_none());
    }

    #[test]
    fn test_status_and_error() {
        let mut f = fixture(false);
        let a = f.graph.file(f.root.join("a"));
        let b = f.graph.file(f.root.join("b"));
        let status = f
            .graph
            .declare(Builder::new("s", Action::function("s", |_| Ok(7))), &[a], &[])
            .unwrap();
        let error = f
            .graph
            .declare(
                Builder::new("e", Action::function("e", |_| anyhow::bail!("boom"))),
                &[b],
                &[],
            )
            .unwrap();

        assert_matches!(
            task(&f.graph, status).run(&f.ctx),
            Outcome::Failed(BuildError::Action { status: 7 })
        );
        assert_matches!(
            task(&f.graph, error).run(&f.ctx),
            Outcome::Failed(BuildError::ActionFailed(_))
        );
    }

    #[test]
    fn test_panic_is_caught() {
        let mut f = fixture(false);
        let a = f.graph.file(f.root.join("a"));
        let batch = f
            .graph
            .declare(
                Builder::new("p", Action::function("p", |_| panic!("oh no"))),
                &[a],
                &[],
            )
            .unwrap();

        let mut task = task(&f.graph, batch);
        assert_matches!(
            task.run(&f.ctx),
            Outcome::Failed(BuildError::Panic(msg)) if msg.contains("oh no")
        );
        // Claims are released even after a panic.
        assert!(f.ctx.claims.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_double_claim() {
        let mut f = fixture(false);
        let a = f.graph.file(f.root.join("a"));
        let batch = f
            .graph
            .declare(Builder::new("w", write_targets("x")), &[a], &[])
            .unwrap();

        let mut first = task(&f.graph, batch);
        let mut second = task(&f.graph, batch);
        first.prepare(&f.ctx).unwrap();
        assert_matches!(
            second.prepare(&f.ctx),
            Err(BuildError::AlreadyBuilding(name)) if name == first.targets[0].name
        );

        first.finalize(&f.ctx, false);
        second.prepare(&f.ctx).unwrap();
    }

    #[test]
    fn test_removes_stale_target_unless_precious() {
        let mut f = fixture(false);
        let a = f.graph.file(f.root.join("a"));
        let keep = f.graph.file(f.root.join("keep"));
        fs::write(f.root.join("a"), "old").unwrap();
        fs::write(f.root.join("keep"), "old").unwrap();
        f.graph.precious(keep);

        let noop = || Builder::new("noop", Action::function("noop", |_| Ok(0)));
        let batch_a = f.graph.declare(noop(), &[a], &[]).unwrap();
        let batch_keep = f.graph.declare(noop(), &[keep], &[]).unwrap();

        // The action writes nothing: the removed target is reported missing,
        // the precious one is still there.
        assert_matches!(
            task(&f.graph, batch_a).run(&f.ctx),
            Outcome::Failed(BuildError::MissingTargets(_))
        );
        assert_matches!(task(&f.graph, batch_keep).run(&f.ctx), Outcome::Executed);
        assert!(f.root.join("keep").exists());
    }

    #[test]
    fn test_cache_retrieval_skips_action() {
        let mut f = fixture(true);
        let a = f.graph.file(f.root.join("a"));
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = counter.clone();
        let action = Action::function("count", move |ctx: &ActionContext| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            fs::write(&ctx.targets[0], "payload")?;
            Ok(0)
        });
        let batch = f.graph.declare(Builder::new("c", action), &[a], &[]).unwrap();

        assert_matches!(task(&f.graph, batch).run(&f.ctx), Outcome::Executed);
        fs::remove_file(f.root.join("a")).unwrap();

        let mut again = task(&f.graph, batch);
        assert_matches!(again.run(&f.ctx), Outcome::Retrieved);
        assert!(again.is_retrieved());
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(fs::read_to_string(f.root.join("a")).unwrap(), "payload");
    }
}
