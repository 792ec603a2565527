use std::fs;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::core::{ArcStr, Hash32};
use crate::decider::Decider;

pub type NodeId = NodeIndex;

/// Index of a builder invocation in [`Graph`](super::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub(crate) usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File(Utf8PathBuf),
    Dir(Utf8PathBuf),
    /// A name for a group of nodes, never present on disk.
    Alias,
    /// An in-memory value, its content signature is the hash of the bytes.
    Value(Arc<[u8]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Unvisited,
    Pending,
    UpToDate,
    Building,
    Built,
    Failed,
}

impl NodeState {
    /// Built or found up to date, dependents may proceed.
    pub fn is_done(self) -> bool {
        matches!(self, NodeState::UpToDate | NodeState::Built)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::UpToDate | NodeState::Built | NodeState::Failed
        )
    }
}

/// File system facts about a node, read at most once per round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub exists: bool,
    pub timestamp: Option<SystemTime>,
    pub size: Option<u64>,
    /// Set for symbolic links, whose content is the link text.
    pub link: Option<Utf8PathBuf>,
}

impl NodeInfo {
    pub(crate) fn stat(path: &Utf8Path) -> Self {
        let Ok(meta) = fs::symlink_metadata(path) else {
            return Self::default();
        };

        let link = if meta.file_type().is_symlink() {
            fs::read_link(path)
                .ok()
                .and_then(|link| Utf8PathBuf::from_path_buf(link).ok())
        } else {
            None
        };

        Self {
            exists: true,
            timestamp: meta.modified().ok(),
            size: Some(meta.len()),
            link,
        }
    }

    /// Hashes the content of an existing file, or the text of a symlink.
    pub(crate) fn file_csig(&self, path: &Utf8Path) -> std::io::Result<Option<Hash32>> {
        if !self.exists {
            return Ok(None);
        }
        match &self.link {
            Some(link) => Ok(Some(Hash32::hash(format!("symlink:{link}")))),
            None => Hash32::hash_file(path).map(Some),
        }
    }

    pub(crate) fn virtual_node() -> Self {
        Self {
            exists: true,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct Node {
    pub(crate) name: ArcStr,
    pub(crate) kind: NodeKind,
    pub(crate) batch: Option<BatchId>,
    pub(crate) state: NodeState,
    pub(crate) info: OnceLock<NodeInfo>,
    pub(crate) csig: OnceLock<Option<Hash32>>,
    /// Unresolved prerequisites.
    pub(crate) waiting: usize,
    pub(crate) decider: Option<Decider>,
    pub(crate) always_build: bool,
    pub(crate) precious: bool,
    pub(crate) no_cache: bool,
    /// Implicit dependencies are current for this round.
    pub(crate) scanned: bool,
}

impl Node {
    pub(crate) fn new(name: ArcStr, kind: NodeKind) -> Self {
        Self {
            name,
            kind,
            batch: None,
            state: NodeState::Unvisited,
            info: OnceLock::new(),
            csig: OnceLock::new(),
            waiting: 0,
            decider: None,
            always_build: false,
            precious: false,
            no_cache: false,
            scanned: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn batch(&self) -> Option<BatchId> {
        self.batch
    }

    pub fn is_derived(&self) -> bool {
        self.batch.is_some()
    }

    /// On-disk location of file and directory nodes.
    pub fn path(&self) -> Option<&Utf8Path> {
        match &self.kind {
            NodeKind::File(path) | NodeKind::Dir(path) => Some(path),
            NodeKind::Alias | NodeKind::Value(_) => None,
        }
    }

    /// Path handed to actions and scanners; the name for virtual nodes.
    pub(crate) fn action_path(&self) -> Utf8PathBuf {
        match self.path() {
            Some(path) => path.to_owned(),
            None => Utf8PathBuf::from(&*self.name),
        }
    }

    pub fn info(&self) -> &NodeInfo {
        self.info.get_or_init(|| match &self.kind {
            NodeKind::File(path) | NodeKind::Dir(path) => NodeInfo::stat(path),
            NodeKind::Alias | NodeKind::Value(_) => NodeInfo::virtual_node(),
        })
    }

    pub fn exists(&self) -> bool {
        self.info().exists
    }

    pub fn decider(&self, default: Decider) -> Decider {
        self.decider.unwrap_or(default)
    }

    /// Drops cached file system facts, after the node was rebuilt.
    pub(crate) fn invalidate(&mut self) {
        self.info = OnceLock::new();
        self.csig = OnceLock::new();
    }
}

/// Lexically normalizes a path: drops `.` components and folds `..` into the
/// preceding component where there is one.
pub fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    use camino::Utf8Component;

    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => match out.components().next_back() {
                Some(Utf8Component::Normal(_)) => {
                    out.pop();
                }
                Some(Utf8Component::RootDir | Utf8Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_str()),
        }
    }

    if out.as_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let cases = [
            ("a/./b", "a/b"),
            ("a/b/../c", "a/c"),
            ("./a", "a"),
            ("../a", "../a"),
            ("a/../../b", "../b"),
            ("/x/../y", "/y"),
            ("/..", "/"),
            (".", "."),
            ("a/..", "."),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize(Utf8Path::new(input)), expected, "{input}");
        }
    }

    #[test]
    fn test_stat_missing_file() {
        let info = NodeInfo::stat(Utf8Path::new("/definitely/not/here"));
        assert!(!info.exists);
        assert!(info.timestamp.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_stat_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::os::unix::fs::symlink("nowhere", root.join("link")).unwrap();

        let info = NodeInfo::stat(&root.join("link"));
        assert!(info.exists);
        assert_eq!(info.link.as_deref(), Some(Utf8Path::new("nowhere")));
    }
}
