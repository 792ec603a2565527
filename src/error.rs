use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::ArcStr;

/// Structural error in the declared graph, raised before anything is scheduled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeclarationError {
    #[error(
        "Two different actions were specified for the same target: {target}\n  first:  {first}\n  second: {second}"
    )]
    ConflictingActions {
        target: ArcStr,
        first: String,
        second: String,
    },

    #[error("Two different target lists have a target in common: {target}")]
    TargetListsCollide { target: ArcStr },

    #[error("Multiple ways to build the same target were specified for: {target}")]
    MultipleSources { target: ArcStr },

    #[error("Side effect '{node}' cannot also be a built target")]
    SideEffectIsTarget { node: ArcStr },

    #[error("A builder invocation needs at least one target")]
    NoTargets,
}

/// Failure of one Task, or the reason a node could not be built at all.
#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("action exited with status {status}")]
    Action { status: i32 },

    #[error("action failed:\n{0}")]
    ActionFailed(Arc<anyhow::Error>),

    #[error("action did not produce declared targets: {}", .0.join(", "))]
    MissingTargets(Vec<ArcStr>),

    #[error("source '{0}' does not exist and no builder is declared for it")]
    MissingSource(ArcStr),

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<ArcStr>),

    #[error("scanner failed for '{0}':\n{1}")]
    Scan(ArcStr, Arc<anyhow::Error>),

    #[error("{0}")]
    Panic(String),

    #[error("'{0}' is already being built by another task")]
    AlreadyBuilding(ArcStr),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("build stalled: '{0}' is still waiting on unfinished dependencies")]
    Stalled(ArcStr),
}

impl BuildError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }
}

/// Error of the persisted signature database. Recovered inside the store,
/// only `flush` surfaces it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("signature file {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signature file {path} is corrupt: {message}")]
    Decode { path: Utf8PathBuf, message: String },

    #[error("couldn't encode signature file {path}: {message}")]
    Encode { path: Utf8PathBuf, message: String },

    #[error("signature file {path} has format version {found}, expected {expected}")]
    Version {
        path: Utf8PathBuf,
        found: u32,
        expected: u32,
    },
}

/// Error of the artifact cache. Never fatal.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache is read-only")]
    ReadOnly,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file {0}.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse configuration file {0}.\n{1}")]
    Parse(Utf8PathBuf, serde_json::Error),

    #[error("Invalid value for {0}: {1}")]
    Env(&'static str, String),
}

#[derive(Debug, Error)]
pub enum KamadoError {
    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Build failed.\n{0}")]
    BuildFailed(String),
}
