#![forbid(unsafe_code)]
//! Incremental build engine.
//!
//! A build is described as a [`Graph`] of files, directories, aliases and
//! values. [`Builder`]s are attached to targets with [`Graph::declare`], and
//! the [`Taskmaster`] decides which of them are stale by comparing the
//! current state of their dependencies with the [signatures](SignatureStore)
//! recorded at the last build. Stale targets are rebuilt by [`run`], on as
//! many threads as configured, and optionally restored from or stored in a
//! content-addressed [cache](CacheDir).
//!
//! ```no_run
//! use kamado::{Action, Builder, Config, Graph, Taskmaster};
//!
//! let mut graph = Graph::new();
//! let input = graph.file("hello.c");
//! let output = graph.file("hello.o");
//! graph.declare(
//!     Builder::new("cc", Action::command("cc -c -o $TARGET $SOURCE")),
//!     &[output],
//!     &[input],
//! )?;
//!
//! let mut tm = Taskmaster::new(graph, Config::new().jobs(4), &[output]);
//! kamado::run(&mut tm).into_result()?;
//! # Ok::<(), kamado::KamadoError>(())
//! ```

mod builder;
mod cache;
mod config;
mod core;
mod decider;
pub mod diagnostics;
pub mod engine;
mod error;
pub mod graph;
#[cfg(feature = "logging")]
pub mod logging;
pub mod sig;

pub use crate::builder::{
    Action, ActionContext, Builder, CommandAction, FnScanner, FunctionAction, ScanContext, Scanner,
};
pub use crate::cache::{CacheCounts, CacheDir, CacheStats};
pub use crate::config::{CacheConfig, Config, StoreLayout};
pub use crate::core::{ArcStr, Hash32};
pub use crate::decider::{Decider, Observed};
pub use crate::engine::{BuildReport, Outcome, Reason, Task, TaskContext, Taskmaster, run};
pub use crate::error::*;
pub use crate::graph::{BatchId, Graph, Node, NodeId, NodeKind, NodeState};
pub use crate::sig::{DepRecord, SignatureRecord, SignatureStore};
