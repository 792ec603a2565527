use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::core::Hash32;

/// State of one dependency as seen when its target was last built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepRecord {
    pub name: String,
    pub csig: Option<Hash32>,
    pub timestamp: Option<SystemTime>,
    pub size: Option<u64>,
}

/// Everything remembered about a node between two runs.
///
/// Derived nodes carry a build signature along with the dependency state it
/// was computed from. Source nodes only remember `csig`, `timestamp` and
/// `size`, which lets the hybrid decider skip rehashing unchanged files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub csig: Option<Hash32>,
    pub bsig: Option<Hash32>,
    pub timestamp: Option<SystemTime>,
    pub size: Option<u64>,
    /// Children in `Graph::children` order.
    #[serde(default)]
    pub children: Vec<DepRecord>,
    pub action_sig: Option<Hash32>,
    /// Human readable action, for `explain`.
    pub action: Option<String>,
    /// Implicit dependencies found by the last scan.
    pub implicit: Option<Vec<String>>,
}

impl SignatureRecord {
    /// Record for a node that is not built by this engine.
    pub fn source(csig: Option<Hash32>, timestamp: Option<SystemTime>, size: Option<u64>) -> Self {
        Self {
            csig,
            timestamp,
            size,
            ..Default::default()
        }
    }

    pub fn is_derived(&self) -> bool {
        self.bsig.is_some()
    }

    pub fn child(&self, name: &str) -> Option<&DepRecord> {
        self.children.iter().find(|dep| dep.name == name)
    }
}
