use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::sig::DepRecord;

/// The current, observable state of a dependency.
///
/// `csig` may be expensive (it can hash a file), so deciders only call it when
/// they have to.
pub trait Observed {
    fn timestamp(&self) -> Option<SystemTime>;
    fn size(&self) -> Option<u64>;
    fn csig(&self) -> Option<Hash32>;
}

/// Decides whether a dependency changed since the last successful build of a
/// target, by comparing its current state against the [`DepRecord`] stored in
/// the target's signature record.
///
/// The decider of the *dependency* applies, so a single node can opt into a
/// cheaper or stricter check than the rest of the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decider {
    /// Changed iff the modification time differs from the recorded one.
    Timestamp,
    /// Changed iff the content signature differs from the recorded one.
    Content,
    /// Unchanged if both modification time and size match the record,
    /// otherwise compare content signatures.
    #[default]
    ContentTimestamp,
}

impl Decider {
    /// Returns `true` if this decider compares content signatures.
    pub fn uses_content(self) -> bool {
        matches!(self, Decider::Content | Decider::ContentTimestamp)
    }

    /// Returns `true` if `current` changed relative to `previous`. A
    /// dependency without a previous record has always changed.
    pub fn changed(self, current: &dyn Observed, previous: Option<&DepRecord>) -> bool {
        let Some(previous) = previous else {
            return true;
        };

        // Aliases and values have no timestamp, only content.
        let Some(timestamp) = current.timestamp() else {
            return current.csig() != previous.csig;
        };

        match self {
            Decider::Timestamp => Some(timestamp) != previous.timestamp,
            Decider::Content => current.csig() != previous.csig,
            Decider::ContentTimestamp => {
                let same_stat = previous.csig.is_some()
                    && Some(timestamp) == previous.timestamp
                    && current.size() == previous.size;
                if same_stat {
                    return false;
                }
                current.csig() != previous.csig
            }
        }
    }

    /// Feeds the stamp of a dependency into a build signature: its content
    /// signature for content deciders and virtual nodes, its timestamp and
    /// size otherwise.
    pub(crate) fn stamp(self, hasher: &mut Blake3Hasher, current: &dyn Observed) {
        if self.uses_content() || current.timestamp().is_none() {
            match current.csig() {
                Some(csig) => hasher.field(csig.as_bytes()),
                None => hasher.field([]),
            };
        } else {
            hasher.field(nanos(current.timestamp()).to_le_bytes());
            hasher.field(current.size().unwrap_or(u64::MAX).to_le_bytes());
        }
    }
}

fn nanos(time: Option<SystemTime>) -> i128 {
    match time {
        Some(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(after) => after.as_nanos() as i128,
            Err(before) => -(before.duration().as_nanos() as i128),
        },
        None => i128::MIN,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use super::*;

    struct Fake {
        timestamp: Option<SystemTime>,
        size: Option<u64>,
        csig: Option<Hash32>,
        hashed: Cell<usize>,
    }

    impl Fake {
        fn new(secs: u64, size: u64, content: &str) -> Self {
            Self {
                timestamp: Some(UNIX_EPOCH + Duration::from_secs(secs)),
                size: Some(size),
                csig: Some(Hash32::hash(content)),
                hashed: Cell::new(0),
            }
        }

        fn record(&self) -> DepRecord {
            DepRecord {
                name: "dep".into(),
                csig: self.csig,
                timestamp: self.timestamp,
                size: self.size,
            }
        }
    }

    impl Observed for Fake {
        fn timestamp(&self) -> Option<SystemTime> {
            self.timestamp
        }

        fn size(&self) -> Option<u64> {
            self.size
        }

        fn csig(&self) -> Option<Hash32> {
            self.hashed.set(self.hashed.get() + 1);
            self.csig
        }
    }

    #[test]
    fn test_missing_record_is_changed() {
        let dep = Fake::new(1, 1, "a");
        for decider in [
            Decider::Timestamp,
            Decider::Content,
            Decider::ContentTimestamp,
        ] {
            assert!(decider.changed(&dep, None), "{decider:?}");
        }
    }

    #[test]
    fn test_timestamp_match() {
        let old = Fake::new(10, 1, "a");
        let record = old.record();
        assert!(!Decider::Timestamp.changed(&old, Some(&record)));
        assert!(Decider::Timestamp.changed(&Fake::new(11, 1, "a"), Some(&record)));
        assert!(Decider::Timestamp.changed(&Fake::new(9, 1, "a"), Some(&record)));
    }

    #[test]
    fn test_content_ignores_timestamp() {
        let record = Fake::new(10, 1, "a").record();
        assert!(!Decider::Content.changed(&Fake::new(99, 1, "a"), Some(&record)));
        assert!(Decider::Content.changed(&Fake::new(10, 1, "b"), Some(&record)));
    }

    #[test]
    fn test_hybrid_skips_hash_when_stat_matches() {
        let dep = Fake::new(10, 5, "a");
        let record = dep.record();
        assert!(!Decider::ContentTimestamp.changed(&dep, Some(&record)));
        assert_eq!(dep.hashed.get(), 0);
    }

    #[test]
    fn test_hybrid_hashes_when_touched() {
        let record = Fake::new(10, 5, "a").record();

        let touched = Fake::new(20, 5, "a");
        assert!(!Decider::ContentTimestamp.changed(&touched, Some(&record)));
        assert_eq!(touched.hashed.get(), 1);

        let edited = Fake::new(20, 5, "b");
        assert!(Decider::ContentTimestamp.changed(&edited, Some(&record)));
    }

    #[test]
    fn test_virtual_nodes_compare_content() {
        let mut alias = Fake::new(0, 0, "children v1");
        alias.timestamp = None;
        alias.size = None;
        let record = alias.record();

        let mut changed = Fake::new(0, 0, "children v2");
        changed.timestamp = None;
        changed.size = None;

        for decider in [Decider::Timestamp, Decider::ContentTimestamp] {
            assert!(!decider.changed(&alias, Some(&record)), "{decider:?}");
            assert!(decider.changed(&changed, Some(&record)), "{decider:?}");
        }
    }

    #[test]
    fn test_stamp_depends_on_decider() {
        let a = Fake::new(10, 5, "a");
        let b = Fake::new(20, 5, "a");

        let stamp = |decider: Decider, dep: &Fake| {
            let mut hasher = Blake3Hasher::new();
            decider.stamp(&mut hasher, dep);
            hasher.finish32()
        };

        assert_eq!(stamp(Decider::Content, &a), stamp(Decider::Content, &b));
        assert_ne!(stamp(Decider::Timestamp, &a), stamp(Decider::Timestamp, &b));
    }
}
