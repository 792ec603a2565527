//! Persisted signature database.
//!
//! Records are grouped into shards. Each shard sits behind its own mutex, so
//! workers finalizing targets in different directories never contend. A shard
//! is loaded from disk the first time any of its records is touched and
//! written back by [`SignatureStore::flush`].

mod record;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StoreLayout;
use crate::error::StoreError;

pub use record::{DepRecord, SignatureRecord};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SignatureFile {
    version: u32,
    records: BTreeMap<String, SignatureRecord>,
}

#[derive(Debug, Default)]
struct Shard {
    /// Backing file, `None` for in-memory stores.
    path: Option<Utf8PathBuf>,
    records: HashMap<String, Arc<SignatureRecord>>,
    dirty: bool,
}

#[derive(Debug)]
pub struct SignatureStore {
    layout: StoreLayout,
    shards: RwLock<HashMap<Utf8PathBuf, Arc<Mutex<Shard>>>>,
}

impl SignatureStore {
    pub fn open(layout: StoreLayout) -> Self {
        Self {
            layout,
            shards: RwLock::new(HashMap::new()),
        }
    }

    pub fn memory() -> Self {
        Self::open(StoreLayout::Memory)
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn get(&self, name: &str) -> Option<Arc<SignatureRecord>> {
        let shard = self.shard(name);
        let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
        shard.records.get(name).cloned()
    }

    pub fn put(&self, name: &str, record: SignatureRecord) {
        let shard = self.shard(name);
        let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
        shard.records.insert(name.to_string(), Arc::new(record));
        shard.dirty = true;
    }

    /// Writes every modified shard back to disk. All shards are attempted,
    /// the first error is returned.
    pub fn flush(&self) -> Result<(), StoreError> {
        let shards: Vec<_> = self
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut result = Ok(());
        for shard in shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            if !shard.dirty {
                continue;
            }
            let Some(path) = shard.path.clone() else {
                shard.dirty = false;
                continue;
            };

            match write_file(&path, &shard.records) {
                Ok(()) => {
                    debug!("wrote {} signature records to {path}", shard.records.len());
                    shard.dirty = false;
                }
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    /// Every record currently known, loaded shards only.
    pub fn snapshot(&self) -> BTreeMap<String, SignatureRecord> {
        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        let mut all = BTreeMap::new();
        for shard in shards.values() {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            for (name, record) in &shard.records {
                all.insert(name.clone(), SignatureRecord::clone(record));
            }
        }
        all
    }

    fn shard_key(&self, name: &str) -> Utf8PathBuf {
        match &self.layout {
            StoreLayout::Single { .. } => Utf8PathBuf::new(),
            StoreLayout::PerDirectory { .. } | StoreLayout::Memory => Utf8Path::new(name)
                .parent()
                .map(Utf8Path::to_path_buf)
                .unwrap_or_default(),
        }
    }

    fn shard_path(&self, key: &Utf8Path) -> Option<Utf8PathBuf> {
        match &self.layout {
            StoreLayout::Single { path } => Some(path.clone()),
            StoreLayout::PerDirectory { file_name } => Some(key.join(file_name)),
            StoreLayout::Memory => None,
        }
    }

    fn shard(&self, name: &str) -> Arc<Mutex<Shard>> {
        let key = self.shard_key(name);

        if let Some(shard) = self
            .shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return shard.clone();
        }

        // Load outside the write lock; if another worker wins the race its
        // copy is kept and ours is dropped.
        let path = self.shard_path(&key);
        let records = match &path {
            Some(path) => load_file(path),
            None => HashMap::new(),
        };

        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        shards
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Shard {
                    path,
                    records,
                    dirty: false,
                }))
            })
            .clone()
    }
}

/// Reads a signature file. Any problem yields an empty shard.
fn load_file(path: &Utf8Path) -> HashMap<String, Arc<SignatureRecord>> {
    match read_file(path) {
        Ok(records) => records
            .into_iter()
            .map(|(name, record)| (name, Arc::new(record)))
            .collect(),
        Err(StoreError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
            HashMap::new()
        }
        Err(e) => {
            warn!("{e}; treating it as empty");
            HashMap::new()
        }
    }
}

fn read_file(path: &Utf8Path) -> Result<BTreeMap<String, SignatureRecord>, StoreError> {
    let file = File::open(path).map_err(|source| StoreError::Io {
        path: path.to_owned(),
        source,
    })?;

    let data: SignatureFile =
        ciborium::from_reader(BufReader::new(file)).map_err(|e| StoreError::Decode {
            path: path.to_owned(),
            message: e.to_string(),
        })?;

    if data.version != FORMAT_VERSION {
        return Err(StoreError::Version {
            path: path.to_owned(),
            found: data.version,
            expected: FORMAT_VERSION,
        });
    }

    Ok(data.records)
}

fn write_file(
    path: &Utf8Path,
    records: &HashMap<String, Arc<SignatureRecord>>,
) -> Result<(), StoreError> {
    let io = |source: std::io::Error| StoreError::Io {
        path: path.to_owned(),
        source,
    };

    let data = SignatureFile {
        version: FORMAT_VERSION,
        records: records
            .iter()
            .map(|(name, record)| (name.clone(), SignatureRecord::clone(record)))
            .collect(),
    };

    if let Some(parent) = path.parent()
        && !parent.as_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io)?;
    }

    let temp = path.with_file_name(format!(
        ".{}.{}.tmp",
        path.file_name().unwrap_or("signatures"),
        std::process::id()
    ));

    let file = File::create(&temp).map_err(io)?;
    let mut writer = BufWriter::new(file);
    ciborium::into_writer(&data, &mut writer).map_err(|e| StoreError::Encode {
        path: path.to_owned(),
        message: e.to_string(),
    })?;
    writer.flush().map_err(io)?;
    drop(writer);

    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        io(e)
    })
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use assert_matches::assert_matches;

    use super::*;
    use crate::core::Hash32;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn record(content: &str) -> SignatureRecord {
        SignatureRecord {
            bsig: Some(Hash32::hash(content)),
            csig: Some(Hash32::hash(content)),
            timestamp: Some(UNIX_EPOCH + Duration::from_secs(42)),
            size: Some(content.len() as u64),
            children: vec![DepRecord {
                name: "in.txt".into(),
                csig: Some(Hash32::hash("in")),
                timestamp: None,
                size: Some(2),
            }],
            action_sig: Some(Hash32::hash("cp")),
            action: Some("cp in.txt out.txt".into()),
            implicit: Some(vec!["header.h".into()]),
        }
    }

    #[test]
    fn test_single_file_persists() {
        let (_guard, root) = scratch();
        let layout = StoreLayout::Single {
            path: root.join("db.sig"),
        };

        let store = SignatureStore::open(layout.clone());
        store.put("a/out.txt", record("a"));
        store.put("b/out.txt", record("b"));
        store.flush().unwrap();

        let reopened = SignatureStore::open(layout);
        assert_eq!(reopened.get("a/out.txt").as_deref(), Some(&record("a")));
        assert_eq!(reopened.get("b/out.txt").as_deref(), Some(&record("b")));
        assert!(reopened.get("c/out.txt").is_none());
    }

    #[test]
    fn test_per_directory_files() {
        let (_guard, root) = scratch();
        let layout = StoreLayout::PerDirectory {
            file_name: ".sig".into(),
        };

        let store = SignatureStore::open(layout.clone());
        store.put(root.join("a/out").as_str(), record("a"));
        store.put(root.join("b/out").as_str(), record("b"));
        store.flush().unwrap();

        assert!(root.join("a/.sig").exists());
        assert!(root.join("b/.sig").exists());

        let reopened = SignatureStore::open(layout);
        assert_eq!(
            reopened.get(root.join("b/out").as_str()).as_deref(),
            Some(&record("b"))
        );
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let (_guard, root) = scratch();
        let path = root.join("db.sig");
        fs::write(&path, b"definitely not cbor").unwrap();

        let store = SignatureStore::open(StoreLayout::Single { path: path.clone() });
        assert!(store.get("x").is_none());

        // The store stays usable and overwrites the broken file.
        store.put("x", record("x"));
        store.flush().unwrap();
        assert_eq!(read_file(&path).unwrap()["x"], record("x"));
    }

    #[test]
    fn test_version_mismatch() {
        let (_guard, root) = scratch();
        let path = root.join("db.sig");
        let data = SignatureFile {
            version: FORMAT_VERSION + 1,
            records: BTreeMap::from([("x".to_string(), record("x"))]),
        };
        ciborium::into_writer(&data, File::create(&path).unwrap()).unwrap();

        assert_matches!(
            read_file(&path),
            Err(StoreError::Version { found, .. }) if found == FORMAT_VERSION + 1
        );
        let store = SignatureStore::open(StoreLayout::Single { path });
        assert!(store.get("x").is_none());
    }

    #[test]
    fn test_memory_never_writes() {
        let store = SignatureStore::memory();
        store.put("x", record("x"));
        store.flush().unwrap();
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_concurrent_puts() {
        let store = SignatureStore::memory();
        std::thread::scope(|s| {
            for t in 0..8 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..50 {
                        store.put(&format!("d{}/f{t}-{i}", i % 4), record(&format!("{t}-{i}")));
                    }
                });
            }
        });
        assert_eq!(store.snapshot().len(), 400);
    }
}
