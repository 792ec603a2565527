//! Content-addressed store of built artifacts.
//!
//! Entries live at `<root>/<first two hex digits>/<hex>` and are never
//! modified once written. A build whose signature matches an entry copies the
//! entry into place instead of running its action.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::core::{Blake3Hasher, Hash32};
use crate::error::CacheError;

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    pushes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheCounts {
    pub hits: u64,
    pub misses: u64,
    pub pushes: u64,
    pub failures: u64,
}

impl CacheStats {
    pub fn counts(&self) -> CacheCounts {
        CacheCounts {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct CacheDir {
    root: Utf8PathBuf,
    readonly: AtomicBool,
    show: bool,
    warned: AtomicBool,
    stats: CacheStats,
}

impl CacheDir {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            root: config.dir.clone(),
            readonly: AtomicBool::new(config.readonly),
            show: config.show,
            warned: AtomicBool::new(false),
            stats: CacheStats::default(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Log actions of retrieved targets as if they had run.
    pub fn show(&self) -> bool {
        self.show
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Cache key of one target. The targets of a batch share a build
    /// signature, the name tells them apart.
    pub fn key(bsig: Hash32, target: &str) -> Hash32 {
        let mut hasher = Blake3Hasher::new();
        hasher.field(bsig.as_bytes()).field(target);
        hasher.finish32()
    }

    pub fn entry_path(&self, key: Hash32) -> Utf8PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    /// Copies the entry for `key` to `target`. Returns `Ok(false)` on a miss.
    pub fn retrieve(&self, key: Hash32, target: &Utf8Path) -> Result<bool, CacheError> {
        let entry = self.entry_path(key);

        let meta = match fs::symlink_metadata(&entry) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            }
            Err(source) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return Err(CacheError::Io {
                    path: entry,
                    source,
                });
            }
        };

        let result = if meta.file_type().is_symlink() {
            restore_link(&entry, target)
        } else {
            copy_atomic(&entry, target)
        };

        if let Err(source) = result {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::Io {
                path: entry,
                source,
            });
        }

        touch(&entry);
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        debug!("retrieved {target} from cache entry {key}");
        Ok(true)
    }

    /// Stores `target` under `key`. An existing entry is kept.
    pub fn push(&self, key: Hash32, target: &Utf8Path) -> Result<(), CacheError> {
        if self.is_readonly() {
            return Err(CacheError::ReadOnly);
        }

        let entry = self.entry_path(key);
        if fs::symlink_metadata(&entry).is_ok() {
            return Ok(());
        }

        match store_entry(target, &entry) {
            Ok(()) => {
                self.stats.pushes.fetch_add(1, Ordering::Relaxed);
                debug!("pushed {target} to cache entry {key}");
                Ok(())
            }
            Err(e) if is_readonly_error(&e) => {
                self.readonly.store(true, Ordering::Relaxed);
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!(
                        "cache directory {} is not writable, no more artifacts will be pushed: {e}",
                        self.root
                    );
                }
                Err(CacheError::ReadOnly)
            }
            Err(source) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Io {
                    path: entry,
                    source,
                })
            }
        }
    }

    /// Like [`push`](Self::push), but a read-only cache is only reported once.
    pub(crate) fn push_quietly(&self, key: Hash32, target: &Utf8Path) {
        match self.push(key, target) {
            Ok(()) => {}
            Err(CacheError::ReadOnly) => {
                if !self.warned.swap(true, Ordering::Relaxed) {
                    warn!("cache directory {} is read-only, skipping pushes", self.root);
                }
            }
            Err(e) => warn!("couldn't push {target} to the cache: {e}"),
        }
    }
}

fn is_readonly_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem
    )
}

fn temp_sibling(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or("entry");
    path.with_file_name(format!(
        ".{name}.{}.{:?}.tmp",
        std::process::id(),
        std::thread::current().id()
    ))
}

/// Copies `from` next to `to` and renames it into place.
fn copy_atomic(from: &Utf8Path, to: &Utf8Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent()
        && !parent.as_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_sibling(to);
    if let Err(e) = fs::copy(from, &temp).and_then(|_| fs::rename(&temp, to)) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}

fn store_entry(target: &Utf8Path, entry: &Utf8Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(target)?;
    if meta.file_type().is_symlink() {
        if let Some(parent) = entry.parent() {
            fs::create_dir_all(parent)?;
        }
        let link = fs::read_link(target)?;
        let temp = temp_sibling(entry);
        symlink(&link, &temp)?;
        if let Err(e) = fs::rename(&temp, entry) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        Ok(())
    } else {
        copy_atomic(target, entry)
    }
}

fn restore_link(entry: &Utf8Path, target: &Utf8Path) -> std::io::Result<()> {
    let link = fs::read_link(entry)?;
    if let Some(parent) = target.parent()
        && !parent.as_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let temp = temp_sibling(target);
    symlink(&link, &temp)?;
    if let Err(e) = fs::rename(&temp, target) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(link: &std::path::Path, at: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, at)
}

#[cfg(windows)]
fn symlink(link: &std::path::Path, at: &Utf8Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(link, at)
}

/// Marks an entry as recently used.
fn touch(entry: &Utf8Path) {
    // Symlink entries have no times of their own we could set portably, and
    // opening one would touch whatever it points at.
    match fs::symlink_metadata(entry) {
        Ok(meta) if !meta.file_type().is_symlink() => {}
        _ => return,
    }
    let Ok(file) = File::options().write(true).open(entry) else {
        return;
    };
    let now = SystemTime::now();
    let times = fs::FileTimes::new().set_accessed(now);
    if let Err(e) = file.set_times(times) {
        debug!("couldn't touch cache entry {entry}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn cache(root: &Utf8Path, readonly: bool) -> CacheDir {
        CacheDir::new(&CacheConfig {
            dir: root.join("cache"),
            readonly,
            show: false,
        })
    }

    #[test]
    fn test_round_trip() {
        let (_guard, root) = scratch();
        let cache = cache(&root, false);
        let key = CacheDir::key(Hash32::hash("bsig"), "out.txt");

        fs::write(root.join("out.txt"), b"artifact \x00\xff").unwrap();
        cache.push(key, &root.join("out.txt")).unwrap();

        let hex = key.to_hex();
        assert!(root.join("cache").join(&hex[..2]).join(&hex).exists());

        assert!(cache.retrieve(key, &root.join("copy/out.txt")).unwrap());
        assert_eq!(
            fs::read(root.join("copy/out.txt")).unwrap(),
            b"artifact \x00\xff"
        );

        let counts = cache.stats().counts();
        assert_eq!((counts.hits, counts.pushes), (1, 1));
    }

    #[test]
    fn test_miss() {
        let (_guard, root) = scratch();
        let cache = cache(&root, false);
        let key = CacheDir::key(Hash32::hash("nothing"), "x");
        assert!(!cache.retrieve(key, &root.join("x")).unwrap());
        assert!(!root.join("x").exists());
        assert_eq!(cache.stats().counts().misses, 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_round_trip() {
        let (_guard, root) = scratch();
        let cache = cache(&root, false);
        let key = CacheDir::key(Hash32::hash("bsig"), "link");

        std::os::unix::fs::symlink("../somewhere/else", root.join("link")).unwrap();
        cache.push(key, &root.join("link")).unwrap();
        fs::remove_file(root.join("link")).unwrap();

        assert!(cache.retrieve(key, &root.join("link")).unwrap());
        let meta = fs::symlink_metadata(root.join("link")).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            fs::read_link(root.join("link")).unwrap(),
            std::path::Path::new("../somewhere/else")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_retrieval_leaves_pointee_alone() {
        let (_guard, root) = scratch();
        let cache = cache(&root, false);
        let key = CacheDir::key(Hash32::hash("bsig"), "link");

        let pointee = root.join("pointee");
        fs::write(&pointee, "data").unwrap();
        let old = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        File::options()
            .write(true)
            .open(&pointee)
            .unwrap()
            .set_times(fs::FileTimes::new().set_accessed(old))
            .unwrap();

        std::os::unix::fs::symlink(&pointee, root.join("link")).unwrap();
        cache.push(key, &root.join("link")).unwrap();
        fs::remove_file(root.join("link")).unwrap();

        assert!(cache.retrieve(key, &root.join("link")).unwrap());
        assert_eq!(fs::metadata(&pointee).unwrap().accessed().unwrap(), old);
    }

    #[test]
    fn test_first_writer_wins() {
        let (_guard, root) = scratch();
        let cache = cache(&root, false);
        let key = CacheDir::key(Hash32::hash("bsig"), "t");

        fs::write(root.join("a"), "first").unwrap();
        fs::write(root.join("b"), "second").unwrap();
        cache.push(key, &root.join("a")).unwrap();
        cache.push(key, &root.join("b")).unwrap();

        assert_eq!(fs::read_to_string(cache.entry_path(key)).unwrap(), "first");
    }

    #[test]
    fn test_readonly_config() {
        let (_guard, root) = scratch();
        let cache = cache(&root, true);
        fs::write(root.join("a"), "x").unwrap();
        let key = CacheDir::key(Hash32::hash("bsig"), "a");

        assert_matches!(cache.push(key, &root.join("a")), Err(CacheError::ReadOnly));
        cache.push_quietly(key, &root.join("a"));
        assert!(!cache.entry_path(key).exists());
    }

    #[test]
    fn test_keys_differ_per_target() {
        let bsig = Hash32::hash("shared");
        assert_ne!(CacheDir::key(bsig, "a.tab.c"), CacheDir::key(bsig, "a.tab.h"));
    }
}
