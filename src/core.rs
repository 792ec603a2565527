use std::fmt::Write;
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

/// Atomic reference-counted string type used for node names.
pub type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used for every signature in the engine.
///
/// In `kamado` this serves three purposes:
/// 1. the content signature (`csig`) of a file, directory listing or value;
/// 2. the build signature (`bsig`) of a derived node, folding the action
///    signature together with the stamps of all of its children;
/// 3. the address of an artifact inside the build cache.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn hash_file(path: impl AsRef<Utf8Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap(path.as_ref().as_std_path())?
            .finalize()
            .into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        let mut acc = String::with_capacity(64);
        for byte in self.0 {
            // Writing into a String never fails.
            let _ = write!(acc, "{byte:02x}");
        }
        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental signature builder.
///
/// Every field is length-prefixed so that `("ab", "c")` and `("a", "bc")` never
/// collide.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn finish32(&self) -> Hash32 {
        self.0.finalize().into()
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        value.finish32()
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_length() {
        let hash = Hash32::hash("kamado");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fields_are_length_prefixed() {
        let mut a = Blake3Hasher::new();
        a.field("ab").field("c");
        let mut b = Blake3Hasher::new();
        b.field("a").field("bc");
        assert_ne!(a.finish32(), b.finish32());
    }

    #[test]
    fn test_hash_file_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("f")).unwrap();
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(Hash32::hash_file(&path).unwrap(), Hash32::hash(b"hello"));
    }
}
