//! Shared utilities: content hashing and crash-safe file IO.
//!
//! Every non-append write in the workspace goes through
//! [`atomic_write`], which stages bytes in a sibling temporary file and
//! renames it over the target so readers observe either the old or the new
//! content in full. Hashing is SHA-256 throughout; the WAL and snapshot
//! manifests store hashes in hex.

use std::{
    fmt, fs,
    io::Write,
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::MemError;

/// A SHA-256 content hash used for WAL records, snapshot manifests and the
/// retrieval index epoch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Compute the hash of a byte buffer.
    pub fn compute(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Hash a file's current bytes. A missing file hashes as the empty
    /// buffer, so "file absent" and "file empty" compare equal on replay.
    pub fn of_file(path: &Path) -> Result<Self, MemError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Self::compute(&bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::compute(b"")),
            Err(err) => Err(err.into()),
        }
    }

    /// Hex string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = MemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(MemError::InvalidHashValue(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| MemError::InvalidHashValue(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Write `bytes` to `path` via a sibling tempfile and rename, creating parent
/// directories as needed. Readers never observe a partial file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), MemError> {
    let parent = path.parent().ok_or_else(|| {
        MemError::CustomError(format!("`{}` has no parent directory", path.display()))
    })?;
    fs::create_dir_all(parent)?;
    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .map_err(|err| MemError::IOError(err.error))?;
    Ok(())
}

/// Verify the append-only contract: the previous content must be a byte
/// prefix of the new content.
pub fn check_append_only(path: &Path, previous: &[u8], next: &[u8]) -> Result<(), MemError> {
    if next.len() < previous.len() || &next[..previous.len()] != previous {
        return Err(MemError::AppendOnlyViolation(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_round_trip() {
        let hash = ContentHash::compute(b"hello world");
        // echo -n "hello world" | shasum -a 256
        assert_eq!(
            hash.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
        assert!("bad_hash".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_missing_file_hashes_as_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let absent = ContentHash::of_file(&dir.path().join("missing.md")).unwrap();
        assert_eq!(absent, ContentHash::compute(b""));
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("nested/deep/file.md");
        atomic_write(&target, b"content").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"content");

        atomic_write(&target, b"replaced").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"replaced");
    }

    #[test]
    fn test_append_only_guard() {
        let path = Path::new("memory/2026-02-13.md");
        assert!(check_append_only(path, b"line1\n", b"line1\nline2\n").is_ok());
        assert!(check_append_only(path, b"line1\n", b"line1\n").is_ok());
        assert!(matches!(
            check_append_only(path, b"line1\n", b"line2\n"),
            Err(MemError::AppendOnlyViolation(_))
        ));
        assert!(check_append_only(path, b"line1\n", b"").is_err());
    }
}
