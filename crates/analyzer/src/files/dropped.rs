use crate::error::Error;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io::Read;
use std::path::Path;
use tracing::warn;

/// What happened to a file handed to [`Registry::dump_file`].
///
/// [`Registry::dump_file`]: crate::registry::Registry::dump_file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dumped {
    /// Stored under the given remote path.
    Uploaded(String),
    /// Same contents as an earlier upload, stored under the given path.
    Duplicate(String),
    /// Missing or a directory.
    Skipped,
}

/// Outcome of [`DroppedFiles::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reserved {
    /// First time these contents are seen; upload them here.
    New(String),
    /// Already stored (or being stored) under this path.
    Existing(String),
}

/// Contents already uploaded, keyed by sha256, with their remote paths.
///
/// A digest is reserved before its upload starts, so the upload itself runs
/// without the registry lock and concurrent copies still resolve to one path.
#[derive(Debug, Clone, Default)]
pub struct DroppedFiles {
    uploaded: Vec<(String, String)>,
}

impl DroppedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upload_path(&self, digest: &str) -> Option<&str> {
        self.uploaded
            .iter()
            .find(|(d, _)| d == digest)
            .map(|(_, p)| p.as_str())
    }

    pub fn len(&self) -> usize {
        self.uploaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploaded.is_empty()
    }

    /// Claim a remote path for `digest`, or return the one already claimed.
    pub fn reserve(&mut self, digest: &str, name: &str) -> Reserved {
        if let Some(existing) = self.upload_path(digest) {
            return Reserved::Existing(existing.to_owned());
        }
        let id: u64 = rand::rng().random_range(100_000_000..=9_999_999_999);
        let remote = format!("files/{id}/{name}");
        self.uploaded.push((digest.to_owned(), remote.clone()));
        Reserved::New(remote)
    }

    /// Forget a reservation whose upload failed.
    pub fn release(&mut self, digest: &str) {
        self.uploaded.retain(|(d, _)| d != digest);
    }
}

/// Digest of a regular file, `None` when it is missing or a directory.
pub fn file_digest(path: &Path) -> Result<Option<String>, Error> {
    if !path.exists() {
        warn!(path = %path.display(), "file does not exist, skip");
        return Ok(None);
    }
    if path.is_dir() {
        return Ok(None);
    }
    sha256_file(path).map(Some)
}

/// File name used on the result server: the last path component, without
/// an alternate data stream prefix (`file.txt:stream` keeps `stream`).
pub fn upload_name(path: &str) -> &str {
    let name = path.rsplit(['\\', '/']).next().unwrap_or(path);
    match name.find(':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

fn sha256_file(path: &Path) -> Result<String, Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    let mut hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_reserved_once() {
        let mut dropped = DroppedFiles::new();

        let Reserved::New(remote) = dropped.reserve("abc", "first.bin") else {
            panic!("first reservation must be new");
        };
        assert!(remote.starts_with("files/"));
        assert!(remote.ends_with("/first.bin"));

        assert_eq!(
            dropped.reserve("abc", "second.bin"),
            Reserved::Existing(remote.clone())
        );
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped.upload_path("abc"), Some(remote.as_str()));
    }

    #[test]
    fn released_digest_can_be_reserved_again() {
        let mut dropped = DroppedFiles::new();
        dropped.reserve("abc", "a.bin");
        dropped.release("abc");
        assert!(dropped.is_empty());
        assert!(matches!(dropped.reserve("abc", "a.bin"), Reserved::New(_)));
    }

    #[test]
    fn missing_files_and_directories_have_no_digest() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(file_digest(&dir.path().join("nope")).unwrap(), None);
        assert_eq!(file_digest(dir.path()).unwrap(), None);
    }

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn upload_name_strips_directories_and_streams() {
        assert_eq!(upload_name("C:\\a\\b.txt"), "b.txt");
        assert_eq!(upload_name("C:\\a\\b.txt:Zone.Identifier"), "Zone.Identifier");
        assert_eq!(upload_name("/tmp/x/y.bin"), "y.bin");
        assert_eq!(upload_name("plain"), "plain");
    }
}
