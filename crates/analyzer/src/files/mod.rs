//! Bookkeeping for files the sample touches.

#![forbid(unsafe_code)]

mod dropped;
mod live;

pub use dropped::{DroppedFiles, Dumped, Reserved, file_digest, upload_name};
pub use live::LiveFiles;

use std::path::Path;

/// Lowercased paths that are never monitoring targets. Entries ending in
/// `\` match everything below them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtectedPaths {
    entries: Vec<String>,
}

impl ProtectedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protect `path`. Existing directories are protected with everything
    /// below them.
    pub fn add(&mut self, path: &Path) {
        let mut entry = path.to_string_lossy().to_lowercase();
        if path.is_dir() && !entry.ends_with(['\\', '/']) {
            entry.push(std::path::MAIN_SEPARATOR);
        }
        if !self.entries.contains(&entry) {
            self.entries.push(entry);
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let path = path.to_lowercase();
        self.entries.iter().any(|entry| {
            if entry.ends_with(['\\', '/']) {
                path.starts_with(entry.as_str())
            } else {
                path == *entry
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}
