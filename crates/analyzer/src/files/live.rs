/// Paths of files created during the analysis that still exist.
///
/// Windows paths are case-insensitive: lookups ignore case while the stored
/// entries keep the casing they were announced with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveFiles {
    paths: Vec<String>,
}

impl LiveFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, path: &str) -> Option<usize> {
        let path = path.to_lowercase();
        self.paths.iter().position(|p| p.to_lowercase() == path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.position(path).is_some()
    }

    /// Returns `false` when the path was already tracked.
    pub fn add(&mut self, path: &str) -> bool {
        if self.contains(path) {
            return false;
        }
        self.paths.push(path.to_owned());
        true
    }

    /// Forget `path`, returning the entry as it was stored.
    pub fn remove(&mut self, path: &str) -> Option<String> {
        self.position(path).map(|idx| self.paths.remove(idx))
    }

    /// Apply a rename of `old` to `new`.
    ///
    /// An exact match is replaced. When `old` names a directory, either
    /// explicitly with a trailing `\` or implicitly because an entry lives
    /// below it, the directory prefix of each such entry is rewritten.
    /// Returns the number of entries changed.
    pub fn rename(&mut self, old: &str, new: &str) -> usize {
        let old_lower = old.to_lowercase();
        let mut new_dir = new.to_owned();
        if !new_dir.ends_with('\\') {
            new_dir.push('\\');
        }

        let mut changed = 0;
        for entry in &mut self.paths {
            let lower = entry.to_lowercase();
            let replaced = if lower == old_lower {
                Some(new.to_owned())
            } else if old_lower.ends_with('\\') && lower.starts_with(&old_lower) {
                Some(format!("{new_dir}{}", tail(entry, old_lower.len())))
            } else if lower.starts_with(&old_lower) && lower[old_lower.len()..].starts_with('\\') {
                Some(format!("{new_dir}{}", tail(entry, old_lower.len() + 1)))
            } else {
                None
            };
            if let Some(replaced) = replaced {
                *entry = replaced;
                changed += 1;
            }
        }
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// The part of `entry` after its first `prefix_len` lowercase bytes.
///
/// Lowercasing can change byte lengths outside ASCII, so the offset is
/// mapped back through the characters of the original entry.
fn tail(entry: &str, prefix_len: usize) -> &str {
    let mut consumed = 0;
    for (idx, ch) in entry.char_indices() {
        if consumed >= prefix_len {
            return &entry[idx..];
        }
        consumed += ch.to_lowercase().map(char::len_utf8).sum::<usize>();
    }
    ""
}
