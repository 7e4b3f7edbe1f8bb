use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form `key = value` options attached to the submission.
///
/// Keys are kept verbatim (some carry dashes, e.g. `force-sleepskip`), so
/// the map is exposed through accessors instead of a typed struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Options(BTreeMap<String, String>);

impl Options {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Whether `key` is present and not set to an explicit "off" value.
    pub fn enabled(&self, key: &str) -> bool {
        match self.get(key) {
            Some(value) => !matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "" | "0" | "no" | "off" | "false"
            ),
            None => false,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Instrumentation module to inject instead of the bitness default.
    pub fn dll(&self) -> Option<&str> {
        self.get("dll").filter(|dll| !dll.is_empty())
    }

    /// Dump the memory of monitored processes before they terminate.
    pub fn procmemdump(&self) -> bool {
        self.enabled("procmemdump")
    }

    /// Run the target without injecting any instrumentation.
    pub fn free(&self) -> bool {
        self.enabled("free")
    }

    /// Monitoring is done by a kernel driver instead of injected modules.
    pub fn kernel_analysis(&self) -> bool {
        self.enabled("kernel_analysis")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Options {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_treats_explicit_off_values_as_disabled() {
        let options: Options = [
            ("procmemdump", "1"),
            ("kernel_analysis", "no"),
            ("free", "False"),
            ("full-logs", "yes"),
        ]
        .into_iter()
        .collect();
        assert!(options.procmemdump());
        assert!(!options.kernel_analysis());
        assert!(!options.free());
        assert!(options.enabled("full-logs"));
        assert!(!options.enabled("missing"));
    }

    #[test]
    fn free_mode_is_off_unless_asked_for() {
        assert!(!Options::default().free());
        let options: Options = [("free", "1")].into_iter().collect();
        assert!(options.free());
    }

    #[test]
    fn empty_dll_is_ignored() {
        let options: Options = [("dll", "")].into_iter().collect();
        assert_eq!(options.dll(), None);
    }
}
