#![forbid(unsafe_code)]

mod analysis;
mod error;
mod host;
mod monitor;
mod options;
mod paths;

pub use analysis::{Analysis, CLOCK_FORMAT, Category};
pub use error::Error;
pub use host::Host;
pub use monitor::Monitor;
pub use options::Options;
pub use paths::Paths;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix of environment variables overriding file configuration, e.g.
/// `ANALYZER_MONITOR__PIPE_SERVERS=8`.
pub const ENV_PREFIX: &str = "ANALYZER_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub analysis: Analysis,
    pub host: Host,
    pub paths: Paths,
    pub monitor: Monitor,
    pub options: Options,
}

impl Config {
    /// Load configuration from a TOML file. Missing fields are filled with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = toml_edit::de::from_str(&text)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply `ANALYZER_*`
    /// environment overrides on top of it.
    pub fn load_with_env(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let toml = toml_edit::ser::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    /// Load configuration from multiple TOML files. Later files override earlier ones.
    pub fn load_multiple<T, U>(paths: U) -> Result<Self, Error>
    where
        T: AsRef<Path>,
        U: IntoIterator<Item = T>,
    {
        let mut merged = toml_edit::DocumentMut::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(path)?;
            let doc: toml_edit::DocumentMut = text.parse()?;
            merge_document(&mut merged, doc);
        }
        let mut config: Config = toml_edit::de::from_str(&merged.to_string())?;
        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        self.monitor.pipe_servers = self.monitor.pipe_servers.max(1);
        for name in &mut self.monitor.hide_processes {
            *name = name.to_lowercase();
        }
        self.monitor.hide_processes.sort();
        self.monitor.hide_processes.dedup();
    }
}

fn merge_document(target: &mut toml_edit::DocumentMut, source: toml_edit::DocumentMut) {
    for (key, item) in source.iter() {
        merge_item(
            target.entry(key).or_insert(toml_edit::Item::None),
            item.clone(),
        );
    }
}

fn merge_item(target: &mut toml_edit::Item, source: toml_edit::Item) {
    use toml_edit::Item;
    match (target, source) {
        (Item::Table(target_table), Item::Table(source_table)) => {
            for (key, item) in source_table.iter() {
                merge_item(target_table.entry(key).or_insert(Item::None), item.clone());
            }
        }
        (Item::ArrayOfTables(target_array), Item::ArrayOfTables(source_array)) => {
            for table in source_array.iter() {
                target_array.push(table.clone());
            }
        }
        (target_item, source_item) => {
            *target_item = source_item;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analysis.toml");

        let mut config = Config::default();
        config.analysis.package = Some("exe".into());
        config.options.insert("procmemdump", "1");
        config.apply_defaults();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn load_multiple_merges() {
        let dir = tempdir().unwrap();
        let path1 = dir.path().join("a.toml");
        let path2 = dir.path().join("b.toml");

        std::fs::write(
            &path1,
            "[analysis]\ntimeout = 60\ncategory = \"url\"\n[monitor]\npipe_servers = 2\n",
        )
        .unwrap();
        std::fs::write(&path2, "[analysis]\ntimeout = 300\n[options]\nfree = \"yes\"\n").unwrap();

        let cfg = Config::load_multiple([path1, path2]).unwrap();
        assert_eq!(cfg.analysis.timeout, Duration::from_secs(300));
        assert_eq!(cfg.analysis.category, Category::Url);
        assert_eq!(cfg.monitor.pipe_servers, 2);
        assert!(cfg.options.enabled("free"));
    }

    #[test]
    fn zero_listeners_are_bumped_to_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analysis.toml");
        std::fs::write(&path, "[monitor]\npipe_servers = 0\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.monitor.pipe_servers, 1);
    }

    #[test]
    fn hide_list_is_normalized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analysis.toml");
        std::fs::write(
            &path,
            "[monitor]\nhide_processes = [\"Procmon.exe\", \"procmon.exe\", \"Wireshark.EXE\"]\n",
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.monitor.hide_processes, ["procmon.exe", "wireshark.exe"]);
    }

    proptest! {
        #[test]
        fn later_files_win(first in 1u64..100_000, second in 1u64..100_000, servers in 1usize..64) {
            let dir = tempdir().unwrap();
            let path1 = dir.path().join("a.toml");
            let path2 = dir.path().join("b.toml");
            std::fs::write(
                &path1,
                format!("[analysis]\ntimeout = {first}\n[monitor]\npipe_servers = {servers}\n"),
            )
            .unwrap();
            std::fs::write(&path2, format!("[analysis]\ntimeout = {second}\n")).unwrap();

            let cfg = Config::load_multiple([&path1, &path2]).unwrap();
            prop_assert_eq!(cfg.analysis.timeout, Duration::from_secs(second));
            prop_assert_eq!(cfg.monitor.pipe_servers, servers);

            let cfg = Config::load_multiple([&path2, &path1]).unwrap();
            prop_assert_eq!(cfg.analysis.timeout, Duration::from_secs(first));
        }
    }
}
