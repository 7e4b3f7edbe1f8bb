use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Paths {
    /// Directory the analyzer runs from. Protected from monitoring.
    pub analyzer: PathBuf,

    /// Local results root. Protected from monitoring and reported back to
    /// the host on completion.
    pub results: PathBuf,

    /// Directory holding the loader binaries (`loader.exe`, `loader_x64.exe`).
    pub bin: PathBuf,

    /// Directory holding the instrumentation modules.
    pub dll: PathBuf,

    /// Where per-process injection configuration files are written.
    pub injection_config: PathBuf,

    /// Directory the submitted file is dropped into and new processes start
    /// in.
    pub temp: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        let temp = std::env::temp_dir();
        let injection_config = if cfg!(windows) {
            PathBuf::from("C:\\")
        } else {
            temp.clone()
        };
        Self {
            analyzer: PathBuf::from("."),
            results: temp.join("analysis"),
            bin: PathBuf::from("bin"),
            dll: PathBuf::from("dll"),
            injection_config,
            temp,
        }
    }
}

impl Paths {
    /// Subdirectories of the results root that must exist before the sample
    /// runs.
    pub fn result_folders(&self) -> [PathBuf; 4] {
        ["logs", "files", "shots", "memory"].map(|name| self.results.join(name))
    }
}
