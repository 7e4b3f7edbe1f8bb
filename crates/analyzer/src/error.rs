use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[from] config::Error),

    #[error("Failed to access file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to acquire debug privilege (error {0})")]
    Privilege(u32),

    #[error("Failed to create result folder {path:?}: {source}")]
    CreateFolder {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unable to access file at path {0:?}")]
    NotExecutable(PathBuf),

    #[error("Failed to execute process from path {path:?} (error {code})")]
    Spawn { path: PathBuf, code: u32 },

    #[error("No valid package available for file type: {0}")]
    NoPackage(String),

    #[error("Unable to select package \"{0}\", does not exist")]
    UnknownPackage(String),

    #[error("The package \"{package}\" start function raised an error: {reason}")]
    PackageStart { package: String, reason: String },

    #[error("Package error: {0}")]
    Package(String),

    #[error("Failed to upload {path:?} to the result server: {source}")]
    Upload {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to report to the host: {0}")]
    Report(#[from] reqwest::Error),

    #[error("Operation is not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("Analysis interrupted: {0}")]
    Interrupted(String),
}
