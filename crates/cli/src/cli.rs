use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest analysis accepted on the command line, in seconds.
const MAX_TIMEOUT: u64 = 24 * 60 * 60;

/// sandbox-analyzer: in-guest agent of a dynamic analysis sandbox
///
/// Starts the submitted sample, injects the instrumentation into every
/// process it creates, follows them until the analysis is over and reports
/// completion to the host.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to the analysis configuration.
    ///
    /// `ANALYZER_*` environment variables override values from this file.
    /// If not provided, `analysis.toml` and `analysis.d/*.toml` in the
    /// working directory are merged, later files winning.
    #[arg(short, long, value_parser = validate_file)]
    pub conffile: Option<PathBuf>,

    /// Path to log file.
    ///
    /// Logs always go to stderr; this adds a copy without colors.
    #[arg(short, long)]
    pub logfile: Option<PathBuf>,

    /// Analysis package to run, overriding the configuration.
    #[arg(short, long)]
    pub package: Option<String>,

    /// Analysis timeout in seconds, overriding the configuration.
    #[arg(short, long, value_parser = validate_timeout)]
    pub timeout: Option<Duration>,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

/// Validate the analysis timeout.
#[inline(always)]
fn validate_timeout(timeout: &str) -> Result<Duration, String> {
    let secs: u64 = timeout
        .parse()
        .map_err(|_| format!("`{timeout}` is not a valid number of seconds"))?;
    if (1..=MAX_TIMEOUT).contains(&secs) {
        Ok(Duration::from_secs(secs))
    } else {
        Err(format!("Timeout must be between 1 and {MAX_TIMEOUT} seconds"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn timeout_candidates() -> impl Strategy<Value = String> {
        prop_oneof![
            2 => (0u64..200_000).prop_map(|i| format!("{}", i)),
            1 => (-1000i64..=1000).prop_map(|i| format!("{}", i)),
            1 => ".*",
        ]
    }

    proptest! {
        #[test]
        fn test_validate_timeout(timeout in timeout_candidates()) {
            let result = validate_timeout(&timeout);
            match result {
                Ok(t) => prop_assert!((1..=MAX_TIMEOUT).contains(&t.as_secs())),
                Err(err) => {
                    let error_msg = format!("`{}` is not a valid number of seconds", timeout);
                    let range_msg = format!("Timeout must be between 1 and {MAX_TIMEOUT} seconds");
                    prop_assert!(err == error_msg || err == range_msg, "{}", err);
                },
            }
        }
    }

    #[test]
    fn overrides_are_parsed() {
        let cli = Cli::try_parse_from(["sandbox-analyzer", "-p", "ie", "-t", "300", "-vv"]).unwrap();
        assert_eq!(cli.package.as_deref(), Some("ie"));
        assert_eq!(cli.timeout, Some(Duration::from_secs(300)));
        assert!(cli.conffile.is_none());
    }

    #[test]
    fn missing_config_file_is_rejected() {
        let err = Cli::try_parse_from(["sandbox-analyzer", "-c", "/definitely/not/here.toml"])
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }
}
