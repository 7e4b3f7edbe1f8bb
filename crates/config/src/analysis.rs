use crate::Error;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

/// Format of the VM clock value handed over by the host.
pub const CLOCK_FORMAT: &str = "%Y%m%dT%H:%M:%S";

/// What kind of target was submitted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    /// A file dropped next to the analyzer before it starts.
    #[default]
    #[serde(rename = "file")]
    File,

    /// A URL opened in a browser.
    #[serde(rename = "url")]
    Url,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Analysis {
    /// Task identifier assigned by the host.
    pub id: u64,

    pub category: Category,

    /// URL for [`Category::Url`] analyses. File analyses use `file_name`.
    pub target: String,

    /// Name of the submitted file inside the temp directory.
    pub file_name: String,

    /// Output of the host's file type detection.
    pub file_type: String,

    /// Analysis package to run. When unset a package is inferred from
    /// `category` and `file_type`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,

    /// Wall clock limit for the whole analysis. **Measured in seconds**.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub timeout: Duration,

    /// Keep running for the full timeout even when every monitored process
    /// has exited.
    pub enforce_timeout: bool,

    /// Kill monitored processes that are still alive at shutdown.
    pub terminate_processes: bool,

    /// Time the VM clock is set to before the sample runs, formatted as
    /// [`CLOCK_FORMAT`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock: Option<String>,

    /// Tags of the auxiliary modules to start alongside the package.
    pub auxiliary: Vec<String>,
}

impl Default for Analysis {
    fn default() -> Self {
        Self {
            id: 0,
            category: Category::File,
            target: String::new(),
            file_name: String::new(),
            file_type: String::new(),
            package: None,
            timeout: Duration::from_secs(120),
            enforce_timeout: false,
            terminate_processes: false,
            clock: None,
            auxiliary: Vec::new(),
        }
    }
}

impl Analysis {
    /// Parse the configured VM clock, if any.
    pub fn clock(&self) -> Result<Option<NaiveDateTime>, Error> {
        let Some(value) = self.clock.as_deref() else {
            return Ok(None);
        };
        NaiveDateTime::parse_from_str(value, CLOCK_FORMAT)
            .map(Some)
            .map_err(|source| Error::InvalidClock {
                value: value.to_owned(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn clock_parses_host_format() {
        let analysis = Analysis {
            clock: Some("20240131T13:45:07".into()),
            ..Default::default()
        };
        let clock = analysis.clock().unwrap().unwrap();
        assert_eq!((clock.year(), clock.month(), clock.day()), (2024, 1, 31));
        assert_eq!((clock.hour(), clock.minute(), clock.second()), (13, 45, 7));
    }

    #[test]
    fn clock_rejects_garbage() {
        let analysis = Analysis {
            clock: Some("yesterday".into()),
            ..Default::default()
        };
        assert!(matches!(
            analysis.clock(),
            Err(Error::InvalidClock { ref value, .. }) if value == "yesterday"
        ));
    }

    #[test]
    fn missing_clock_is_not_an_error() {
        assert_eq!(Analysis::default().clock().unwrap(), None);
    }
}
