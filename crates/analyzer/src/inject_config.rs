//! Per-process configuration read by the injected instrumentation.
//!
//! The file is a flat list of `key=value` lines, written to
//! `<injection_config>/<pid>.ini` right before the loader runs.

#![forbid(unsafe_code)]

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use config::{Host, Options};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng;
use rand::distr::Alphabetic;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Values shared by every configuration written during one run.
#[derive(Debug, Clone)]
pub struct InjectionSettings {
    pub host_ip: String,
    pub host_port: u16,
    pub pipe: String,
    pub results: PathBuf,
    pub analyzer: PathBuf,
    /// Milliseconds added to the uptime the instrumentation reports.
    pub startup_time: u64,
    pub shutdown_marker: String,
    pub terminate_event: String,
    pub options: Options,
}

impl InjectionSettings {
    pub fn new(host: &Host, pipe: impl Into<String>, options: Options) -> Self {
        Self {
            host_ip: host.ip.clone(),
            host_port: host.port,
            pipe: pipe.into(),
            results: PathBuf::new(),
            analyzer: PathBuf::new(),
            startup_time: random_startup_time(),
            shutdown_marker: String::new(),
            terminate_event: String::new(),
            options,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionConfig {
    entries: Vec<(&'static str, String)>,
}

impl InjectionConfig {
    pub fn new(
        settings: &InjectionSettings,
        pid: u32,
        logserver: &str,
        interest: &str,
        first_process: bool,
        nosleepskip: bool,
    ) -> Self {
        let options = &settings.options;
        let mut entries = vec![
            ("host-ip", settings.host_ip.clone()),
            ("host-port", settings.host_port.to_string()),
            ("pipe", settings.pipe.clone()),
            ("logserver", logserver.to_owned()),
            ("results", settings.results.display().to_string()),
            ("analyzer", settings.analyzer.display().to_string()),
            ("first-process", u8::from(first_process).to_string()),
            ("startup-time", settings.startup_time.to_string()),
            ("file-of-interest", interest.to_owned()),
            ("shutdown-mutex", settings.shutdown_marker.clone()),
            ("terminate-event", format!("{}{pid}", settings.terminate_event)),
        ];

        if nosleepskip {
            entries.push(("force-sleepskip", "0".into()));
        } else if let Some(value) = options.get("force-sleepskip") {
            entries.push(("force-sleepskip", value.into()));
        }
        for key in ["full-logs", "no-stealth"] {
            if let Some(value) = options.get(key) {
                entries.push((key, value.into()));
            }
        }
        if !options.contains("norefer") {
            entries.push(("referrer", referrer_url(interest)));
        }

        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            let _ = writeln!(out, "{key}={value}");
        }
        out
    }

    /// Write the configuration for `pid` into `dir` and return its path.
    pub fn write(&self, dir: &Path, pid: u32) -> std::io::Result<PathBuf> {
        let path = dir.join(format!("{pid}.ini"));
        std::fs::write(&path, self.render())?;
        Ok(path)
    }
}

/// A search engine redirect pointing at `interest`, or an empty string when
/// `interest` is not a URL.
pub fn referrer_url(interest: &str) -> String {
    if !interest.contains("://") {
        return String::new();
    }

    let mut rng = rand::rng();
    let item = rng.random_range(1..=30);
    let ved_len = rng.random_range(5..=8) * 3;
    let ved = format!("0CCEQfj{}", URL_SAFE.encode(random_string(ved_len, ved_len)));
    let ei = URL_SAFE.encode(random_string(12, 12));
    let usg = format!("AFQj{}", URL_SAFE.encode(random_string(12, 12)));
    let url = utf8_percent_encode(interest, NON_ALPHANUMERIC);

    format!(
        "http://www.google.com/url?sa=t&rct=j&q=&esrc=s&source=web&cd={item}&ved={ved}&url={url}&ei={ei}&usg={usg}"
    )
}

/// Startup delay reported to the sample: 20 to 600 minutes, in 20 minute
/// steps, as milliseconds.
pub fn random_startup_time() -> u64 {
    rand::rng().random_range(1..=30u64) * 20 * 60 * 1000
}

/// Random ASCII letters, between `min` and `max` characters long.
pub fn random_string(min: usize, max: usize) -> String {
    let mut rng = rand::rng();
    let len = rng.random_range(min..=max.max(min));
    (&mut rng)
        .sample_iter(Alphabetic)
        .take(len)
        .map(char::from)
        .collect()
}
