//! Injection and memory dumps through the out-of-process loader.
//!
//! The loader binary comes in two flavours, `loader.exe` and
//! `loader_x64.exe`, and always matches the bitness of the target. It is
//! invoked as:
//!
//! ```text
//! loader inject <pid> <tid> <dll>
//! loader dump <pid> <output>
//! ```
//!
//! `inject` exits with 0 after creating a remote thread and 1 after queueing
//! an APC into a suspended thread. `dump` exits with 1 on success.

#![forbid(unsafe_code)]

use crate::inject_config::{InjectionConfig, InjectionSettings, random_string};
use crate::process::ProcessControl;
use crate::protocol::LogRelays;
use crate::sink::ResultSink;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

const DLL_32: &str = "monitor.dll";
const DLL_64: &str = "monitor_x64.dll";
const LOADER_32: &str = "loader.exe";
const LOADER_64: &str = "loader_x64.exe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bitness {
    X86,
    X64,
}

impl Bitness {
    fn of(process: &mut dyn ProcessControl) -> Self {
        if process.is_64bit() { Self::X64 } else { Self::X86 }
    }

    fn dll(self) -> &'static str {
        match self {
            Self::X86 => DLL_32,
            Self::X64 => DLL_64,
        }
    }

    fn loader(self) -> &'static str {
        match self {
            Self::X86 => LOADER_32,
            Self::X64 => LOADER_64,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::X86 => "32-bit",
            Self::X64 => "64-bit",
        }
    }
}

/// Puts the instrumentation into processes and dumps their memory.
pub trait Injector: Send + Sync {
    /// Load the instrumentation into `process`.
    ///
    /// `dll` overrides the bitness default. `interest` is the file the
    /// analysis is about. `nosleepskip` forces the instrumentation to keep
    /// real sleeps. Never retries.
    fn inject(
        &self,
        process: &mut dyn ProcessControl,
        dll: Option<&str>,
        interest: &str,
        nosleepskip: bool,
    ) -> bool;

    /// Dump the memory of `process` and upload it as `memory/<pid>.dmp`.
    fn dump_memory(&self, process: &mut dyn ProcessControl, sink: &dyn ResultSink) -> bool;
}

pub struct Loader {
    settings: InjectionSettings,
    bin: PathBuf,
    dll: PathBuf,
    config_dir: PathBuf,
    memory: PathBuf,
    first_process: AtomicBool,
    relays: Option<Arc<LogRelays>>,
}

impl Loader {
    pub fn new(
        settings: InjectionSettings,
        bin: impl Into<PathBuf>,
        dll: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
        memory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            settings,
            bin: bin.into(),
            dll: dll.into(),
            config_dir: config_dir.into(),
            memory: memory.into(),
            first_process: AtomicBool::new(true),
            relays: None,
        }
    }

    /// Relay the behaviour log of every injected process through `relays`.
    pub fn with_relays(mut self, relays: Arc<LogRelays>) -> Self {
        self.relays = Some(relays);
        self
    }

    /// Whether no configuration has been written yet.
    pub fn is_first_process(&self) -> bool {
        self.first_process.load(Ordering::Acquire)
    }
}

impl Injector for Loader {
    fn inject(
        &self,
        process: &mut dyn ProcessControl,
        dll: Option<&str>,
        interest: &str,
        nosleepskip: bool,
    ) -> bool {
        let pid = process.pid();
        if pid == 0 {
            warn!("no valid pid specified, injection aborted");
            return false;
        }
        if !process.is_alive() {
            warn!(pid, "the process is not alive, injection aborted");
            return false;
        }

        let bitness = Bitness::of(process);
        let dll = randomize(&self.dll.join(dll.unwrap_or(bitness.dll())), "dll");
        if !dll.exists() {
            warn!(pid, dll = %dll.display(), "no valid DLL to inject, injection aborted");
            return false;
        }

        let logserver = format!("\\\\.\\PIPE\\{}", random_string(8, 12));
        if let Some(relays) = &self.relays {
            if let Err(err) = relays.start(&logserver) {
                warn!(pid, %err, "unable to start the log relay");
            }
        }

        let first = self.first_process.swap(false, Ordering::AcqRel);
        let config =
            InjectionConfig::new(&self.settings, pid, &logserver, interest, first, nosleepskip);
        if let Err(err) = config.write(&self.config_dir, pid) {
            error!(pid, %err, "failed to write injection configuration");
            return false;
        }

        let tid = process.thread_id().unwrap_or(0);
        if tid != 0 || process.is_suspended() {
            debug!(pid, "using QueueUserAPC injection");
        } else {
            debug!(pid, "using CreateRemoteThread injection");
        }

        let loader = randomize(&self.bin.join(bitness.loader()), "exe");
        if !loader.exists() {
            error!(
                loader = bitness.loader(),
                bin = %self.bin.display(),
                "loader binary missing, cannot analyze {} processes",
                bitness.label()
            );
            return false;
        }

        let status = Command::new(&loader)
            .arg("inject")
            .arg(pid.to_string())
            .arg(tid.to_string())
            .arg(&dll)
            .status();
        match status.map(|status| status.code()) {
            Ok(Some(0)) => {
                info!(pid, bits = bitness.label(), "injected into process");
                true
            }
            Ok(Some(1)) => {
                info!(pid, bits = bitness.label(), "injected into suspended process");
                true
            }
            Ok(code) => {
                error!(pid, bits = bitness.label(), ?code, "unable to inject into process");
                false
            }
            Err(err) => {
                error!(pid, loader = %loader.display(), %err, "failed to run loader");
                false
            }
        }
    }

    fn dump_memory(&self, process: &mut dyn ProcessControl, sink: &dyn ResultSink) -> bool {
        let pid = process.pid();
        if pid == 0 {
            warn!("no valid pid specified, memory dump aborted");
            return false;
        }
        if !process.is_alive() {
            warn!(pid, "the process is not alive, memory dump aborted");
            return false;
        }

        let bitness = Bitness::of(process);
        let loader = self.bin.join(bitness.loader());
        if !loader.exists() {
            error!(loader = %loader.display(), "loader binary missing, cannot dump memory");
            return false;
        }

        let output = self.memory.join(format!("{pid}.dmp"));
        let status = Command::new(&loader)
            .arg("dump")
            .arg(pid.to_string())
            .arg(&output)
            .status();
        match status.map(|status| status.code()) {
            Ok(Some(1)) => info!(pid, bits = bitness.label(), "dumped process memory"),
            Ok(code) => {
                error!(pid, bits = bitness.label(), ?code, "unable to dump process memory");
                return false;
            }
            Err(err) => {
                error!(pid, %err, "failed to run loader");
                return false;
            }
        }

        if let Err(err) = sink.upload_file(&output, &format!("memory/{pid}.dmp")) {
            warn!(pid, %err, "memory dump upload failed");
            return false;
        }
        info!(pid, "memory dump completed");
        true
    }
}

/// Copy `path` to a random name in the same directory, falling back to the
/// original when the copy fails.
fn randomize(path: &Path, ext: &str) -> PathBuf {
    let Some(dir) = path.parent() else {
        return path.to_path_buf();
    };
    let copy = dir.join(format!("{}.{ext}", random_string(6, 6)));
    match std::fs::copy(path, &copy) {
        Ok(_) => copy,
        Err(_) => path.to_path_buf(),
    }
}
