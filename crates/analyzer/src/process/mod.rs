//! Process control primitives.
//!
//! [`ProcessControl`] is one opened (or spawned) process, optionally with a
//! thread. Every native handle it holds is owned by that value and released
//! when it is dropped. [`Platform`] creates them and covers the few
//! machine-wide operations the analyzer needs.
//!
//! Failures of native calls are logged and reported as `false`/`None`; the
//! caller decides whether that is fatal. It almost never is.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{UnixPlatform as NativePlatform, UnixProcess};
#[cfg(windows)]
pub use windows::{ProcessHandle, WindowsPlatform as NativePlatform};

use crate::error::Error;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::info;

pub trait ProcessControl: Send {
    fn pid(&self) -> u32;

    fn thread_id(&self) -> Option<u32>;

    /// Whether the main thread was created suspended and not resumed yet.
    fn is_suspended(&self) -> bool;

    /// Acquire native handles for the known pid and thread id. Returns
    /// `false` when neither id is known or nothing could be opened.
    fn open(&mut self) -> bool;

    fn is_alive(&mut self) -> bool;

    /// Whether the OS protects this process from termination.
    fn is_critical(&mut self) -> bool;

    fn filepath(&mut self) -> Option<PathBuf>;

    fn parent_pid(&mut self) -> Option<u32>;

    fn is_64bit(&mut self) -> bool;

    /// Resume the thread suspended at creation after waiting `delay`.
    fn resume(&mut self, delay: Duration) -> bool;

    /// Kill the process unconditionally.
    fn kill(&mut self) -> bool;

    /// Signal `<prefix><pid>` so the instrumentation can flush its buffers.
    fn set_terminate_event(&mut self, prefix: &str) -> bool;

    /// Kill the process unless it is critical to the OS.
    fn terminate(&mut self) -> bool {
        if self.is_critical() {
            info!(pid = self.pid(), "not terminating critical process");
            return false;
        }
        self.kill()
    }
}

pub trait Platform: Send + Sync {
    /// Wrap an existing process. Handles are opened lazily.
    fn open(&self, pid: u32, thread_id: Option<u32>, suspended: bool) -> Box<dyn ProcessControl>;

    /// Spawn `path` with `args` in `cwd`, optionally with its main thread
    /// suspended.
    fn execute(
        &self,
        path: &Path,
        args: Option<&str>,
        cwd: &Path,
        suspended: bool,
    ) -> Result<Box<dyn ProcessControl>, Error>;

    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    /// Pids of running processes whose image name matches one of `names`,
    /// compared case-insensitively.
    fn pids_by_name(&self, names: &[String]) -> Vec<u32> {
        pids_by_name(names)
    }

    fn grant_debug_privilege(&self) -> Result<(), Error>;

    fn set_clock(&self, clock: NaiveDateTime) -> Result<(), Error>;

    /// Create the named marker other in-guest helpers poll for at shutdown.
    fn create_shutdown_marker(&self, name: &str) -> bool;

    /// Set an existing named event. `false` when it does not exist.
    fn signal_event(&self, name: &str) -> bool;

    /// Switch a service to run in its own process.
    fn configure_service(&self, name: &str) -> bool;
}

/// Enumerate processes by image name through `sysinfo`.
pub fn pids_by_name(names: &[String]) -> Vec<u32> {
    let mut system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new()),
    );
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(_, process)| {
            let name = process.name().to_string_lossy().to_lowercase();
            names.iter().any(|wanted| wanted.eq_ignore_ascii_case(&name))
        })
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort_unstable();
    pids
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_found_by_name() {
        let exe = std::env::current_exe().unwrap();
        let name = exe.file_name().unwrap().to_string_lossy().to_uppercase();
        let pids = pids_by_name(&[name]);
        // sysinfo truncates long names on some kernels, so only check when
        // the name is short enough to be reported in full.
        if exe.file_name().unwrap().len() < 15 {
            assert!(pids.contains(&std::process::id()));
        }
    }

    #[test]
    fn unknown_names_match_nothing() {
        assert!(pids_by_name(&["definitely-not-running.exe".into()]).is_empty());
    }
}
