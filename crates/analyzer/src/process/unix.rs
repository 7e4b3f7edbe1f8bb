//! Process control for development hosts.
//!
//! Enough to run the orchestrator and the notification server end to end.
//! Injection targets Windows only, so everything tied to it reports
//! "unsupported" through the usual `false` return.

#![forbid(unsafe_code)]

use super::{Platform, ProcessControl};
use crate::error::Error;
use chrono::NaiveDateTime;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

pub struct UnixProcess {
    pid: u32,
    thread_id: Option<u32>,
    suspended: bool,
    /// Set when we started the process and are the ones to reap it.
    child: Option<Child>,
}

impl UnixProcess {
    pub fn new(pid: u32, thread_id: Option<u32>, suspended: bool) -> Self {
        Self {
            pid,
            thread_id,
            suspended,
            child: None,
        }
    }

    fn reaped(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => {
                debug!(pid = self.pid, %status, "reaped process");
                self.child = None;
                true
            }
            _ => false,
        }
    }

    fn inspect<T>(&self, f: impl FnOnce(&sysinfo::Process) -> T) -> Option<T> {
        let pid = sysinfo::Pid::from_u32(self.pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_exe(sysinfo::UpdateKind::OnlyIfNotSet),
        );
        system.process(pid).map(f)
    }

    fn signal(&self, signal: Signal) -> bool {
        let Ok(pid) = i32::try_from(self.pid) else {
            return false;
        };
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => true,
            Err(err) => {
                debug!(pid = self.pid, %err, ?signal, "failed to signal process");
                false
            }
        }
    }
}

impl ProcessControl for UnixProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn thread_id(&self) -> Option<u32> {
        self.thread_id
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn open(&mut self) -> bool {
        self.pid != 0 && self.inspect(|_| ()).is_some()
    }

    fn is_alive(&mut self) -> bool {
        if self.reaped() {
            return false;
        }
        self.inspect(|process| {
            !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
        })
        .unwrap_or(false)
    }

    fn is_critical(&mut self) -> bool {
        self.pid == 1
    }

    fn filepath(&mut self) -> Option<PathBuf> {
        self.inspect(|process| process.exe().map(Path::to_path_buf))
            .flatten()
    }

    fn parent_pid(&mut self) -> Option<u32> {
        self.inspect(|process| process.parent().map(|pid| pid.as_u32()))
            .flatten()
    }

    fn is_64bit(&mut self) -> bool {
        cfg!(target_pointer_width = "64")
    }

    fn resume(&mut self, delay: Duration) -> bool {
        if !self.suspended {
            warn!(pid = self.pid, "the process is not suspended");
            return false;
        }
        std::thread::sleep(delay);
        if !self.signal(Signal::SIGCONT) {
            error!(pid = self.pid, "failed to resume process");
            return false;
        }
        self.suspended = false;
        info!(pid = self.pid, "successfully resumed process");
        true
    }

    fn kill(&mut self) -> bool {
        let killed = self.signal(Signal::SIGKILL);
        if killed {
            if let Some(mut child) = self.child.take() {
                if let Err(err) = child.wait() {
                    warn!(pid = self.pid, %err, "failed to reap terminated process");
                }
            }
            info!(pid = self.pid, "successfully terminated process");
        } else {
            error!(pid = self.pid, "failed to terminate process");
        }
        killed
    }

    fn set_terminate_event(&mut self, prefix: &str) -> bool {
        debug!(pid = self.pid, prefix, "terminate events are not supported");
        false
    }
}

impl Drop for UnixProcess {
    fn drop(&mut self) {
        if self.reaped() {
            return;
        }
        // Still running: whoever holds the pid later cannot wait on it.
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = self.pid;
        let spawned = std::thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => debug!(pid, %status, "reaped process"),
                Err(err) => warn!(pid, %err, "failed to reap process"),
            });
        if let Err(err) = spawned {
            warn!(pid, %err, "unable to start reaper thread");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UnixPlatform;

impl Platform for UnixPlatform {
    fn open(&self, pid: u32, thread_id: Option<u32>, suspended: bool) -> Box<dyn ProcessControl> {
        Box::new(UnixProcess::new(pid, thread_id, suspended))
    }

    fn execute(
        &self,
        path: &Path,
        args: Option<&str>,
        cwd: &Path,
        suspended: bool,
    ) -> Result<Box<dyn ProcessControl>, Error> {
        if !path.is_file() {
            return Err(Error::NotExecutable(path.to_path_buf()));
        }

        let mut command = Command::new(path);
        command.current_dir(cwd);
        if let Some(args) = args {
            command.args(args.split_whitespace());
        }
        let child = command.spawn().map_err(|err| {
            let code = err.raw_os_error().and_then(|c| u32::try_from(c).ok()).unwrap_or(0);
            error!(path = %path.display(), %err, "failed to execute process");
            Error::Spawn {
                path: path.to_path_buf(),
                code,
            }
        })?;

        let mut process = UnixProcess::new(child.id(), None, false);
        process.child = Some(child);
        // No suspended creation here; stop it right away instead.
        if suspended && process.signal(Signal::SIGSTOP) {
            process.suspended = true;
        }
        info!(
            path = %path.display(),
            pid = process.pid,
            suspended = process.suspended,
            "successfully executed process"
        );
        Ok(Box::new(process))
    }

    fn grant_debug_privilege(&self) -> Result<(), Error> {
        Ok(())
    }

    fn set_clock(&self, _clock: NaiveDateTime) -> Result<(), Error> {
        Err(Error::Unsupported("setting the system clock"))
    }

    fn create_shutdown_marker(&self, name: &str) -> bool {
        let marker = std::env::temp_dir().join(name.replace(['\\', '/'], "_"));
        match std::fs::write(&marker, b"") {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %marker.display(), %err, "failed to create shutdown marker");
                false
            }
        }
    }

    fn signal_event(&self, name: &str) -> bool {
        debug!(event = name, "named events are not supported");
        false
    }

    fn configure_service(&self, name: &str) -> bool {
        debug!(service = name, "services are not supported");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive_and_not_critical() {
        let mut process = UnixProcess::new(std::process::id(), None, false);
        assert!(process.open());
        assert!(process.is_alive());
        assert!(!process.is_critical());
        assert!(process.parent_pid().is_some());
    }

    #[test]
    fn init_is_critical_and_never_terminated() {
        let mut init = UnixProcess::new(1, None, false);
        assert!(init.is_critical());
        assert!(!init.terminate());
    }

    #[test]
    fn resume_requires_suspension() {
        let mut process = UnixProcess::new(std::process::id(), None, false);
        assert!(!process.resume(Duration::ZERO));
    }

    #[test]
    fn missing_binary_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = UnixPlatform
            .execute(&missing, None, dir.path(), false)
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotExecutable(_)));
    }

    #[test]
    fn spawned_process_can_be_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let sleep = Path::new("/bin/sleep");
        if !sleep.is_file() {
            return;
        }
        let mut process = UnixPlatform
            .execute(sleep, Some("30"), dir.path(), false)
            .unwrap();
        let pid = process.pid();
        assert!(process.is_alive());
        assert!(process.terminate());
        assert!(!process.is_alive());
        assert!(UnixProcess::new(pid, None, false).inspect(|_| ()).is_none());
    }

    #[test]
    fn dropped_handle_still_reaps_its_child() {
        let dir = tempfile::tempdir().unwrap();
        let true_bin = Path::new("/bin/true");
        if !true_bin.is_file() {
            return;
        }
        let process = UnixPlatform
            .execute(true_bin, None, dir.path(), false)
            .unwrap();
        let pid = process.pid();
        drop(process);

        let remains = UnixProcess::new(pid, None, false);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while remains.inspect(|_| ()).is_some() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(remains.inspect(|_| ()).is_none(), "{pid} left as a zombie");
    }
}
