#![deny(unsafe_code)]

use super::{Platform, ProcessControl};
use crate::error::Error;
use chrono::NaiveDateTime;
use std::ffi::{OsStr, OsString, c_void};
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::ptr::{null, null_mut};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use windows_sys::Wdk::System::Threading::NtQueryInformationProcess;
use windows_sys::Win32::Foundation::{BOOL, CloseHandle, ERROR_SUCCESS, GetLastError, HANDLE, LUID};
use windows_sys::Win32::Security::{
    AdjustTokenPrivileges, LUID_AND_ATTRIBUTES, LookupPrivilegeValueW, SE_PRIVILEGE_ENABLED,
    TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
};
use windows_sys::Win32::System::Threading::{
    CREATE_NEW_CONSOLE, CREATE_SUSPENDED, CreateMutexW, CreateProcessW, EVENT_MODIFY_STATE,
    GetCurrentProcess, GetExitCodeProcess, IsWow64Process, OpenEventW, OpenProcess,
    OpenProcessToken, OpenThread, PROCESS_ALL_ACCESS, PROCESS_INFORMATION, PROCESS_NAME_WIN32,
    QueryFullProcessImageNameW, ResumeThread, STARTF_USESHOWWINDOW, STARTUPINFOW, SetEvent,
    THREAD_ALL_ACCESS, TerminateProcess,
};

const STILL_ACTIVE: u32 = 259;
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
const SW_SHOWNORMAL: u16 = 1;

const PROCESS_BASIC_INFORMATION_CLASS: i32 = 0;
const PROCESS_BREAK_ON_TERMINATION_CLASS: i32 = 29;

fn wide(value: impl AsRef<OsStr>) -> Vec<u16> {
    value
        .as_ref()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

#[allow(unsafe_code)]
fn last_error() -> u32 {
    unsafe { GetLastError() }
}

/// A kernel handle closed on drop, unless it is a pseudo handle.
struct OwnedHandle {
    raw: HANDLE,
    close: bool,
}

// SAFETY: kernel handles are process-wide and not bound to the opening thread.
#[allow(unsafe_code)]
unsafe impl Send for OwnedHandle {}

impl OwnedHandle {
    fn owned(raw: HANDLE) -> Option<Self> {
        (!raw.is_null()).then_some(Self { raw, close: true })
    }

    fn pseudo(raw: HANDLE) -> Self {
        Self { raw, close: false }
    }
}

impl Drop for OwnedHandle {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        if self.close {
            unsafe {
                CloseHandle(self.raw);
            }
        }
    }
}

/// A Windows process and optionally its main thread.
pub struct ProcessHandle {
    pid: u32,
    thread_id: Option<u32>,
    process: Option<OwnedHandle>,
    thread: Option<OwnedHandle>,
    suspended: bool,
}

impl ProcessHandle {
    pub fn new(pid: u32, thread_id: Option<u32>, suspended: bool) -> Self {
        Self {
            pid,
            thread_id,
            process: None,
            thread: None,
            suspended,
        }
    }

    fn process_handle(&mut self) -> Option<HANDLE> {
        if self.process.is_none() {
            self.open();
        }
        self.process.as_ref().map(|handle| handle.raw)
    }

    #[allow(unsafe_code)]
    fn query_information<T>(&mut self, class: i32, out: &mut T) -> bool {
        let Some(process) = self.process_handle() else {
            return false;
        };
        let size = u32::try_from(std::mem::size_of::<T>()).unwrap_or(u32::MAX);
        let mut returned = 0u32;
        let status = unsafe {
            NtQueryInformationProcess(
                process,
                class,
                std::ptr::from_mut(out).cast::<c_void>(),
                size,
                &mut returned,
            )
        };
        status >= 0 && returned == size
    }
}

impl ProcessControl for ProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn thread_id(&self) -> Option<u32> {
        self.thread_id
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    #[allow(unsafe_code)]
    fn open(&mut self) -> bool {
        if self.pid == 0 && self.thread_id.is_none() {
            return false;
        }

        if self.pid != 0 && self.process.is_none() {
            if self.pid == std::process::id() {
                self.process = Some(OwnedHandle::pseudo(unsafe { GetCurrentProcess() }));
            } else {
                let raw = unsafe { OpenProcess(PROCESS_ALL_ACCESS, 0, self.pid) };
                self.process = OwnedHandle::owned(raw);
                if self.process.is_none() {
                    debug!(pid = self.pid, error = last_error(), "failed to open process");
                }
            }
        }

        if let Some(tid) = self.thread_id
            && self.thread.is_none()
        {
            let raw = unsafe { OpenThread(THREAD_ALL_ACCESS, 0, tid) };
            self.thread = OwnedHandle::owned(raw);
            if self.thread.is_none() {
                debug!(tid, error = last_error(), "failed to open thread");
            }
        }

        self.process.is_some() || self.thread.is_some()
    }

    #[allow(unsafe_code)]
    fn is_alive(&mut self) -> bool {
        let Some(process) = self.process_handle() else {
            return false;
        };
        let mut code = 0u32;
        let ok = unsafe { GetExitCodeProcess(process, &mut code) };
        ok != 0 && code == STILL_ACTIVE
    }

    fn is_critical(&mut self) -> bool {
        let mut flag = 0u32;
        self.query_information(PROCESS_BREAK_ON_TERMINATION_CLASS, &mut flag) && flag != 0
    }

    #[allow(unsafe_code)]
    fn filepath(&mut self) -> Option<PathBuf> {
        let process = self.process_handle()?;
        let mut buffer = vec![0u16; 32_768];
        let mut size = u32::try_from(buffer.len()).unwrap_or(u32::MAX);
        let ok = unsafe {
            QueryFullProcessImageNameW(process, PROCESS_NAME_WIN32, buffer.as_mut_ptr(), &mut size)
        };
        if ok == 0 {
            debug!(pid = self.pid, error = last_error(), "failed to query image path");
            return None;
        }
        buffer.truncate(size as usize);
        Some(PathBuf::from(OsString::from_wide(&buffer)))
    }

    fn parent_pid(&mut self) -> Option<u32> {
        // PROCESS_BASIC_INFORMATION, the parent pid is the last field.
        let mut info = [0usize; 6];
        if !self.query_information(PROCESS_BASIC_INFORMATION_CLASS, &mut info) {
            return None;
        }
        u32::try_from(info[5]).ok()
    }

    #[allow(unsafe_code)]
    fn is_64bit(&mut self) -> bool {
        if !os_is_64bit() {
            return false;
        }
        let Some(process) = self.process_handle() else {
            return false;
        };
        let mut wow64: BOOL = 0;
        let ok = unsafe { IsWow64Process(process, &mut wow64) };
        ok != 0 && wow64 == 0
    }

    #[allow(unsafe_code)]
    fn resume(&mut self, delay: Duration) -> bool {
        if !self.suspended {
            warn!(pid = self.pid, "the process is not suspended");
            return false;
        }
        if self.thread.is_none() {
            self.open();
        }
        let Some(thread) = self.thread.as_ref() else {
            warn!(pid = self.pid, "no valid thread handle to resume");
            return false;
        };

        std::thread::sleep(delay);

        if unsafe { ResumeThread(thread.raw) } == u32::MAX {
            error!(pid = self.pid, error = last_error(), "failed to resume process");
            return false;
        }
        self.suspended = false;
        info!(pid = self.pid, "successfully resumed process");
        true
    }

    #[allow(unsafe_code)]
    fn kill(&mut self) -> bool {
        let Some(process) = self.process_handle() else {
            return false;
        };
        if unsafe { TerminateProcess(process, 1) } == 0 {
            error!(pid = self.pid, error = last_error(), "failed to terminate process");
            return false;
        }
        info!(pid = self.pid, "successfully terminated process");
        true
    }

    fn set_terminate_event(&mut self, prefix: &str) -> bool {
        let name = format!("{prefix}{}", self.pid);
        let signalled = signal_named_event(&name);
        if signalled {
            info!(pid = self.pid, "terminate event set");
        } else {
            debug!(pid = self.pid, event = %name, "terminate event not found");
        }
        signalled
    }
}

#[allow(unsafe_code)]
fn os_is_64bit() -> bool {
    if cfg!(target_pointer_width = "64") {
        return true;
    }
    let mut wow64: BOOL = 0;
    let ok = unsafe { IsWow64Process(GetCurrentProcess(), &mut wow64) };
    ok != 0 && wow64 != 0
}

#[allow(unsafe_code)]
fn signal_named_event(name: &str) -> bool {
    let name = wide(name);
    let event = unsafe { OpenEventW(EVENT_MODIFY_STATE, 0, name.as_ptr()) };
    let Some(event) = OwnedHandle::owned(event) else {
        return false;
    };
    unsafe { SetEvent(event.raw) != 0 }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsPlatform;

impl Platform for WindowsPlatform {
    fn open(&self, pid: u32, thread_id: Option<u32>, suspended: bool) -> Box<dyn ProcessControl> {
        Box::new(ProcessHandle::new(pid, thread_id, suspended))
    }

    #[allow(unsafe_code)]
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

        let mut command_line = format!("\"{}\"", path.display());
        if let Some(args) = args {
            command_line.push(' ');
            command_line.push_str(args);
        }
        let application = wide(path);
        let mut command_line = wide(command_line);
        let directory = wide(cwd);

        let mut flags = CREATE_NEW_CONSOLE;
        if suspended {
            flags |= CREATE_SUSPENDED;
        }

        let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup.cb = u32::try_from(std::mem::size_of::<STARTUPINFOW>()).unwrap_or(u32::MAX);
        startup.dwFlags = STARTF_USESHOWWINDOW;
        startup.wShowWindow = SW_SHOWNORMAL;
        let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        let ok = unsafe {
            CreateProcessW(
                application.as_ptr(),
                command_line.as_mut_ptr(),
                null(),
                null(),
                0,
                flags,
                null(),
                directory.as_ptr(),
                &startup,
                &mut info,
            )
        };
        if ok == 0 {
            let code = last_error();
            error!(path = %path.display(), code, "failed to execute process");
            return Err(Error::Spawn {
                path: path.to_path_buf(),
                code,
            });
        }

        info!(
            path = %path.display(),
            pid = info.dwProcessId,
            suspended,
            "successfully executed process"
        );
        Ok(Box::new(ProcessHandle {
            pid: info.dwProcessId,
            thread_id: Some(info.dwThreadId),
            process: OwnedHandle::owned(info.hProcess),
            thread: OwnedHandle::owned(info.hThread),
            suspended,
        }))
    }

    #[allow(unsafe_code)]
    fn grant_debug_privilege(&self) -> Result<(), Error> {
        let mut token: HANDLE = null_mut();
        let ok = unsafe {
            OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
                &mut token,
            )
        };
        let Some(token) = OwnedHandle::owned(token).filter(|_| ok != 0) else {
            return Err(Error::Privilege(last_error()));
        };

        let name = wide("SeDebugPrivilege");
        let mut luid = LUID {
            LowPart: 0,
            HighPart: 0,
        };
        if unsafe { LookupPrivilegeValueW(null(), name.as_ptr(), &mut luid) } == 0 {
            return Err(Error::Privilege(last_error()));
        }

        let privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };
        let ok = unsafe {
            AdjustTokenPrivileges(token.raw, 0, &privileges, 0, null_mut(), null_mut())
        };
        // Succeeds even when the privilege was not assigned.
        let code = last_error();
        if ok == 0 || code != ERROR_SUCCESS {
            return Err(Error::Privilege(code));
        }
        debug!("debug privilege granted");
        Ok(())
    }

    fn set_clock(&self, clock: NaiveDateTime) -> Result<(), Error> {
        let date = clock.format("%m-%d-%y").to_string();
        let time = clock.format("%H:%M:%S").to_string();
        for (command, value) in [("date", date), ("time", time)] {
            let status = Command::new("cmd")
                .args(["/c", &format!("echo:|{command} {value}")])
                .creation_flags(CREATE_NO_WINDOW)
                .status()?;
            if !status.success() {
                warn!(command, %value, "failed to set the clock");
            }
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn create_shutdown_marker(&self, name: &str) -> bool {
        let name = wide(name);
        let mutex = unsafe { CreateMutexW(null(), 0, name.as_ptr()) };
        // Kept open until the agent exits so helpers can see it.
        !mutex.is_null()
    }

    fn signal_event(&self, name: &str) -> bool {
        signal_named_event(name)
    }

    fn configure_service(&self, name: &str) -> bool {
        match Command::new("sc")
            .args(["config", name, "type=", "own"])
            .creation_flags(CREATE_NO_WINDOW)
            .status()
        {
            Ok(status) => status.success(),
            Err(err) => {
                warn!(service = name, %err, "failed to run sc");
                false
            }
        }
    }
}
