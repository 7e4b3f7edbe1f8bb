use super::command::{Command, LogLevel};
use crate::context::Context;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause after injecting the service host so it can load the
/// instrumentation before the service starts.
const SERVICE_HOST_SETTLE: Duration = Duration::from_secs(1);

pub const OK: &[u8] = b"OK";

/// Per-run values the handlers need besides the shared [`Context`].
#[derive(Debug, Clone, Default)]
pub struct DispatchSettings {
    /// Instrumentation module chosen at submission, if any.
    pub dll: Option<String>,
    /// Dump memory of processes announced as being killed.
    pub procmemdump: bool,
    /// Prefix of the per-pid termination events.
    pub terminate_event: String,
    /// Pid of the service host, injected on the first service start.
    pub service_host: Option<u32>,
}

/// Applies notifications to the registry. Blocking: it calls native process
/// APIs while holding the registry lock.
#[derive(Clone)]
pub struct Dispatcher {
    ctx: Context,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(ctx: Context, settings: DispatchSettings) -> Self {
        Self { ctx, settings }
    }

    /// Handle one command and return the response for the sender.
    pub fn dispatch(&self, command: Command) -> Vec<u8> {
        match command {
            Command::Log { level, message } => forward_log(level, &message),
            Command::GetPids => return self.hidden_pids(),
            Command::Process {
                pid,
                thread_id,
                suspended,
            } => self.process(pid, thread_id, suspended),
            Command::KernelProcess(pid) => self.kernel_process(pid),
            Command::KernelTerminate(pid) => {
                if pid != 0 {
                    self.ctx.registry.lock().remove_pid(pid);
                }
            }
            Command::KernelSubvert => {
                let cleared = self.ctx.registry.lock().clear_monitored();
                warn!(cleared, "monitoring subverted, no longer tracking processes");
            }
            Command::KernelError(message) => error!(target: "monitor", "Error : {message}"),
            Command::Loaded(pid) => {
                self.ctx.registry.lock().add_pid(pid);
                info!(pid, "instrumentation successfully loaded in process");
            }
            Command::Resume => {
                let now = self.ctx.clock.now();
                self.ctx.registry.lock().touch_injection(now);
            }
            Command::Kill(pid) => self.kill(pid),
            Command::Service(name) => self.service(&name),
            Command::FileNew(path) => {
                if self.ctx.registry.lock().files.add(&path) {
                    info!(%path, "added new file to list");
                }
            }
            Command::FileDel(path) => self.file_deleted(&path),
            Command::FileMove { old, new } => {
                let renamed = self.ctx.registry.lock().files.rename(&old, &new);
                debug!(%old, %new, renamed, "file moved");
            }
            Command::Malformed { tag, payload } => {
                warn!(tag, %payload, "received malformed command");
            }
            Command::Unknown(text) => warn!(command = %text, "received unknown command"),
        }
        OK.to_vec()
    }

    fn hidden_pids(&self) -> Vec<u8> {
        self.ctx
            .registry
            .lock()
            .hidden_pids()
            .into_iter()
            .flat_map(u32::to_le_bytes)
            .collect()
    }

    fn process(&self, pid: u32, thread_id: Option<u32>, suspended: bool) {
        if pid == 0 {
            return;
        }
        // Held for the whole injection so the poll loop cannot declare the
        // analysis finished in between.
        let mut state = self.ctx.registry.lock();
        if state.is_own(pid) {
            warn!(pid, "received request to inject the agent process, skip");
            return;
        }
        if state.is_monitored(pid) {
            debug!(pid, "process already monitored");
            return;
        }

        let mut process = self.ctx.platform.open(pid, thread_id, suspended);
        let path = display_path(process.filepath().as_deref());
        let bits = if process.is_64bit() { "64-bit" } else { "32-bit" };
        info!(pid, bits, %path, "announced process");

        if state.protected.contains(&path) {
            info!(pid, %path, "process is protected, not injecting");
            return;
        }

        let injected = self.ctx.injector.inject(
            process.as_mut(),
            self.settings.dll.as_deref(),
            &path,
            false,
        );
        state.touch_injection(self.ctx.clock.now());
        if injected {
            state.add_pid(pid);
        }
    }

    fn kernel_process(&self, pid: u32) {
        if pid == 0 {
            return;
        }
        let mut state = self.ctx.registry.lock();
        if state.is_own(pid) || state.is_monitored(pid) {
            return;
        }
        let mut process = self.ctx.platform.open(pid, None, false);
        let path = display_path(process.filepath().as_deref());
        if state.protected.contains(&path) {
            return;
        }
        state.add_pid(pid);
        info!(pid, %path, "announced kernel-monitored process");
    }

    fn kill(&self, pid: u32) {
        let state = self.ctx.registry.lock();
        if state.is_own(pid) || !state.is_monitored(pid) {
            return;
        }

        if self.settings.procmemdump {
            let mut process = self.ctx.platform.open(pid, None, false);
            self.ctx
                .injector
                .dump_memory(process.as_mut(), self.ctx.sink.as_ref());
        }

        let event = format!("{}{pid}", self.settings.terminate_event);
        if self.ctx.platform.signal_event(&event) {
            info!(pid, "notified of termination of process");
        } else {
            warn!(pid, "unable to open termination event");
        }
    }

    fn service(&self, name: &str) {
        if !self.ctx.platform.configure_service(name) {
            warn!(service = name, "failed to move service into its own process");
        }
        info!(service = name, "announced starting service");

        let Some(pid) = self.settings.service_host else {
            error!(service = name, "unable to monitor service, service host not found");
            return;
        };
        if !self.ctx.registry.lock().claim_service_host() {
            return;
        }

        let mut process = self.ctx.platform.open(pid, None, false);
        let path = display_path(process.filepath().as_deref());
        self.ctx
            .injector
            .inject(process.as_mut(), self.settings.dll.as_deref(), &path, true);
        let now = self.ctx.clock.now();
        self.ctx.registry.lock().touch_injection(now);
        self.ctx.clock.sleep_blocking(SERVICE_HOST_SETTLE);
    }

    fn file_deleted(&self, path: &str) {
        self.ctx.registry.lock().files.remove(path);
        if let Err(err) = self
            .ctx
            .registry
            .dump_file(Path::new(path), self.ctx.sink.as_ref())
        {
            error!(path, %err, "unable to upload dropped file");
        }
    }
}

fn forward_log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(target: "monitor", "{message}"),
        LogLevel::Info => info!(target: "monitor", "{message}"),
        LogLevel::Warning => warn!(target: "monitor", "{message}"),
        LogLevel::Critical => error!(target: "monitor", "{message}"),
    }
}

fn display_path(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}
