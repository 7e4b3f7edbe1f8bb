use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Critical,
}

/// One notification sent by an instrumented process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Log { level: LogLevel, message: String },
    GetPids,
    /// A process was created. `suspended` is set when its main thread has
    /// not started yet.
    Process {
        pid: u32,
        thread_id: Option<u32>,
        suspended: bool,
    },
    KernelProcess(u32),
    KernelTerminate(u32),
    KernelSubvert,
    KernelError(String),
    Loaded(u32),
    Resume,
    Kill(u32),
    Service(String),
    FileNew(String),
    FileDel(String),
    FileMove { old: String, new: String },
    /// A known tag with a payload that could not be parsed.
    Malformed { tag: &'static str, payload: String },
    Unknown(String),
}

impl Command {
    /// Parse one message. Never fails: anything unrecognised becomes
    /// [`Command::Unknown`] or [`Command::Malformed`].
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();

        let log = [
            ("DEBUG:", LogLevel::Debug),
            ("INFO:", LogLevel::Info),
            ("WARNING:", LogLevel::Warning),
            ("CRITICAL:", LogLevel::Critical),
        ];
        for (tag, level) in log {
            if let Some(message) = text.strip_prefix(tag) {
                return Self::Log {
                    level,
                    message: message.to_owned(),
                };
            }
        }

        match text {
            "GETPIDS" => return Self::GetPids,
            "KSUBVERT" => return Self::KernelSubvert,
            _ => {}
        }

        if let Some(payload) = text.strip_prefix("KTERMINATE:") {
            return pid_command("KTERMINATE:", payload, Self::KernelTerminate);
        }
        if let Some(payload) = text.strip_prefix("KPROCESS:") {
            return pid_command("KPROCESS:", payload, Self::KernelProcess);
        }
        if let Some(message) = text.strip_prefix("KERROR:") {
            return Self::KernelError(message.to_owned());
        }
        if let Some(name) = text.strip_prefix("SERVICE:") {
            return Self::Service(name.to_owned());
        }
        if text.starts_with("RESUME:") {
            return Self::Resume;
        }
        if let Some(payload) = text.strip_prefix("KILL:") {
            return pid_command("KILL:", payload, Self::Kill);
        }
        if let Some(payload) = text.strip_prefix("LOADED:") {
            return pid_command("LOADED:", payload, Self::Loaded);
        }
        if let Some(payload) = text.strip_prefix("PROCESS:") {
            return parse_process(payload);
        }
        if let Some(path) = text.strip_prefix("FILE_NEW:") {
            return Self::FileNew(path.to_owned());
        }
        if let Some(path) = text.strip_prefix("FILE_DEL:") {
            return Self::FileDel(path.to_owned());
        }
        if let Some(payload) = text.strip_prefix("FILE_MOVE:") {
            return match payload.split_once("::") {
                Some((old, new)) => Self::FileMove {
                    old: old.to_owned(),
                    new: new.to_owned(),
                },
                None => Self::Malformed {
                    tag: "FILE_MOVE:",
                    payload: payload.to_owned(),
                },
            };
        }

        Self::Unknown(text.to_owned())
    }
}

fn digits(value: &str) -> Option<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn pid_command(tag: &'static str, payload: &str, f: impl FnOnce(u32) -> Command) -> Command {
    match digits(payload.trim()) {
        Some(pid) => f(pid),
        None => Command::Malformed {
            tag,
            payload: payload.to_owned(),
        },
    }
}

/// `[<flag>:]<pid>[,<tid>]`, where a flag of `1` means suspended.
fn parse_process(payload: &str) -> Command {
    let mut suspended = false;
    let mut rest = payload;
    let bytes = payload.as_bytes();
    if bytes.len() > 2 && bytes[1] == b':' {
        suspended = bytes[0] == b'1';
        rest = &payload[2..];
    }

    let (pid, thread_id) = match rest.split_once(',') {
        None => (digits(rest), None),
        Some((pid, tid)) if !tid.contains(',') => (digits(pid), digits(tid)),
        Some(_) => (None, None),
    };

    match pid {
        Some(pid) => Command::Process {
            pid,
            thread_id,
            suspended,
        },
        None => Command::Malformed {
            tag: "PROCESS:",
            payload: payload.to_owned(),
        },
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log { level, message } => {
                let tag = match level {
                    LogLevel::Debug => "DEBUG",
                    LogLevel::Info => "INFO",
                    LogLevel::Warning => "WARNING",
                    LogLevel::Critical => "CRITICAL",
                };
                write!(f, "{tag}:{message}")
            }
            Self::GetPids => f.write_str("GETPIDS"),
            Self::Process {
                pid,
                thread_id,
                suspended,
            } => {
                f.write_str("PROCESS:")?;
                if *suspended {
                    f.write_str("1:")?;
                }
                write!(f, "{pid}")?;
                if let Some(tid) = thread_id {
                    write!(f, ",{tid}")?;
                }
                Ok(())
            }
            Self::KernelProcess(pid) => write!(f, "KPROCESS:{pid}"),
            Self::KernelTerminate(pid) => write!(f, "KTERMINATE:{pid}"),
            Self::KernelSubvert => f.write_str("KSUBVERT"),
            Self::KernelError(message) => write!(f, "KERROR:{message}"),
            Self::Loaded(pid) => write!(f, "LOADED:{pid}"),
            Self::Resume => f.write_str("RESUME:"),
            Self::Kill(pid) => write!(f, "KILL:{pid}"),
            Self::Service(name) => write!(f, "SERVICE:{name}"),
            Self::FileNew(path) => write!(f, "FILE_NEW:{path}"),
            Self::FileDel(path) => write!(f, "FILE_DEL:{path}"),
            Self::FileMove { old, new } => write!(f, "FILE_MOVE:{old}::{new}"),
            Self::Malformed { tag, payload } => write!(f, "{tag}{payload}"),
            Self::Unknown(text) => f.write_str(text),
        }
    }
}
