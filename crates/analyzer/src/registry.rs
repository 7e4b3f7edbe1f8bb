//! Analysis state shared by the notification handlers and the poll loop.

#![forbid(unsafe_code)]

use crate::error::Error;
use crate::files::{DroppedFiles, Dumped, LiveFiles, ProtectedPaths, Reserved, file_digest, upload_name};
use crate::sink::ResultSink;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Owner of the single lock around [`RegistryState`].
#[derive(Debug)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new(agent_pid: u32, parent_pid: u32) -> Self {
        Self {
            state: Mutex::new(RegistryState::new(agent_pid, parent_pid)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    /// `None` while a notification handler holds the lock.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, RegistryState>> {
        self.state.try_lock()
    }

    /// Upload `path` unless identical contents were uploaded before, in
    /// which case only the alternate name is announced.
    ///
    /// The lock is only taken to reserve or release the digest. Hashing and
    /// the transfer run unlocked so notification handlers are never queued
    /// behind the result server.
    pub fn dump_file(&self, path: &Path, sink: &dyn ResultSink) -> Result<Dumped, Error> {
        let Some(digest) = file_digest(path)? else {
            return Ok(Dumped::Skipped);
        };
        let name = upload_name(&path.to_string_lossy()).to_owned();

        let reserved = self.lock().dropped.reserve(&digest, &name);
        match reserved {
            Reserved::Existing(existing) => {
                sink.duplicate(&existing, &name)?;
                info!(path = %path.display(), remote = %existing, "duplicate of an uploaded file");
                Ok(Dumped::Duplicate(existing))
            }
            Reserved::New(remote) => {
                if let Err(err) = sink.upload_file(path, &remote) {
                    self.lock().dropped.release(&digest);
                    return Err(err);
                }
                info!(path = %path.display(), %remote, "uploaded dropped file");
                Ok(Dumped::Uploaded(remote))
            }
        }
    }
}

#[derive(Debug)]
pub struct RegistryState {
    agent_pid: u32,
    parent_pid: u32,
    monitored: BTreeSet<u32>,
    hidden: BTreeSet<u32>,
    last_injection: Option<Instant>,
    service_host_injected: bool,
    pub files: LiveFiles,
    pub dropped: DroppedFiles,
    pub protected: ProtectedPaths,
}

impl RegistryState {
    fn new(agent_pid: u32, parent_pid: u32) -> Self {
        Self {
            agent_pid,
            parent_pid,
            monitored: BTreeSet::new(),
            hidden: BTreeSet::new(),
            last_injection: None,
            service_host_injected: false,
            files: LiveFiles::new(),
            dropped: DroppedFiles::new(),
            protected: ProtectedPaths::new(),
        }
    }

    pub fn agent_pid(&self) -> u32 {
        self.agent_pid
    }

    pub fn parent_pid(&self) -> u32 {
        self.parent_pid
    }

    /// The agent itself or the process that started it.
    pub fn is_own(&self, pid: u32) -> bool {
        pid == self.agent_pid || pid == self.parent_pid
    }

    pub fn is_monitored(&self, pid: u32) -> bool {
        self.monitored.contains(&pid)
    }

    /// Start tracking `pid`. Returns `false` when it was already tracked or
    /// belongs to the agent.
    pub fn add_pid(&mut self, pid: u32) -> bool {
        if self.is_own(pid) {
            warn!(pid, "refusing to monitor the agent or its parent");
            return false;
        }
        let added = self.monitored.insert(pid);
        if added {
            info!(pid, "added new process to list");
        }
        added
    }

    pub fn add_pids(&mut self, pids: impl IntoIterator<Item = u32>) {
        for pid in pids {
            self.add_pid(pid);
        }
    }

    pub fn remove_pid(&mut self, pid: u32) -> bool {
        let removed = self.monitored.remove(&pid);
        if removed {
            info!(pid, "process has terminated");
        }
        removed
    }

    /// Drop every tracked pid, returning how many there were.
    pub fn clear_monitored(&mut self) -> usize {
        let count = self.monitored.len();
        self.monitored.clear();
        count
    }

    /// Remove pids for which `alive` returns `false`.
    pub fn prune(&mut self, mut alive: impl FnMut(u32) -> bool) -> Vec<u32> {
        let dead: Vec<u32> = self.monitored.iter().copied().filter(|&pid| !alive(pid)).collect();
        for pid in &dead {
            self.remove_pid(*pid);
        }
        dead
    }

    pub fn monitored(&self) -> Vec<u32> {
        self.monitored.iter().copied().collect()
    }

    pub fn monitored_len(&self) -> usize {
        self.monitored.len()
    }

    pub fn touch_injection(&mut self, now: Instant) {
        self.last_injection = Some(now);
    }

    pub fn last_injection(&self) -> Option<Instant> {
        self.last_injection
    }

    /// Returns `true` exactly once.
    pub fn claim_service_host(&mut self) -> bool {
        !std::mem::replace(&mut self.service_host_injected, true)
    }

    pub fn set_hidden(&mut self, pids: impl IntoIterator<Item = u32>) {
        self.hidden = pids.into_iter().collect();
    }

    /// Pids the sample must not see: the agent, its parent and the hidden
    /// tool processes.
    pub fn hidden_pids(&self) -> Vec<u32> {
        let mut pids = vec![self.agent_pid, self.parent_pid];
        pids.extend(self.hidden.iter().copied().filter(|pid| !self.is_own(*pid)));
        pids
    }
}
