#![allow(dead_code)]

use analyzer::Context;
use analyzer::Error;
use analyzer::clock::{Clock, ManualClock};
use analyzer::loader::Injector;
use analyzer::process::{Platform, ProcessControl};
use analyzer::registry::Registry;
use analyzer::sink::ResultSink;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const AGENT_PID: u32 = 4242;
pub const PARENT_PID: u32 = 4200;

/// Machine state seen through [`FakePlatform`].
#[derive(Debug, Default)]
pub struct Machine {
    pub alive: BTreeSet<u32>,
    pub critical: BTreeSet<u32>,
    pub paths: BTreeMap<u32, PathBuf>,
    pub by_name: BTreeMap<String, Vec<u32>>,
    pub terminated: Vec<u32>,
    pub terminate_events: Vec<String>,
    pub events: Vec<String>,
    pub markers: Vec<String>,
    pub services: Vec<String>,
    pub executed: Vec<(PathBuf, Option<String>)>,
    pub resumed: Vec<u32>,
    next_pid: u32,
}

#[derive(Clone, Default)]
pub struct FakePlatform {
    pub machine: Arc<Mutex<Machine>>,
}

impl FakePlatform {
    pub fn spawn(&self, pid: u32, path: &str) {
        let mut machine = self.machine.lock();
        machine.alive.insert(pid);
        machine.paths.insert(pid, PathBuf::from(path));
    }

    pub fn exit(&self, pid: u32) {
        self.machine.lock().alive.remove(&pid);
    }
}

pub struct FakeProcess {
    pid: u32,
    thread_id: Option<u32>,
    suspended: bool,
    machine: Arc<Mutex<Machine>>,
}

impl ProcessControl for FakeProcess {
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
        self.pid != 0
    }

    fn is_alive(&mut self) -> bool {
        self.machine.lock().alive.contains(&self.pid)
    }

    fn is_critical(&mut self) -> bool {
        self.machine.lock().critical.contains(&self.pid)
    }

    fn filepath(&mut self) -> Option<PathBuf> {
        self.machine.lock().paths.get(&self.pid).cloned()
    }

    fn parent_pid(&mut self) -> Option<u32> {
        None
    }

    fn is_64bit(&mut self) -> bool {
        false
    }

    fn resume(&mut self, _delay: Duration) -> bool {
        if !self.suspended {
            return false;
        }
        self.suspended = false;
        self.machine.lock().resumed.push(self.pid);
        true
    }

    fn kill(&mut self) -> bool {
        let mut machine = self.machine.lock();
        machine.alive.remove(&self.pid);
        machine.terminated.push(self.pid);
        true
    }

    fn set_terminate_event(&mut self, prefix: &str) -> bool {
        self.machine
            .lock()
            .terminate_events
            .push(format!("{prefix}{}", self.pid));
        true
    }
}

impl Platform for FakePlatform {
    fn open(&self, pid: u32, thread_id: Option<u32>, suspended: bool) -> Box<dyn ProcessControl> {
        Box::new(FakeProcess {
            pid,
            thread_id,
            suspended,
            machine: Arc::clone(&self.machine),
        })
    }

    fn execute(
        &self,
        path: &Path,
        args: Option<&str>,
        _cwd: &Path,
        suspended: bool,
    ) -> Result<Box<dyn ProcessControl>, Error> {
        let pid = {
            let mut machine = self.machine.lock();
            machine.next_pid = machine.next_pid.max(1000) + 4;
            let pid = machine.next_pid;
            machine.alive.insert(pid);
            machine.paths.insert(pid, path.to_path_buf());
            machine
                .executed
                .push((path.to_path_buf(), args.map(str::to_owned)));
            pid
        };
        Ok(self.open(pid, Some(pid + 1), suspended))
    }

    fn current_pid(&self) -> u32 {
        AGENT_PID
    }

    fn pids_by_name(&self, names: &[String]) -> Vec<u32> {
        let machine = self.machine.lock();
        names
            .iter()
            .filter_map(|name| machine.by_name.get(name))
            .flatten()
            .copied()
            .collect()
    }

    fn grant_debug_privilege(&self) -> Result<(), Error> {
        Ok(())
    }

    fn set_clock(&self, _clock: NaiveDateTime) -> Result<(), Error> {
        Ok(())
    }

    fn create_shutdown_marker(&self, name: &str) -> bool {
        self.machine.lock().markers.push(name.to_owned());
        true
    }

    fn signal_event(&self, name: &str) -> bool {
        self.machine.lock().events.push(name.to_owned());
        true
    }

    fn configure_service(&self, name: &str) -> bool {
        self.machine.lock().services.push(name.to_owned());
        true
    }
}

/// Injects into anything alive, like the real loader does.
#[derive(Default)]
pub struct FakeInjector {
    pub injected: Mutex<Vec<(u32, bool)>>,
    pub dumped: Mutex<Vec<u32>>,
}

impl FakeInjector {
    pub fn injected_pids(&self) -> Vec<u32> {
        self.injected.lock().iter().map(|(pid, _)| *pid).collect()
    }
}

impl Injector for FakeInjector {
    fn inject(
        &self,
        process: &mut dyn ProcessControl,
        _dll: Option<&str>,
        _interest: &str,
        nosleepskip: bool,
    ) -> bool {
        if !process.is_alive() {
            return false;
        }
        self.injected.lock().push((process.pid(), nosleepskip));
        true
    }

    fn dump_memory(&self, process: &mut dyn ProcessControl, _sink: &dyn ResultSink) -> bool {
        self.dumped.lock().push(process.pid());
        true
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
    pub duplicates: Mutex<Vec<(String, String)>>,
}

impl ResultSink for RecordingSink {
    fn upload(&self, remote: &str, data: &mut dyn Read) -> Result<(), Error> {
        let mut bytes = Vec::new();
        data.read_to_end(&mut bytes)?;
        self.uploads.lock().push((remote.to_owned(), bytes));
        Ok(())
    }

    fn duplicate(&self, remote: &str, local: &str) -> Result<(), Error> {
        self.duplicates
            .lock()
            .push((remote.to_owned(), local.to_owned()));
        Ok(())
    }
}

pub struct Fixture {
    pub platform: FakePlatform,
    pub injector: Arc<FakeInjector>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub ctx: Context,
}

impl Fixture {
    pub fn new() -> Self {
        let platform = FakePlatform::default();
        let injector = Arc::new(FakeInjector::default());
        let sink = Arc::new(RecordingSink::default());
        let clock = Arc::new(ManualClock::default());
        let ctx = Context {
            registry: Arc::new(Registry::new(AGENT_PID, PARENT_PID)),
            platform: Arc::new(platform.clone()),
            injector: Arc::clone(&injector) as Arc<dyn Injector>,
            sink: Arc::clone(&sink) as Arc<dyn ResultSink>,
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
        };
        Self {
            platform,
            injector,
            sink,
            clock,
            ctx,
        }
    }

    pub fn monitored(&self) -> Vec<u32> {
        self.ctx.registry.lock().monitored()
    }
}
