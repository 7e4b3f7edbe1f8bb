mod common;

use analyzer::Error;
use analyzer::protocol::{Command, DispatchSettings, Dispatcher, OK};
use analyzer::registry::Registry;
use analyzer::sink::ResultSink;
use common::{AGENT_PID, Fixture, PARENT_PID};
use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

fn dispatcher(fixture: &Fixture, settings: DispatchSettings) -> Dispatcher {
    Dispatcher::new(fixture.ctx.clone(), settings)
}

fn send(dispatcher: &Dispatcher, message: &str) -> Vec<u8> {
    dispatcher.dispatch(Command::parse(message.as_bytes()))
}

#[test]
fn agent_and_parent_are_never_injected() {
    let fixture = Fixture::new();
    fixture.platform.spawn(AGENT_PID, "C:\\Python27\\python.exe");
    fixture.platform.spawn(PARENT_PID, "C:\\agent.exe");
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    assert_eq!(send(&dispatcher, &format!("PROCESS:{AGENT_PID}")), OK);
    assert_eq!(send(&dispatcher, &format!("PROCESS:1:{PARENT_PID},12")), OK);
    send(&dispatcher, &format!("LOADED:{AGENT_PID}"));
    send(&dispatcher, &format!("KPROCESS:{PARENT_PID}"));

    assert!(fixture.injector.injected_pids().is_empty());
    assert!(fixture.monitored().is_empty());
}

#[test]
fn repeated_announcement_injects_once() {
    let fixture = Fixture::new();
    fixture.platform.spawn(1000, "C:\\sample.exe");
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    send(&dispatcher, "PROCESS:1000");
    send(&dispatcher, "PROCESS:1000");

    assert_eq!(fixture.injector.injected_pids(), [1000]);
    assert_eq!(fixture.monitored(), [1000]);
    assert!(fixture.ctx.registry.lock().last_injection().is_some());
}

#[test]
fn process_that_died_before_injection_is_not_monitored() {
    let fixture = Fixture::new();
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    send(&dispatcher, "PROCESS:0:1000,1004");

    assert!(fixture.injector.injected_pids().is_empty());
    assert!(fixture.monitored().is_empty());
}

#[test]
fn protected_paths_are_not_injected() {
    let fixture = Fixture::new();
    fixture.platform.spawn(1000, "C:\\Analyzer\\bin\\helper.exe");
    fixture
        .ctx
        .registry
        .lock()
        .protected
        .add(std::path::Path::new("C:\\Analyzer\\bin\\helper.exe"));
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    send(&dispatcher, "PROCESS:1000");

    assert!(fixture.injector.injected_pids().is_empty());
    assert!(fixture.monitored().is_empty());
}

#[test]
fn loaded_adds_the_process() {
    let fixture = Fixture::new();
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    send(&dispatcher, "LOADED:1200");
    send(&dispatcher, "LOADED:1200");

    assert_eq!(fixture.monitored(), [1200]);
}

#[test]
fn kernel_commands_only_touch_the_monitored_set() {
    let fixture = Fixture::new();
    fixture.platform.spawn(1000, "C:\\a.exe");
    fixture.platform.spawn(1004, "C:\\b.exe");
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    send(&dispatcher, "KPROCESS:1000");
    send(&dispatcher, "KPROCESS:1004");
    assert_eq!(fixture.monitored(), [1000, 1004]);

    send(&dispatcher, "KTERMINATE:1000");
    assert_eq!(fixture.monitored(), [1004]);

    send(&dispatcher, "KERROR:driver failure");
    assert!(fixture.injector.injected_pids().is_empty());
}

#[test]
fn subversion_clears_everything() {
    let fixture = Fixture::new();
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());
    for pid in [1000, 1004, 1008, 1012] {
        send(&dispatcher, &format!("LOADED:{pid}"));
    }
    assert_eq!(fixture.monitored().len(), 4);

    assert_eq!(send(&dispatcher, "KSUBVERT"), OK);
    assert!(fixture.monitored().is_empty());

    assert_eq!(send(&dispatcher, "KSUBVERT"), OK);
    assert!(fixture.monitored().is_empty());
}

#[test]
fn getpids_returns_packed_little_endian_pids() {
    let fixture = Fixture::new();
    fixture.ctx.registry.lock().set_hidden([7, 9]);
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    let response = send(&dispatcher, "GETPIDS");

    let pids: Vec<u32> = response
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
        .collect();
    assert_eq!(pids, [AGENT_PID, PARENT_PID, 7, 9]);
}

#[test]
fn resume_moves_the_injection_watermark() {
    let fixture = Fixture::new();
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    send(&dispatcher, "RESUME:1000");
    let first = fixture.ctx.registry.lock().last_injection().unwrap();

    fixture.clock.advance(Duration::from_secs(3));
    send(&dispatcher, "RESUME:1000");
    let second = fixture.ctx.registry.lock().last_injection().unwrap();

    assert_eq!(second - first, Duration::from_secs(3));
}

#[test]
fn kill_signals_only_monitored_processes() {
    let fixture = Fixture::new();
    fixture.platform.spawn(1000, "C:\\a.exe");
    let settings = DispatchSettings {
        procmemdump: true,
        terminate_event: "Global\\term".into(),
        ..Default::default()
    };
    let dispatcher = dispatcher(&fixture, settings);

    send(&dispatcher, "KILL:1000");
    assert!(fixture.platform.machine.lock().events.is_empty());

    send(&dispatcher, "PROCESS:1000");
    send(&dispatcher, "KILL:1000");
    assert_eq!(fixture.platform.machine.lock().events, ["Global\\term1000"]);
    assert_eq!(*fixture.injector.dumped.lock(), [1000]);

    send(&dispatcher, &format!("KILL:{AGENT_PID}"));
    assert_eq!(fixture.platform.machine.lock().events.len(), 1);
}

#[test]
fn service_host_is_injected_once() {
    let fixture = Fixture::new();
    fixture.platform.spawn(600, "C:\\Windows\\System32\\services.exe");
    let settings = DispatchSettings {
        service_host: Some(600),
        ..Default::default()
    };
    let dispatcher = dispatcher(&fixture, settings);

    send(&dispatcher, "SERVICE:evil");
    send(&dispatcher, "SERVICE:evil2");

    assert_eq!(*fixture.injector.injected.lock(), [(600, true)]);
    assert_eq!(fixture.platform.machine.lock().services, ["evil", "evil2"]);
    assert!(fixture.ctx.registry.lock().last_injection().is_some());
    assert_eq!(fixture.clock.elapsed(), Duration::from_secs(1));
}

#[test]
fn unknown_and_malformed_commands_answer_ok() {
    let fixture = Fixture::new();
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    assert_eq!(send(&dispatcher, "HELLO:world"), OK);
    assert_eq!(send(&dispatcher, "PROCESS:abc"), OK);
    assert_eq!(send(&dispatcher, "FILE_MOVE:no separator"), OK);
    assert_eq!(send(&dispatcher, "INFO:just a log line"), OK);
    assert!(fixture.monitored().is_empty());
}

#[cfg(unix)]
#[test]
fn moved_then_deleted_file_is_uploaded_once() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().display().to_string();
    let fixture = Fixture::new();
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    // Backslashes are ordinary characters in file names here, so the
    // Windows paths map onto single files in the temp directory.
    std::fs::write(dir.path().join("C:\\c\\b.txt"), b"dropped").unwrap();

    send(&dispatcher, &format!("FILE_NEW:{root}/C:\\a\\b.txt"));
    send(&dispatcher, &format!("FILE_MOVE:{root}/C:\\a::{root}/C:\\c"));
    assert_eq!(
        fixture.ctx.registry.lock().files.iter().collect::<Vec<_>>(),
        [format!("{root}/C:\\c\\b.txt")]
    );

    send(&dispatcher, &format!("FILE_DEL:{root}/C:\\c\\b.txt"));

    let uploads = fixture.sink.uploads.lock();
    assert_eq!(uploads.len(), 1);
    assert!(uploads[0].0.starts_with("files/"));
    assert!(uploads[0].0.ends_with("/b.txt"));
    assert_eq!(uploads[0].1, b"dropped");
    assert!(fixture.ctx.registry.lock().files.is_empty());
}

#[cfg(unix)]
#[test]
fn identical_content_is_announced_as_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new();
    let dispatcher = dispatcher(&fixture, DispatchSettings::default());

    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.txt");
    std::fs::write(&first, b"same").unwrap();
    std::fs::write(&second, b"same").unwrap();

    send(&dispatcher, &format!("FILE_DEL:{}", first.display()));
    send(&dispatcher, &format!("FILE_DEL:{}", second.display()));

    let uploads = fixture.sink.uploads.lock();
    let duplicates = fixture.sink.duplicates.lock();
    assert_eq!(uploads.len(), 1);
    assert_eq!(*duplicates, [(uploads[0].0.clone(), "second.txt".to_owned())]);
    assert_eq!(fixture.ctx.registry.lock().dropped.len(), 1);
}

/// Notes whether the registry could be locked while a transfer was running.
struct LockCheckingSink {
    registry: Arc<Registry>,
    unlocked: Mutex<Vec<bool>>,
}

impl ResultSink for LockCheckingSink {
    fn upload(&self, _remote: &str, data: &mut dyn Read) -> Result<(), Error> {
        self.unlocked.lock().push(self.registry.try_lock().is_some());
        std::io::copy(data, &mut std::io::sink())?;
        Ok(())
    }

    fn duplicate(&self, _remote: &str, _local: &str) -> Result<(), Error> {
        self.unlocked.lock().push(self.registry.try_lock().is_some());
        Ok(())
    }
}

#[test]
fn deleted_file_upload_runs_without_the_registry_lock() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = Fixture::new();
    let sink = Arc::new(LockCheckingSink {
        registry: Arc::clone(&fixture.ctx.registry),
        unlocked: Mutex::default(),
    });
    let mut ctx = fixture.ctx.clone();
    ctx.sink = Arc::clone(&sink) as Arc<dyn ResultSink>;
    let dispatcher = Dispatcher::new(ctx, DispatchSettings::default());

    let first = dir.path().join("first.bin");
    let second = dir.path().join("second.bin");
    std::fs::write(&first, b"same").unwrap();
    std::fs::write(&second, b"same").unwrap();
    send(&dispatcher, &format!("FILE_NEW:{}", first.display()));

    send(&dispatcher, &format!("FILE_DEL:{}", first.display()));
    send(&dispatcher, &format!("FILE_DEL:{}", second.display()));

    assert_eq!(*sink.unlocked.lock(), [true, true]);
    let state = fixture.ctx.registry.lock();
    assert!(state.files.is_empty());
    assert_eq!(state.dropped.len(), 1);
}
