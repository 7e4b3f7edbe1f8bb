//! The analysis state machine: prepare, launch, poll, shut down.

#![forbid(unsafe_code)]

use crate::clock::SystemClock;
use crate::context::Context;
use crate::error::Error;
use crate::inject_config::{InjectionSettings, random_string};
use crate::loader::Loader;
use crate::package::{
    Auxiliary, AuxiliaryRegistry, Package, PackageContext, PackageRegistry, choose_package,
};
use crate::process::{NativePlatform, Platform};
use crate::protocol::{DispatchSettings, Dispatcher, LogRelays, PipeServer, ServerOptions};
use crate::registry::Registry;
use crate::sink::{NetlogSink, ResultSink};
use config::{Category, Config, Monitor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Names of the objects shared with the instrumentation for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNames {
    pub pipe: String,
    pub shutdown_marker: String,
    pub terminate_event: String,
}

impl RunNames {
    /// Configured names, with random ones filled in where unset.
    pub fn new(monitor: &Monitor) -> Self {
        Self {
            pipe: monitor
                .pipe
                .clone()
                .unwrap_or_else(|| format!("\\\\.\\PIPE\\{}", random_string(6, 10))),
            shutdown_marker: monitor
                .shutdown_marker
                .clone()
                .unwrap_or_else(|| format!("Global\\{}", random_string(6, 10))),
            terminate_event: monitor
                .terminate_event
                .clone()
                .unwrap_or_else(|| format!("Global\\{}", random_string(6, 10))),
        }
    }
}

/// Why one poll tick did or did not end the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Keep polling.
    Continue,
    /// A notification handler held the registry lock.
    Skipped,
    Timeout,
    /// Every monitored process is gone and nothing new was injected.
    Complete,
    /// The package asked to stop.
    PackageStop,
}

impl Outcome {
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Continue | Self::Skipped)
    }
}

pub struct Analyzer {
    config: Config,
    names: RunNames,
    ctx: Context,
    packages: PackageRegistry,
    auxiliaries: AuxiliaryRegistry,
    server: Option<PipeServer>,
    relays: Option<Arc<LogRelays>>,
    target: String,
    package: Option<(String, Box<dyn Package>)>,
    running: Vec<(String, Box<dyn Auxiliary>)>,
    pid_check: bool,
    started: Option<Instant>,
    quiet_since: Option<Instant>,
}

impl Analyzer {
    pub fn new(config: Config, names: RunNames, ctx: Context) -> Self {
        Self {
            config,
            names,
            ctx,
            packages: PackageRegistry::builtin(),
            auxiliaries: AuxiliaryRegistry::default(),
            server: None,
            relays: None,
            target: String::new(),
            package: None,
            running: Vec::new(),
            pid_check: false,
            started: None,
            quiet_since: None,
        }
    }

    /// Wire up the native platform, the loader and the result server
    /// connection described by `config`. Log relays run on the current
    /// tokio runtime.
    pub fn native(config: Config) -> Self {
        let names = RunNames::new(&config.monitor);
        let platform: Arc<dyn Platform> = Arc::new(NativePlatform::default());
        let agent = platform.current_pid();
        let parent = platform
            .open(agent, None, false)
            .parent_pid()
            .unwrap_or_default();

        let mut settings =
            InjectionSettings::new(&config.host, names.pipe.clone(), config.options.clone());
        settings.results = config.paths.results.clone();
        settings.analyzer = config.paths.analyzer.clone();
        settings.shutdown_marker = names.shutdown_marker.clone();
        settings.terminate_event = names.terminate_event.clone();
        let sink: Arc<dyn ResultSink> = Arc::new(NetlogSink::new(config.host.result_server()));
        let relays = Arc::new(LogRelays::new(
            &config.paths.temp,
            Arc::clone(&sink),
            config.monitor.drain_timeout,
        ));
        let loader = Loader::new(
            settings,
            &config.paths.bin,
            &config.paths.dll,
            &config.paths.injection_config,
            config.paths.results.join("memory"),
        )
        .with_relays(Arc::clone(&relays));

        let ctx = Context {
            registry: Arc::new(Registry::new(agent, parent)),
            platform,
            injector: Arc::new(loader),
            sink,
            clock: Arc::new(SystemClock),
        };
        Self::new(config, names, ctx).with_relays(relays)
    }

    /// Stop `relays` at shutdown, after the notification server.
    pub fn with_relays(mut self, relays: Arc<LogRelays>) -> Self {
        self.relays = Some(relays);
        self
    }

    pub fn packages_mut(&mut self) -> &mut PackageRegistry {
        &mut self.packages
    }

    pub fn auxiliaries_mut(&mut self) -> &mut AuxiliaryRegistry {
        &mut self.auxiliaries
    }

    pub fn names(&self) -> &RunNames {
        &self.names
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Address of the notification channel once it is listening.
    pub fn server_address(&self) -> Option<&str> {
        self.server.as_ref().map(PipeServer::address)
    }

    /// Sample path or URL, known once prepared.
    pub fn target(&self) -> &str {
        &self.target
    }

    fn package_context(&self) -> PackageContext {
        PackageContext {
            ctx: self.ctx.clone(),
            dll: self.config.options.dll().map(str::to_owned),
            options: self.config.options.clone(),
            cwd: self.config.paths.temp.clone(),
            resume_delay: self.config.monitor.resume_delay,
        }
    }

    fn kernel_analysis(&self) -> bool {
        self.config.options.kernel_analysis()
    }

    /// Get the machine ready and start listening for notifications. Must be
    /// called inside a tokio runtime.
    pub fn prepare(&mut self) -> Result<(), Error> {
        let platform = Arc::clone(&self.ctx.platform);
        platform.grant_debug_privilege()?;

        for folder in self.config.paths.result_folders() {
            std::fs::create_dir_all(&folder)
                .map_err(|source| Error::CreateFolder { path: folder, source })?;
        }

        {
            let mut state = self.ctx.registry.lock();
            if let Ok(cwd) = std::env::current_dir() {
                state.protected.add(&cwd);
            }
            state.protected.add(&self.config.paths.analyzer);
            state.protected.add(&self.config.paths.results);
        }

        if let Some(clock) = self.config.analysis.clock()? {
            match platform.set_clock(clock) {
                Ok(()) => info!(%clock, "system clock set"),
                Err(err) => warn!(%clock, %err, "unable to set the system clock"),
            }
        }

        let monitor = &self.config.monitor;
        let service_host = platform
            .pids_by_name(std::slice::from_ref(&monitor.service_host))
            .first()
            .copied();
        if service_host.is_none() {
            warn!(name = %monitor.service_host, "service host process not found");
        }
        let hidden = platform.pids_by_name(&monitor.hide_processes);
        debug!(count = hidden.len(), "hiding analysis tool processes");
        self.ctx.registry.lock().set_hidden(hidden);

        let dispatcher = Dispatcher::new(
            self.ctx.clone(),
            DispatchSettings {
                dll: self.config.options.dll().map(str::to_owned),
                procmemdump: self.config.options.procmemdump(),
                terminate_event: self.names.terminate_event.clone(),
                service_host,
            },
        );
        let server = PipeServer::start(
            &self.names.pipe,
            &self.config.paths.temp,
            dispatcher,
            ServerOptions {
                listeners: monitor.pipe_servers,
                handler_timeout: monitor.handler_timeout,
                drain_timeout: monitor.drain_timeout,
            },
        )?;
        self.server = Some(server);

        self.target = match self.config.analysis.category {
            Category::File => self
                .config
                .paths
                .temp
                .join(&self.config.analysis.file_name)
                .display()
                .to_string(),
            Category::Url => self.config.analysis.target.clone(),
        };

        debug!(
            analyzer = %self.config.paths.analyzer.display(),
            results = %self.config.paths.results.display(),
            pipe = %self.names.pipe,
            "analyzer prepared"
        );
        Ok(())
    }

    /// Select the package, start the auxiliary modules and the target.
    ///
    /// Starting the target runs the loader and waits out the resume delay,
    /// so it happens on the blocking pool.
    pub async fn launch(&mut self) -> Result<(), Error> {
        let tag = match self.config.analysis.package.as_deref() {
            Some(tag) if !tag.is_empty() => tag.to_owned(),
            _ => {
                let tag = choose_package(&self.config.analysis)?;
                info!(package = tag, "automatically selected analysis package");
                tag.to_owned()
            }
        };
        let mut package = self.packages.create(&tag)?;
        let pctx = self.package_context();

        self.running = self
            .auxiliaries
            .start_all(&self.config.analysis.auxiliary, &pctx);

        let target = self.target.clone();
        let (package, started) = tokio::task::spawn_blocking(move || {
            let started = package.start(&target, &pctx);
            (package, started)
        })
        .await
        .map_err(|err| Error::PackageStart {
            package: tag.clone(),
            reason: err.to_string(),
        })?;
        let pids = started.map_err(|err| match err {
            Error::PackageStart { .. } => err,
            other => Error::PackageStart {
                package: tag.clone(),
                reason: other.to_string(),
            },
        })?;
        self.package = Some((tag, package));

        if pids.is_empty() {
            info!("no process ids returned by the package, running for the full timeout");
            self.pid_check = false;
        } else {
            self.ctx.registry.lock().add_pids(pids);
            self.pid_check = true;
        }
        if self.config.analysis.enforce_timeout {
            info!("timeout enforced, running for the full timeout");
            self.pid_check = false;
        }

        self.started = Some(self.ctx.clock.now());
        self.quiet_since = None;
        Ok(())
    }

    /// Evaluate the termination criteria once.
    pub fn tick(&mut self) -> Outcome {
        let now = self.ctx.clock.now();
        let started = *self.started.get_or_insert(now);
        if now.duration_since(started) >= self.config.analysis.timeout {
            info!("analysis timeout hit, terminating analysis");
            return Outcome::Timeout;
        }

        if self.pid_check {
            let Some(mut state) = self.ctx.registry.try_lock() else {
                return Outcome::Skipped;
            };

            if !self.kernel_analysis() {
                let platform = &self.ctx.platform;
                for pid in state.prune(|pid| platform.open(pid, None, false).is_alive()) {
                    info!(pid, "process has terminated");
                }
            }

            let monitor = &self.config.monitor;
            let quiet = state.monitored_len() == 0
                && state
                    .last_injection()
                    .is_none_or(|last| now >= last + monitor.injection_settle);
            if quiet {
                match self.quiet_since {
                    Some(since) if now >= since + monitor.empty_confirmation => {
                        info!("process list is empty, terminating analysis");
                        return Outcome::Complete;
                    }
                    Some(_) => {}
                    None => self.quiet_since = Some(now),
                }
            } else {
                self.quiet_since = None;
            }

            let pids = state.monitored();
            drop(state);
            if let Some((_, package)) = self.package.as_mut() {
                package.set_pids(&pids);
            }
        }

        let pctx = self.package_context();
        if let Some((tag, package)) = self.package.as_mut() {
            match package.check(&pctx) {
                Ok(true) => {}
                Ok(false) => {
                    info!("the analysis package requested the termination of the analysis");
                    return Outcome::PackageStop;
                }
                Err(err) => warn!(package = %tag, %err, "package check function failed"),
            }
        }
        Outcome::Continue
    }

    /// Tick once per poll interval until the analysis ends.
    pub async fn poll(&mut self) -> Outcome {
        loop {
            let outcome = self.tick();
            if outcome.is_final() {
                return outcome;
            }
            self.ctx.clock.sleep(self.config.monitor.poll_interval).await;
        }
    }

    /// Prepare, launch and poll. Cancelling `cancel` interrupts the run with
    /// an error; [`Analyzer::shutdown`] still has to be called either way.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Outcome, Error> {
        let run = async {
            self.prepare()?;
            self.launch().await?;
            Ok::<_, Error>(self.poll().await)
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Interrupted("Keyboard Interrupt".into())),
            outcome = run => outcome,
        }
    }

    /// Unwind everything started so far. Safe to call after a failed or
    /// interrupted run.
    pub async fn shutdown(&mut self) {
        let platform = Arc::clone(&self.ctx.platform);
        let clock = Arc::clone(&self.ctx.clock);
        let monitor = self.config.monitor.clone();
        let kernel_analysis = self.kernel_analysis();

        if !platform.create_shutdown_marker(&self.names.shutdown_marker) {
            warn!(name = %self.names.shutdown_marker, "unable to create shutdown marker");
        }
        clock.sleep(monitor.shutdown_grace).await;

        let pctx = self.package_context();
        if let Some((tag, package)) = self.package.as_mut() {
            if let Err(err) = package.finish(&pctx) {
                warn!(package = %tag, %err, "package finish function failed");
            }
        }

        for (tag, module) in &mut self.running {
            if let Err(err) = module.stop() {
                warn!(module = %tag, %err, "cannot terminate auxiliary module");
            }
        }

        if !kernel_analysis {
            let pids = self.ctx.registry.lock().monitored();
            let mut signalled = false;
            for &pid in &pids {
                let mut process = platform.open(pid, None, false);
                if process.is_alive() {
                    signalled |= process.set_terminate_event(&self.names.terminate_event);
                }
            }
            if signalled {
                clock.sleep(monitor.terminate_flush).await;
            }

            if self.config.analysis.terminate_processes {
                info!("terminating remaining processes before shutdown");
                for pid in pids {
                    let mut process = platform.open(pid, None, false);
                    if process.is_alive() {
                        process.terminate();
                    }
                }
            }
        }

        for (tag, module) in &mut self.running {
            if let Err(err) = module.finish() {
                warn!(module = %tag, %err, "auxiliary module finish callback failed");
            }
        }

        if let Some(server) = self.server.take() {
            server.stop().await;
        }
        if let Some(relays) = self.relays.take() {
            relays.stop().await;
        }

        self.dump_files();
        info!("analysis completed");
    }

    /// Upload every file still tracked as live.
    fn dump_files(&self) {
        let paths: Vec<String> = self.ctx.registry.lock().files.iter().map(str::to_owned).collect();
        for path in paths {
            if let Err(err) = self.ctx.registry.dump_file(Path::new(&path), self.ctx.sink.as_ref()) {
                error!(%path, %err, "unable to upload dropped file");
            }
        }
    }

    /// Local results root reported to the host.
    pub fn results(&self) -> PathBuf {
        self.config.paths.results.clone()
    }
}
