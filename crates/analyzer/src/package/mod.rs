//! Analysis packages and auxiliary modules.
//!
//! A package knows how to start one kind of target. Auxiliary modules run
//! next to it for the whole analysis. Both are looked up by tag in a
//! registry filled at startup.

#![forbid(unsafe_code)]

mod exe;
mod ie;

pub use exe::Exe;
pub use ie::InternetExplorer;

use crate::context::Context;
use crate::error::Error;
use config::{Analysis, Category, Options};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// What packages and auxiliary modules get to work with.
#[derive(Clone)]
pub struct PackageContext {
    pub ctx: Context,
    /// Instrumentation module chosen at submission, if any.
    pub dll: Option<String>,
    pub options: Options,
    /// Working directory of started processes.
    pub cwd: PathBuf,
    pub resume_delay: Duration,
}

impl PackageContext {
    /// Start `path` suspended, inject it and let it run. Returns the pid.
    ///
    /// A failed injection is logged; the process still runs so the
    /// analysis can go on without instrumentation.
    /// With the `free` option the process runs without instrumentation.
    pub fn execute(&self, path: &Path, args: Option<&str>) -> Result<u32, Error> {
        let mut process = self.ctx.platform.execute(path, args, &self.cwd, true)?;
        let pid = process.pid();
        let interest = path.display().to_string();

        if self.options.free() {
            info!(pid, "free mode, not injecting");
        } else if !self
            .ctx
            .injector
            .inject(process.as_mut(), self.dll.as_deref(), &interest, false)
        {
            warn!(pid, path = %interest, "unable to inject into started process");
        }
        if !process.resume(self.resume_delay) {
            warn!(pid, "unable to resume started process");
        }
        Ok(pid)
    }

    /// Dump the memory of every process in `pids` that is still alive.
    pub fn dump_memory(&self, pids: &[u32]) {
        for &pid in pids {
            let mut process = self.ctx.platform.open(pid, None, false);
            if process.is_alive() {
                self.ctx
                    .injector
                    .dump_memory(process.as_mut(), self.ctx.sink.as_ref());
            }
        }
    }
}

pub trait Package: Send {
    /// Start the target and return the pids to monitor.
    fn start(&mut self, target: &str, ctx: &PackageContext) -> Result<Vec<u32>, Error>;

    /// Latest monitored set, updated every poll tick.
    fn set_pids(&mut self, _pids: &[u32]) {}

    /// Called every poll tick. `Ok(false)` ends the analysis.
    fn check(&mut self, _ctx: &PackageContext) -> Result<bool, Error> {
        Ok(true)
    }

    /// Called once the analysis is over, before processes are terminated.
    fn finish(&mut self, _ctx: &PackageContext) -> Result<(), Error> {
        Ok(())
    }
}

pub trait Auxiliary: Send {
    fn start(&mut self, ctx: &PackageContext) -> Result<(), Error>;

    /// Called at shutdown before monitored processes are terminated.
    fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called at shutdown after monitored processes are terminated.
    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

pub type PackageFactory = fn() -> Box<dyn Package>;
pub type AuxiliaryFactory = fn() -> Box<dyn Auxiliary>;

#[derive(Default)]
pub struct PackageRegistry {
    factories: BTreeMap<String, PackageFactory>,
}

impl PackageRegistry {
    /// Registry with the built-in `exe` and `ie` packages.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register("exe", || Box::new(Exe::default()));
        registry.register("ie", || Box::new(InternetExplorer::default()));
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, factory: PackageFactory) {
        self.factories.insert(tag.into(), factory);
    }

    pub fn create(&self, tag: &str) -> Result<Box<dyn Package>, Error> {
        self.factories
            .get(tag)
            .map(|factory| factory())
            .ok_or_else(|| Error::UnknownPackage(tag.to_owned()))
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[derive(Default)]
pub struct AuxiliaryRegistry {
    factories: BTreeMap<String, AuxiliaryFactory>,
}

impl AuxiliaryRegistry {
    pub fn register(&mut self, tag: impl Into<String>, factory: AuxiliaryFactory) {
        self.factories.insert(tag.into(), factory);
    }

    /// Instantiate and start every module in `tags`. Modules that are
    /// unknown or fail to start are logged and left out.
    pub fn start_all(
        &self,
        tags: &[String],
        ctx: &PackageContext,
    ) -> Vec<(String, Box<dyn Auxiliary>)> {
        let mut started = Vec::new();
        for tag in tags {
            let Some(factory) = self.factories.get(tag) else {
                warn!(module = %tag, "auxiliary module is not available");
                continue;
            };
            let mut module = factory();
            match module.start(ctx) {
                Ok(()) => {
                    info!(module = %tag, "started auxiliary module");
                    started.push((tag.clone(), module));
                }
                Err(err) => warn!(module = %tag, %err, "cannot execute auxiliary module"),
            }
        }
        started
    }
}

/// Pick a package for a submission that did not name one.
pub fn choose_package(analysis: &Analysis) -> Result<&'static str, Error> {
    if analysis.category == Category::Url {
        return Ok("ie");
    }
    let file_type = analysis.file_type.as_str();
    let name = analysis.file_name.to_ascii_lowercase();
    let is_pe = file_type.contains("PE32") || file_type.contains("MS-DOS executable");
    if is_pe && !file_type.contains("DLL") {
        return Ok("exe");
    }
    if file_type.is_empty() && name.ends_with(".exe") {
        return Ok("exe");
    }
    Err(Error::NoPackage(analysis.file_type.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(category: Category, file_type: &str, file_name: &str) -> Analysis {
        Analysis {
            category,
            file_type: file_type.into(),
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn urls_open_in_the_browser() {
        let url = analysis(Category::Url, "", "");
        assert_eq!(choose_package(&url).unwrap(), "ie");
    }

    #[test]
    fn pe_executables_run_directly() {
        let exe = analysis(
            Category::File,
            "PE32 executable (GUI) Intel 80386, for MS Windows",
            "sample.bin",
        );
        assert_eq!(choose_package(&exe).unwrap(), "exe");

        let untyped = analysis(Category::File, "", "Sample.EXE");
        assert_eq!(choose_package(&untyped).unwrap(), "exe");
    }

    #[test]
    fn other_files_have_no_package() {
        let dll = analysis(
            Category::File,
            "PE32 executable (DLL) (GUI) Intel 80386, for MS Windows",
            "a.dll",
        );
        assert!(matches!(choose_package(&dll), Err(Error::NoPackage(_))));

        let pdf = analysis(Category::File, "PDF document, version 1.4", "a.pdf");
        assert!(matches!(
            choose_package(&pdf),
            Err(Error::NoPackage(ref kind)) if kind == "PDF document, version 1.4"
        ));
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let registry = PackageRegistry::builtin();
        assert_eq!(registry.tags().collect::<Vec<_>>(), ["exe", "ie"]);
        assert!(registry.create("exe").is_ok());
        assert!(matches!(
            registry.create("doc"),
            Err(Error::UnknownPackage(ref tag)) if tag == "doc"
        ));
    }
}
