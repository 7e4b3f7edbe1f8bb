use super::{Package, PackageContext};
use crate::error::Error;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Runs the submitted file as an executable.
///
/// Options: `arguments` is passed on the command line, `appdata` copies the
/// sample into `%APPDATA%` first and runs it from there.
#[derive(Debug, Default)]
pub struct Exe {
    pids: Vec<u32>,
}

impl Package for Exe {
    fn start(&mut self, target: &str, ctx: &PackageContext) -> Result<Vec<u32>, Error> {
        let mut path = PathBuf::from(target);
        if !path.is_file() {
            return Err(Error::NotExecutable(path));
        }
        if ctx.options.enabled("appdata") {
            path = copy_to_appdata(&path).unwrap_or(path);
        }
        let pid = ctx.execute(&path, ctx.options.get("arguments"))?;
        self.pids = vec![pid];
        Ok(vec![pid])
    }

    fn set_pids(&mut self, pids: &[u32]) {
        self.pids = pids.to_vec();
    }

    fn finish(&mut self, ctx: &PackageContext) -> Result<(), Error> {
        if ctx.options.procmemdump() {
            ctx.dump_memory(&self.pids);
        }
        Ok(())
    }
}

fn copy_to_appdata(path: &Path) -> Option<PathBuf> {
    let Some(appdata) = std::env::var_os("APPDATA") else {
        warn!("APPDATA is not set, running sample in place");
        return None;
    };
    let name = path.file_name()?;
    let destination = Path::new(&appdata).join(name);
    match std::fs::copy(path, &destination) {
        Ok(_) => {
            info!(path = %destination.display(), "copied sample to appdata");
            Some(destination)
        }
        Err(err) => {
            warn!(path = %destination.display(), %err, "unable to copy sample to appdata");
            None
        }
    }
}
