use super::{Package, PackageContext};
use crate::error::Error;
use std::path::PathBuf;

const ROOTS: [&str; 2] = ["ProgramFiles", "ProgramFiles(x86)"];

/// Opens the target URL in Internet Explorer.
///
/// The `browser` option overrides the executable, otherwise it is looked
/// up under the program files directories.
#[derive(Debug, Default)]
pub struct InternetExplorer {
    pids: Vec<u32>,
}

impl InternetExplorer {
    fn browser(ctx: &PackageContext) -> Result<PathBuf, Error> {
        if let Some(browser) = ctx.options.get("browser").filter(|b| !b.is_empty()) {
            return Ok(PathBuf::from(browser));
        }
        ROOTS
            .into_iter()
            .filter_map(std::env::var_os)
            .map(|root| {
                PathBuf::from(root)
                    .join("Internet Explorer")
                    .join("iexplore.exe")
            })
            .find(|path| path.is_file())
            .ok_or_else(|| Error::Package("unable to find any Internet Explorer executable".into()))
    }
}

impl Package for InternetExplorer {
    fn start(&mut self, target: &str, ctx: &PackageContext) -> Result<Vec<u32>, Error> {
        let browser = Self::browser(ctx)?;
        let args = format!("\"{target}\"");
        let pid = ctx.execute(&browser, Some(&args))?;
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
