#![forbid(unsafe_code)]

use crate::clock::Clock;
use crate::loader::Injector;
use crate::process::Platform;
use crate::registry::Registry;
use crate::sink::ResultSink;
use std::sync::Arc;

/// Collaborators shared by the orchestrator, the notification handlers and
/// the packages.
#[derive(Clone)]
pub struct Context {
    pub registry: Arc<Registry>,
    pub platform: Arc<dyn Platform>,
    pub injector: Arc<dyn Injector>,
    pub sink: Arc<dyn ResultSink>,
    pub clock: Arc<dyn Clock>,
}
