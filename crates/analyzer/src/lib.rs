//! In-guest agent of a dynamic analysis sandbox.
//!
//! [`Analyzer`] starts a sample through a [`package`], injects the
//! instrumentation into every process it spawns and follows them through
//! the notifications they send back over the [`protocol`] channel.

#![deny(unsafe_code)]

pub mod clock;
pub mod context;
pub mod engine;
mod error;
pub mod files;
pub mod host;
pub mod inject_config;
pub mod loader;
pub mod package;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod sink;

pub use context::Context;
pub use engine::{Analyzer, Outcome, RunNames};
pub use error::Error;
pub use host::{Completion, HostReporter};
