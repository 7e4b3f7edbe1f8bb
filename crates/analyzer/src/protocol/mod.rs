//! Notification protocol spoken by the instrumented processes.
//!
//! Every connection carries exactly one `TAG:payload` text message and gets
//! one response back, `OK` unless the command returns data. Behaviour logs
//! travel over separate per-process channels, see [`LogRelays`].

#![forbid(unsafe_code)]

mod command;
mod dispatch;
mod relay;
mod server;
pub mod transport;

pub use command::{Command, LogLevel};
pub use dispatch::{DispatchSettings, Dispatcher, OK};
pub use relay::LogRelays;
pub use server::{PipeServer, ServerOptions};
