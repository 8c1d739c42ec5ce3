//! Domain types for the log engine and command chain

mod command;
mod event;
mod log;

pub use command::{Command, CommandInvocation, InvocationTag};
pub use event::{StreamRecord, StreamState};
pub use log::{
    remap_error_location, render_notice, render_raw, LogRecord, LogTag, CONSOLE_TIME_FORMAT,
};
