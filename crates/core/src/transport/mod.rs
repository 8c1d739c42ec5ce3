//! Log stream transport
//!
//! - Non-blocking byte source owned by a session
//! - Pump helper feeding it from any async byte stream
//! - Keep-alive watchdog

pub mod keepalive;
pub mod stream;

pub use keepalive::{KeepAlive, KEEPALIVE_TIMEOUT};
pub use stream::{pump_to_channel, ChannelStream, LogStream, StreamFeeder, StreamRead};
