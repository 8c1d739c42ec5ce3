//! Wire framing for the log event stream

pub mod framer;

pub use framer::{Drain, EventStreamParser, ParserConfig, DEFAULT_MAX_FRAMES};
