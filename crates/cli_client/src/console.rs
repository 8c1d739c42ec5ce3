//! Standard output console

use impcloud_core::ConsoleSink;
use std::io::Write;

/// Writes each console line to stdout as soon as it is produced
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn write_line(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        // A closed stdout (e.g. piped into `head`) just drops output
        let _ = writeln!(out, "{text}");
        let _ = out.flush();
    }
}
