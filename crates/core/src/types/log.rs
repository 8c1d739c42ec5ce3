//! Log records received from the cloud log stream

use chrono::{DateTime, FixedOffset, Local};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

use crate::linemap::{ErrorLocationMapper, SourceKind};

/// Console timestamp layout, e.g. `2024-03-08 16:54:07+0000`
pub const CONSOLE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

/// One log record as delivered by the stream
///
/// Payload layout on the wire: `<device-id> <rfc3339-timestamp> <type> <message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub device_id: String,
    pub timestamp: DateTime<FixedOffset>,
    /// Raw server type, e.g. `agent.log` or `server.error`
    pub log_type: String,
    pub message: String,
}

impl LogRecord {
    pub fn new(
        device_id: impl Into<String>,
        timestamp: DateTime<FixedOffset>,
        log_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            log_type: log_type.into(),
            message: message.into(),
        }
    }

    /// Parse a single payload line; `None` if the line is not a log record
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim_end_matches('\r').splitn(4, ' ');
        let device_id = parts.next().filter(|s| !s.is_empty())?;
        let timestamp = DateTime::parse_from_rfc3339(parts.next()?).ok()?;
        let log_type = parts.next().filter(|s| !s.is_empty())?;
        let message = parts.next().unwrap_or("");
        Some(Self::new(device_id, timestamp, log_type, message))
    }

    pub fn tag(&self) -> LogTag {
        LogTag::from_type(&self.log_type)
    }

    /// Source kind whose line table applies to this record's error location
    pub fn error_source(&self) -> Option<SourceKind> {
        match self.log_type.as_str() {
            "agent.error" => Some(SourceKind::Agent),
            "server.error" | "device.error" => Some(SourceKind::Device),
            _ => None,
        }
    }

    /// Render the console line, rewriting runtime error locations when the
    /// current build knows them
    pub fn render(&self, mapper: &ErrorLocationMapper) -> String {
        let message = match self.error_source() {
            Some(kind) => remap_error_location(&self.message, kind, mapper),
            None => self.message.clone(),
        };
        format!(
            "{} [{}] {} {}",
            self.timestamp.format(CONSOLE_TIME_FORMAT),
            self.device_id,
            self.tag(),
            message
        )
    }
}

/// Console tag for a server log type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Agent,
    Device,
    Server,
    Unrecognized,
}

impl LogTag {
    pub fn from_type(log_type: &str) -> Self {
        match log_type {
            "agent.log" | "agent.error" => LogTag::Agent,
            "server.log" | "server.error" | "device.log" | "device.error" | "lastexitcode" => {
                LogTag::Device
            }
            "status" | "server.status" | "powerstate" | "firmware" => LogTag::Server,
            other => {
                tracing::debug!("Unrecognized log type: {}", other);
                LogTag::Unrecognized
            }
        }
    }
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTag::Agent => f.write_str("[Agent]"),
            LogTag::Device => f.write_str("[Device]"),
            LogTag::Server => f.write_str("[Server]"),
            LogTag::Unrecognized => f.write_str("[Unrecognized]"),
        }
    }
}

fn error_location() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ERROR:\s*at\s+(\S+):(\d+)").expect("valid error pattern"))
}

/// Rewrite `ERROR: at <func>:<line>` into `ERROR: at <func> (<file>:<line>)`.
/// Messages that do not match, or whose line is unmapped, are returned as is.
pub fn remap_error_location(message: &str, kind: SourceKind, mapper: &ErrorLocationMapper) -> String {
    let Some(caps) = error_location().captures(message) else {
        return message.to_string();
    };
    let Ok(line) = caps[2].parse::<usize>() else {
        return message.to_string();
    };
    let Some(location) = line.checked_sub(1).and_then(|l| mapper.lookup(kind, l)) else {
        tracing::debug!("No line mapping for {} line {}", kind, line);
        return message.to_string();
    };

    let (Some(whole), Some(func)) = (caps.get(0), caps.get(1)) else {
        return message.to_string();
    };
    format!(
        "{}{} ({}){}",
        &message[..func.start()],
        func.as_str(),
        location,
        &message[whole.end()..]
    )
}

/// Synthetic console line for a session notice, stamped with local time
pub fn render_notice(text: &str) -> String {
    format!("{} [impcloud] {}", Local::now().format(CONSOLE_TIME_FORMAT), text)
}

/// Console line for a payload that is not a well-formed record
pub fn render_raw(payload: &str) -> String {
    format!(
        "{} [unknown] {} {}",
        Local::now().format(CONSOLE_TIME_FORMAT),
        LogTag::Unrecognized,
        payload
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linemap::{LineTable, SourceLocation};

    fn ts(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn test_parse_record() {
        let record =
            LogRecord::parse("0c2a6fb9e27ef7ee 2024-03-08T16:54:07.964Z agent.log hello world")
                .unwrap();
        assert_eq!(record.device_id, "0c2a6fb9e27ef7ee");
        assert_eq!(record.log_type, "agent.log");
        assert_eq!(record.message, "hello world");
        assert_eq!(record.tag(), LogTag::Agent);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LogRecord::parse("").is_none());
        assert!(LogRecord::parse("dev not-a-time agent.log x").is_none());
        assert!(LogRecord::parse("dev 2024-03-08T16:54:07Z").is_none());
    }

    #[test]
    fn test_render_console_line() {
        let record = LogRecord::new(
            "abc",
            ts("2024-03-08T16:54:07+02:00"),
            "server.log",
            "temp=21",
        );
        let line = record.render(&ErrorLocationMapper::new());
        assert_eq!(line, "2024-03-08 16:54:07+0200 [abc] [Device] temp=21");
    }

    #[test]
    fn test_status_is_tagged_as_server() {
        let record = LogRecord::parse("abc 2024-03-08T16:54:07+02:00 status Device connected").unwrap();
        assert_eq!(record.tag(), LogTag::Server);
        assert_eq!(
            record.render(&ErrorLocationMapper::new()),
            "2024-03-08 16:54:07+0200 [abc] [Server] Device connected"
        );
    }

    #[test]
    fn test_render_remaps_error_location() {
        let mut mapper = ErrorLocationMapper::new();
        mapper.install(LineTable::from_entries([(
            (SourceKind::Agent, 4),
            SourceLocation::new("lib/util.nut", 12),
        )]));
        let record = LogRecord::new("abc", ts("2024-03-08T16:54:07Z"), "agent.error", "ERROR:   at main:5");

        let line = record.render(&mapper);
        assert!(line.ends_with("[Agent] ERROR:   at main (lib/util.nut:12)"), "{line}");
    }

    #[test]
    fn test_unmapped_error_is_kept() {
        let mapper = ErrorLocationMapper::new();
        let message = "ERROR: at onTick:77";
        assert_eq!(remap_error_location(message, SourceKind::Device, &mapper), message);
        assert_eq!(remap_error_location("plain", SourceKind::Device, &mapper), "plain");
        assert_eq!(remap_error_location("ERROR: at f:0", SourceKind::Device, &mapper), "ERROR: at f:0");
    }

    #[test]
    fn test_unknown_type_tag() {
        assert_eq!(LogTag::from_type("weird").to_string(), "[Unrecognized]");
        assert_eq!(LogTag::from_type("status").to_string(), "[Server]");
    }
}
