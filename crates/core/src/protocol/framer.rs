//! Incremental framer for the server-sent log event stream
//!
//! Bytes arrive in arbitrary chunks. Only complete lines are consumed and the
//! open frame survives across calls, so splitting the same byte sequence at
//! different boundaries yields the same records.

use crate::error::{CoreError, Result};
use crate::transport::{LogStream, StreamRead};
use crate::types::{StreamRecord, StreamState};

/// Default number of frames drained per call
pub const DEFAULT_MAX_FRAMES: usize = 30;

/// Maximum length of a single unterminated line (1MB)
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Framer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserConfig {
    /// Frames (and keep-alives) drained per call before yielding
    pub max_frames: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    None,
    Message,
    State { seen: bool },
    /// `event:` name we do not understand; its data lines are skipped
    Unknown,
}

/// Result of pulling everything currently available from a stream
#[derive(Debug, Default)]
pub struct Drain {
    pub records: Vec<StreamRecord>,
    /// The transport reported end-of-stream
    pub closed: bool,
}

/// Line-oriented SSE framer with saved parse position
#[derive(Debug)]
pub struct EventStreamParser {
    buffer: Vec<u8>,
    frame: Frame,
    payload: Vec<String>,
    malformed: usize,
    config: ParserConfig,
}

impl Default for EventStreamParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl EventStreamParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            buffer: Vec::new(),
            frame: Frame::None,
            payload: Vec::new(),
            malformed: 0,
            config,
        }
    }

    /// Append raw bytes
    ///
    /// # Errors
    /// `MessageTooLarge` if the unterminated tail exceeds 1MB; the buffer is
    /// discarded in that case.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);

        let tail_start = self
            .buffer
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |pos| pos + 1);
        let tail = self.buffer.len() - tail_start;
        if tail > MAX_LINE_LENGTH {
            self.buffer.clear();
            self.frame = Frame::None;
            self.payload.clear();
            return Err(CoreError::MessageTooLarge {
                size: tail,
                max: MAX_LINE_LENGTH,
            });
        }
        Ok(())
    }

    /// Consume complete lines until `max_frames` frames have ended or no
    /// complete line is left. Unconsumed bytes stay buffered.
    pub fn drain(&mut self) -> Vec<StreamRecord> {
        let mut out = Vec::new();
        let mut frames = 0;

        while frames < self.config.max_frames {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..pos]);
            frames += self.consume_line(text.trim_end_matches('\r'), &mut out);
        }

        out
    }

    /// Pull every chunk the stream has ready (never waits), then drain
    pub fn read_available(&mut self, stream: &mut dyn LogStream) -> Result<Drain> {
        let mut closed = false;
        loop {
            match stream.try_read() {
                StreamRead::Data(chunk) => self.push(&chunk)?,
                StreamRead::Empty => break,
                StreamRead::Closed => {
                    closed = true;
                    break;
                }
            }
        }
        Ok(Drain {
            records: self.drain(),
            closed,
        })
    }

    /// Unrecognised lines seen since the last well-formed frame
    pub fn consecutive_malformed(&self) -> usize {
        self.malformed
    }

    /// Bytes waiting for a line terminator or for the next drain
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// A complete line is still waiting for a later drain
    pub fn has_pending_lines(&self) -> bool {
        self.buffer.contains(&b'\n')
    }

    /// Forget all buffered bytes and frame state (new connection)
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.frame = Frame::None;
        self.payload.clear();
        self.malformed = 0;
    }

    // Returns the number of frames completed by this line.
    fn consume_line(&mut self, line: &str, out: &mut Vec<StreamRecord>) -> usize {
        if line.is_empty() {
            return self.finish_frame(out);
        }

        if line.starts_with(':') {
            let ended = self.finish_frame(out);
            out.push(StreamRecord::KeepAlive);
            return ended + 1;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => {
                let ended = self.finish_frame(out);
                match value.trim() {
                    "message" => self.frame = Frame::Message,
                    "state_change" => self.frame = Frame::State { seen: false },
                    "keepalive" | "keep-alive" => {
                        out.push(StreamRecord::KeepAlive);
                        return ended + 1;
                    }
                    other => {
                        tracing::debug!("Unknown stream event: {}", other);
                        self.malformed += 1;
                        self.frame = Frame::Unknown;
                    }
                }
                ended
            }
            "data" => {
                match self.frame {
                    // SSE default event type is `message`
                    Frame::None => {
                        self.frame = Frame::Message;
                        self.payload.push(value.to_string());
                    }
                    Frame::Message => self.payload.push(value.to_string()),
                    Frame::State { seen: false } => {
                        out.push(StreamRecord::StateChange(StreamState::parse(value)));
                        self.frame = Frame::State { seen: true };
                    }
                    Frame::State { seen: true } => {
                        tracing::debug!("Extra data line in state frame: {}", value);
                    }
                    Frame::Unknown => {}
                }
                0
            }
            "id" | "retry" => 0,
            _ => {
                tracing::debug!("Malformed stream line: {:?}", line);
                self.malformed += 1;
                0
            }
        }
    }

    fn finish_frame(&mut self, out: &mut Vec<StreamRecord>) -> usize {
        match std::mem::replace(&mut self.frame, Frame::None) {
            Frame::None => 0,
            Frame::Message => {
                if !self.payload.is_empty() {
                    out.push(StreamRecord::LogPayload(self.payload.join("\n")));
                    self.payload.clear();
                }
                self.malformed = 0;
                out.push(StreamRecord::FrameEnd);
                1
            }
            Frame::State { .. } => {
                self.malformed = 0;
                out.push(StreamRecord::FrameEnd);
                1
            }
            Frame::Unknown => {
                out.push(StreamRecord::FrameEnd);
                1
            }
        }
    }
}
