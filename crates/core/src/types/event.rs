//! Typed records produced by the log stream framer

/// Control value carried by a `state_change` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Stream is live and usable
    Opened,
    /// Server closed the stream
    Closed,
    /// Server reported an error for the stream
    Error(String),
}

impl StreamState {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "opened" => StreamState::Opened,
            "closed" => StreamState::Closed,
            other => StreamState::Error(other.to_string()),
        }
    }
}

/// One framed event from the log stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    /// Payload of a message frame; multi-line payloads are joined with `\n`
    LogPayload(String),
    /// Control value of a state frame
    StateChange(StreamState),
    /// Liveness marker, carries no data
    KeepAlive,
    /// End of the current frame
    FrameEnd,
}

impl StreamRecord {
    /// Create payload record from text
    pub fn payload(text: impl Into<String>) -> Self {
        Self::LogPayload(text.into())
    }

    /// True for records that prove the stream is alive
    pub fn is_activity(&self) -> bool {
        !matches!(self, StreamRecord::FrameEnd)
    }
}
