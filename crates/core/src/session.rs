//! Log streaming session state machine
//!
//! ```text
//!        start()            first query_logs()
//! IDLE ──────────▶ INIT ───────────────────────▶ POLL ──┐ query_logs()
//!  ▲                │ no devices                  │  ◀──┘
//!  └────────────────┘                             │
//!  ▲            stop() / reset() / server close   │
//!  └──────────────────────────────────────────────┘
//! any ──▶ FAIL on unrecoverable errors, left only through reset()
//! ```
//!
//! Invariant: the stream handle exists exactly while the state is `Poll`.

use std::collections::HashSet;
use std::time::Duration;

use crate::dedup::LogCursor;
use crate::error::{ApiError, CoreError};
use crate::gateway::{CloudGateway, ConsoleSink};
use crate::linemap::ErrorLocationMapper;
use crate::protocol::{EventStreamParser, ParserConfig};
use crate::transport::{KeepAlive, LogStream, KEEPALIVE_TIMEOUT};
use crate::types::{render_notice, render_raw, LogRecord, StreamRecord, StreamState};

/// Console notices written by the session
pub mod notice {
    pub const STREAM_REQUESTED: &str = "Log stream requested";
    pub const ASSIGN_DEVICE: &str =
        "No devices in the device group. Assign a device to the group to see its logs";
    pub const STREAM_STARTED: &str = "Log stream started";
    pub const STREAM_STOPPED: &str = "Log stream stopped";
    pub const STREAM_RESTARTING: &str = "Log stream restarting";
}

/// Lifecycle state of a [`LogSession`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Init,
    Poll,
    Fail,
}

/// Session tunables
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub parser: ParserConfig,
    /// Silence tolerated on an open stream
    pub keepalive_timeout: Duration,
    /// Consecutive malformed lines before the session fails
    pub max_malformed: usize,
    /// Consecutive transport failures before the session fails
    pub max_transport_failures: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            parser: ParserConfig::default(),
            keepalive_timeout: KEEPALIVE_TIMEOUT,
            max_malformed: 3,
            max_transport_failures: 3,
        }
    }
}

/// Which devices the stream follows
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamTarget {
    pub device_group_id: Option<String>,
    pub owner_id: Option<String>,
}

/// Collaborators borrowed for one session call
pub struct SessionContext<'a> {
    pub gateway: &'a dyn CloudGateway,
    pub console: &'a dyn ConsoleSink,
    pub mapper: &'a ErrorLocationMapper,
    /// Current bearer token; `None` when no credentials are cached
    pub token: Option<&'a str>,
}

/// What a `query_logs` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Nothing to do in the current state
    Idle,
    /// INIT completed, the stream is open
    Started,
    /// Read cycle on an open stream
    Streaming { emitted: usize },
    /// Stream was dropped and will be reopened on a later tick
    Reset,
    /// Credentials were rejected; `token` is the value that failed
    AuthRequired { token: Option<String> },
    /// Session entered FAIL
    Failed,
}

enum Entry {
    Record(LogRecord),
    Raw(String),
}

/// One log stream for one project
pub struct LogSession {
    state: SessionState,
    stream: Option<Box<dyn LogStream>>,
    poll_token: Option<String>,
    devices: Option<Vec<String>>,
    attached: HashSet<String>,
    parser: EventStreamParser,
    cursor: LogCursor,
    keepalive: KeepAlive,
    target: StreamTarget,
    auto_start: bool,
    transport_failures: usize,
    config: SessionConfig,
}

impl Default for LogSession {
    fn default() -> Self {
        Self::new(StreamTarget::default(), SessionConfig::default())
    }
}

impl LogSession {
    pub fn new(target: StreamTarget, config: SessionConfig) -> Self {
        Self {
            state: SessionState::Idle,
            stream: None,
            poll_token: None,
            devices: None,
            attached: HashSet::new(),
            parser: EventStreamParser::new(config.parser),
            cursor: LogCursor::new(),
            keepalive: KeepAlive::new(config.keepalive_timeout),
            target,
            auto_start: false,
            transport_failures: 0,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn poll_token(&self) -> Option<&str> {
        self.poll_token.as_deref()
    }

    pub fn last_emitted(&self) -> Option<&LogRecord> {
        self.cursor.last()
    }

    pub fn target(&self) -> &StreamTarget {
        &self.target
    }

    /// True when the scheduler should move this session out of IDLE
    pub fn wants_start(&self) -> bool {
        self.state == SessionState::Idle && self.auto_start
    }

    /// Follow a different device group; forces device re-resolution
    pub fn set_target(&mut self, target: StreamTarget) {
        if self.target != target {
            tracing::debug!("Log session target changed: {:?}", target);
            self.target = target;
            self.devices = None;
        }
    }

    /// IDLE → INIT
    pub fn start(&mut self, console: &dyn ConsoleSink) -> bool {
        if self.state != SessionState::Idle {
            tracing::debug!("start() ignored in state {:?}", self.state);
            return false;
        }
        self.state = SessionState::Init;
        self.auto_start = true;
        console.write_line(&render_notice(notice::STREAM_REQUESTED));
        true
    }

    /// Close the stream and go IDLE; with `restart` the scheduler reopens it
    /// on its next tick
    pub fn stop(&mut self, console: &dyn ConsoleSink, restart: bool) {
        self.close_stream();
        self.devices = None;
        self.state = SessionState::Idle;
        self.auto_start = restart;
        if restart {
            tracing::info!("Log stream restarting");
            console.write_line(&render_notice(notice::STREAM_RESTARTING));
        } else {
            tracing::info!("Log stream stopped");
            console.write_line(&render_notice(notice::STREAM_STOPPED));
        }
    }

    /// Universal recovery: drop connection, cursor and watchdog, then stop
    pub fn reset(&mut self, console: &dyn ConsoleSink, restart: bool) {
        self.close_stream();
        self.cursor.clear();
        self.keepalive.clear();
        self.parser.reset();
        self.stop(console, restart);
    }

    /// Advance INIT → POLL, or read what the open stream has buffered
    pub async fn query_logs(&mut self, ctx: &SessionContext<'_>) -> QueryOutcome {
        match self.state {
            SessionState::Idle => QueryOutcome::Idle,
            SessionState::Fail => QueryOutcome::Failed,
            SessionState::Init => self.open(ctx).await,
            SessionState::Poll => self.poll(ctx),
        }
    }

    async fn open(&mut self, ctx: &SessionContext<'_>) -> QueryOutcome {
        let Some(token) = ctx.token else {
            return self.auth_required(None);
        };

        if self.devices.is_none() {
            let group = self.target.device_group_id.as_deref();
            let owner = self.target.owner_id.as_deref();
            match ctx.gateway.list_devices(token, owner, group).await {
                Ok(devices) => {
                    self.devices = Some(devices.into_iter().map(|d| d.id).collect());
                }
                Err(err) => return self.api_failure(ctx, token, err, "resolve devices"),
            }
        }

        let devices = self.devices.clone().unwrap_or_default();
        if devices.is_empty() {
            ctx.console.write_line(&render_notice(notice::ASSIGN_DEVICE));
            self.devices = None;
            self.state = SessionState::Idle;
            self.auto_start = false;
            return QueryOutcome::Idle;
        }

        let info = match ctx.gateway.create_log_stream(token).await {
            Ok(info) => info,
            Err(err) => return self.api_failure(ctx, token, err, "create log stream"),
        };
        self.poll_token = Some(info.id.clone());

        let mut stream = match ctx.gateway.open_log_stream(token, &info.id).await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                self.poll_token = None;
                return self.transport_failure(ctx, "server refused the log stream connection");
            }
            Err(err) => {
                self.poll_token = None;
                return self.api_failure(ctx, token, err, "open log stream");
            }
        };

        self.attached.clear();
        for device in &devices {
            if self.attached.contains(device) {
                continue;
            }
            if let Err(err) = ctx.gateway.attach_device(token, &info.id, device).await {
                stream.close();
                self.poll_token = None;
                self.attached.clear();
                return self.api_failure(ctx, token, err, "attach device");
            }
            self.attached.insert(device.clone());
        }

        self.parser.reset();
        self.stream = Some(stream);
        self.state = SessionState::Poll;
        self.keepalive.record_activity();
        tracing::info!(
            "Log stream {} started for {} device(s)",
            info.id,
            self.attached.len()
        );
        ctx.console.write_line(&render_notice(notice::STREAM_STARTED));
        QueryOutcome::Started
    }

    fn poll(&mut self, ctx: &SessionContext<'_>) -> QueryOutcome {
        let Some(stream) = self.stream.as_mut() else {
            tracing::warn!("POLL without a stream, returning to IDLE");
            self.state = SessionState::Idle;
            return QueryOutcome::Idle;
        };

        let drain = match self.parser.read_available(stream.as_mut()) {
            Ok(drain) => drain,
            Err(err) => {
                tracing::warn!("Log stream read failed: {}", err);
                return self.transport_failure(ctx, &err.to_string());
            }
        };

        let mut entries = Vec::new();
        let mut closed: Option<Option<String>> = None;
        let mut active = false;
        for record in drain.records {
            active |= record.is_activity();
            match record {
                StreamRecord::LogPayload(text) => {
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        match LogRecord::parse(line) {
                            Some(record) => entries.push(Entry::Record(record)),
                            None => {
                                tracing::debug!("Unparseable log payload: {:?}", line);
                                entries.push(Entry::Raw(line.to_string()));
                            }
                        }
                    }
                }
                StreamRecord::StateChange(StreamState::Opened) => {
                    tracing::debug!("Log stream {:?} opened", self.poll_token);
                }
                StreamRecord::StateChange(StreamState::Closed) => closed = Some(None),
                StreamRecord::StateChange(StreamState::Error(reason)) => closed = Some(Some(reason)),
                StreamRecord::KeepAlive | StreamRecord::FrameEnd => {}
            }
        }

        if active {
            self.keepalive.record_activity();
        }

        // Everything parsed is shown before any close handling
        let emitted = self.emit(ctx, entries);
        if emitted > 0 {
            self.transport_failures = 0;
        }

        if let Some(reason) = closed {
            let text = match reason {
                Some(reason) => format!("{}: {}", CoreError::ServerClosedStream, reason),
                None => CoreError::ServerClosedStream.to_string(),
            };
            tracing::info!("{}", text);
            ctx.console.write_line(&render_notice(&text));
            self.reset(ctx.console, true);
            return QueryOutcome::Reset;
        }

        if drain.closed {
            if self.parser.has_pending_lines() {
                // The closed stream keeps reporting Closed; finish the backlog first
                tracing::debug!("Connection dropped, {} bytes still to show", self.parser.buffered());
                return QueryOutcome::Streaming { emitted };
            }
            return self.transport_failure(ctx, "connection dropped");
        }

        if self.parser.consecutive_malformed() >= self.config.max_malformed {
            return self.fail(ctx.console, "Log stream failed: repeated malformed data");
        }

        if self.keepalive.expired() {
            tracing::warn!(
                "No data or keep-alive for {:?}, dropping log stream",
                self.keepalive.idle()
            );
            self.reset(ctx.console, true);
            return QueryOutcome::Reset;
        }

        QueryOutcome::Streaming { emitted }
    }

    fn emit(&mut self, ctx: &SessionContext<'_>, entries: Vec<Entry>) -> usize {
        let records: Vec<LogRecord> = entries
            .iter()
            .filter_map(|e| match e {
                Entry::Record(r) => Some(r.clone()),
                Entry::Raw(_) => None,
            })
            .collect();
        let mut mask = self.cursor.admit(&records).into_iter();

        let mut emitted = 0;
        for entry in entries {
            match entry {
                Entry::Record(record) => {
                    if mask.next().unwrap_or(false) {
                        ctx.console.write_line(&record.render(ctx.mapper));
                        emitted += 1;
                    }
                }
                Entry::Raw(text) => {
                    ctx.console.write_line(&render_raw(&text));
                    emitted += 1;
                }
            }
        }
        emitted
    }

    fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.poll_token = None;
        self.attached.clear();
    }

    fn fail(&mut self, console: &dyn ConsoleSink, message: &str) -> QueryOutcome {
        tracing::error!("{}", message);
        self.close_stream();
        self.state = SessionState::Fail;
        self.auto_start = false;
        console.write_line(&render_notice(message));
        QueryOutcome::Failed
    }

    // The cursor survives so the resumed stream skips re-delivered records.
    fn auth_required(&mut self, token: Option<&str>) -> QueryOutcome {
        tracing::info!("Log stream needs fresh credentials");
        self.close_stream();
        self.devices = None;
        self.state = SessionState::Idle;
        self.auto_start = false;
        QueryOutcome::AuthRequired {
            token: token.map(str::to_string),
        }
    }

    fn api_failure(
        &mut self,
        ctx: &SessionContext<'_>,
        token: &str,
        err: ApiError,
        action: &str,
    ) -> QueryOutcome {
        if err.is_auth() {
            return self.auth_required(Some(token));
        }
        self.fail(ctx.console, &format!("Failed to {}: {}", action, err))
    }

    fn transport_failure(&mut self, ctx: &SessionContext<'_>, reason: &str) -> QueryOutcome {
        self.transport_failures += 1;
        if self.transport_failures >= self.config.max_transport_failures {
            return self.fail(ctx.console, &format!("Log stream failed: {}", reason));
        }
        tracing::debug!(
            "Transport failure {} of {}: {}",
            self.transport_failures,
            self.config.max_transport_failures,
            reason
        );
        self.reset(ctx.console, true);
        QueryOutcome::Reset
    }
}
