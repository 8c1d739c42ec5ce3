//! Impcloud Core - log streaming and command engine for the device cloud
//!
//! This crate provides:
//! - Incremental framing of the cloud's log event stream
//! - The log session state machine with dedup and error-line remapping
//! - The command prerequisite chain and its remediation steps
//! - Build, deploy and pull of project sources
//! - The project registry and log scheduler
//!
//! Network, terminal and preprocessor access stay behind the
//! [`CloudGateway`], [`ConsoleSink`], [`Prompter`] and [`Builder`] traits.

pub mod actions;
pub mod auth;
pub mod chain;
pub mod dedup;
pub mod deploy;
pub mod error;
pub mod gateway;
pub mod linemap;
pub mod prompt;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use actions::{ProjectActions, Services};
pub use auth::{AccessToken, CredentialCache};
pub use chain::{ChainOutcome, CommandDispatcher, PrerequisiteChain};
pub use deploy::{BuildOutput, Builder, DeployOutcome};
pub use error::{ApiError, CompileDiagnostic, CoreError, Result};
pub use gateway::{ApiResult, CloudGateway, ConsoleSink, Deployment, Device, DeviceGroup, LogStreamInfo, Product};
pub use linemap::{ErrorLocationMapper, LineTable, SourceKind, SourceLocation};
pub use prompt::Prompter;
pub use scheduler::{ProjectEntry, Scheduler, SchedulerConfig, SessionRegistry, TickReport};
pub use session::{LogSession, SessionConfig, SessionState};
pub use settings::{ProjectSettings, SettingsStore, DEFAULT_CLOUD_URL};
pub use transport::{ChannelStream, LogStream, StreamFeeder};
pub use types::{Command, CommandInvocation, InvocationTag, LogRecord};
