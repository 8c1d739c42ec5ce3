//! Error types for impcloud-core

use thiserror::Error;

/// One compiler diagnostic returned by a rejected deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileDiagnostic {
    /// Which half of the bundle failed to compile
    pub source: crate::SourceKind,
    /// 1-based row in the submitted (preprocessed) code
    pub row: usize,
    pub column: usize,
    pub message: String,
}

/// Error reported by the cloud gateway for a single call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("Invalid or expired credentials")]
    InvalidCredentials,

    #[error("Request rejected: {0}")]
    WrongInput(String),

    #[error("Compilation failed with {} error(s)", .0.len())]
    CompileFailure(Vec<CompileDiagnostic>),

    #[error("Cloud request failed: {0}")]
    Failure(String),
}

impl ApiError {
    /// True for errors that the prerequisite chain resolves by re-authenticating
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::InvalidCredentials)
    }
}

/// Core error type
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings format error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Log stream closed by the server")]
    ServerClosedStream,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Missing setting: {0}")]
    MissingSetting(&'static str),

    #[error("Build failed: {0}")]
    Build(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CoreError>;
