//! Cloud gateway and console abstractions
//!
//! The engine never builds HTTP requests itself. Every cloud call goes
//! through [`CloudGateway`], and every displayed line through
//! [`ConsoleSink`].

use async_trait::async_trait;
use std::sync::Mutex;

use crate::auth::AccessToken;
use crate::error::ApiError;
use crate::transport::LogStream;

/// Result of a single gateway call
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: Option<String>,
}

/// Public base of agent URLs; the agent id is appended
pub const AGENT_URL_BASE: &str = "https://agent.electricimp.com/";

/// URL under which a device's agent answers HTTP requests
pub fn agent_url(agent_id: &str) -> String {
    format!("{AGENT_URL_BASE}{agent_id}")
}

/// Server-side log stream resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamInfo {
    pub id: String,
}

/// A deployed code revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub id: String,
    pub agent_code: String,
    pub device_code: String,
}

/// Operations the engine needs from the device cloud
#[async_trait]
pub trait CloudGateway: Send + Sync {
    /// Exchange account credentials for a token
    async fn login(&self, id: &str, password: &str) -> ApiResult<AccessToken>;

    /// Exchange a refresh token for a new access token
    async fn refresh_access_token(&self, refresh_token: &str) -> ApiResult<AccessToken>;

    async fn list_products(&self, token: &str) -> ApiResult<Vec<Product>>;

    async fn list_device_groups(&self, token: &str, product_id: &str) -> ApiResult<Vec<DeviceGroup>>;

    async fn list_devices(
        &self,
        token: &str,
        owner_id: Option<&str>,
        group_id: Option<&str>,
    ) -> ApiResult<Vec<Device>>;

    async fn create_log_stream(&self, token: &str) -> ApiResult<LogStreamInfo>;

    /// Open the persistent connection; `None` if the server refused it
    async fn open_log_stream(
        &self,
        token: &str,
        stream_id: &str,
    ) -> ApiResult<Option<Box<dyn LogStream>>>;

    async fn attach_device(&self, token: &str, stream_id: &str, device_id: &str) -> ApiResult<()>;

    async fn create_deployment(
        &self,
        token: &str,
        group_id: &str,
        agent_code: &str,
        device_code: &str,
    ) -> ApiResult<Deployment>;

    /// Restart the group's devices that are not running its current deployment
    async fn conditional_restart(&self, token: &str, group_id: &str) -> ApiResult<()>;

    /// Current deployment of a device group, if it has one
    async fn latest_deployment(&self, token: &str, group_id: &str) -> ApiResult<Option<Deployment>>;

    /// Agent id of a device; `None` until the device has an agent
    async fn device_agent_id(&self, token: &str, device_id: &str) -> ApiResult<Option<String>>;
}

/// Destination for fully assembled console lines
pub trait ConsoleSink: Send + Sync {
    fn write_line(&self, text: &str);
}

/// Console that keeps lines in memory
#[derive(Debug, Default)]
pub struct MemoryConsole {
    lines: Mutex<Vec<String>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of lines containing `needle`
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines().iter().filter(|l| l.contains(needle)).count()
    }
}

impl ConsoleSink for MemoryConsole {
    fn write_line(&self, text: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(text.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_url() {
        assert_eq!(agent_url("Xy12ab"), "https://agent.electricimp.com/Xy12ab");
    }

    #[test]
    fn test_memory_console_collects_lines() {
        let console = MemoryConsole::new();
        console.write_line("one");
        console.write_line("two one");
        assert_eq!(console.lines(), vec!["one", "two one"]);
        assert_eq!(console.count_containing("one"), 2);
    }
}
