//! Commands and invocation contexts for the prerequisite chain

use std::fmt;

/// Every command the client can run, remediation steps included
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Convert pre-v5 project settings
    MigrateLegacyConfig,
    /// Locate the preprocessor toolchain
    SetBuilderPath,
    /// Configure the cloud API endpoint
    SetCloudEndpoint,
    /// Prompt for account credentials and log in
    EnterCredentials,
    /// Exchange the refresh token for a new access token
    RefreshCredentials,
    SelectProduct,
    SelectDeviceGroup,
    /// Fetch the current deployment's sources into the project
    PullCode,
    /// Open the log console and start streaming
    ShowConsole,
    /// Build and deploy the project sources
    Deploy,
    /// Show the agent URL of a device in the selected group
    GetAgentUrl,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Command::MigrateLegacyConfig => "migrate-legacy-config",
            Command::SetBuilderPath => "set-builder-path",
            Command::SetCloudEndpoint => "set-cloud-endpoint",
            Command::EnterCredentials => "enter-credentials",
            Command::RefreshCredentials => "refresh-credentials",
            Command::SelectProduct => "select-product",
            Command::SelectDeviceGroup => "select-device-group",
            Command::PullCode => "pull-code",
            Command::ShowConsole => "show-console",
            Command::Deploy => "deploy",
            Command::GetAgentUrl => "get-agent-url",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why an invocation was raised by the engine rather than the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationTag {
    /// The log stream hit an authorization failure; drop the cached token first
    Auth,
}

/// A command plus what to run once it completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub command: Command,
    pub continuation: Option<Box<CommandInvocation>>,
    pub tag: Option<InvocationTag>,
}

impl CommandInvocation {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            continuation: None,
            tag: None,
        }
    }

    /// Run `command` first, then resume `then`
    pub fn with_continuation(command: Command, then: CommandInvocation) -> Self {
        Self {
            command,
            continuation: Some(Box::new(then)),
            tag: None,
        }
    }

    pub fn tagged(mut self, tag: InvocationTag) -> Self {
        self.tag = Some(tag);
        self
    }

    /// Command that will run right after this one, if any
    pub fn next_command(&self) -> Option<Command> {
        self.continuation.as_ref().map(|c| c.command)
    }

    /// Number of invocations in the continuation chain, this one included
    pub fn depth(&self) -> usize {
        1 + self.continuation.as_ref().map_or(0, |c| c.depth())
    }
}
