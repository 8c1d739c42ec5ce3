//! Command prerequisite chain
//!
//! Before any command runs, the ordered prerequisite list is walked from
//! the start. The first prerequisite that does not hold has its remediation
//! command run first, with the original command threaded through as the
//! continuation. Remediation commands go through the same walk, so a
//! remediation gets its own earlier prerequisites satisfied before it runs.
//!
//! [`CommandDispatcher::execute`] is the only entry point and runs the whole
//! chain as a loop.

use async_trait::async_trait;

use crate::types::{Command, CommandInvocation};
use crate::{CoreError, Result};

/// Consecutive `Retry` outcomes tolerated for a single step
pub const MAX_RETRIES: usize = 5;

/// Condition a prerequisite requires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    /// No pre-migration settings file is present
    NoLegacyConfig,
    /// Node and Builder paths are configured
    BuilderPathSet,
    /// A cloud endpoint is configured
    CloudEndpoint,
    /// Some access token is cached
    CredentialsPresent,
    /// The cached access token has not expired
    CredentialsFresh,
    ProductSelected,
    DeviceGroupSelected,
    /// The device group's current code was fetched into the project
    CodePulled,
}

/// A check plus the command that makes it hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prerequisite {
    pub name: &'static str,
    pub check: Check,
    pub remediation: Command,
}

/// Default ordered list
pub const DEFAULT_PREREQUISITES: [Prerequisite; 8] = [
    Prerequisite {
        name: "legacy settings migrated",
        check: Check::NoLegacyConfig,
        remediation: Command::MigrateLegacyConfig,
    },
    Prerequisite {
        name: "builder toolchain located",
        check: Check::BuilderPathSet,
        remediation: Command::SetBuilderPath,
    },
    Prerequisite {
        name: "cloud endpoint configured",
        check: Check::CloudEndpoint,
        remediation: Command::SetCloudEndpoint,
    },
    Prerequisite {
        name: "credentials present",
        check: Check::CredentialsPresent,
        remediation: Command::EnterCredentials,
    },
    Prerequisite {
        name: "credentials fresh",
        check: Check::CredentialsFresh,
        remediation: Command::RefreshCredentials,
    },
    Prerequisite {
        name: "product selected",
        check: Check::ProductSelected,
        remediation: Command::SelectProduct,
    },
    Prerequisite {
        name: "device group selected",
        check: Check::DeviceGroupSelected,
        remediation: Command::SelectDeviceGroup,
    },
    Prerequisite {
        name: "code pulled",
        check: Check::CodePulled,
        remediation: Command::PullCode,
    },
];

/// Answers prerequisite checks against the current project state
#[async_trait]
pub trait PrerequisiteState: Send + Sync {
    async fn holds(&self, check: Check) -> bool;
}

/// What the walk decided for a target command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Every earlier prerequisite holds
    Execute,
    /// `command` must run before the target
    Remediate { command: Command, check: Check },
}

/// Ordered, fixed list of prerequisites
#[derive(Debug, Clone)]
pub struct PrerequisiteChain {
    prerequisites: Vec<Prerequisite>,
}

impl Default for PrerequisiteChain {
    fn default() -> Self {
        Self::new(DEFAULT_PREREQUISITES.to_vec())
    }
}

impl PrerequisiteChain {
    pub fn new(prerequisites: Vec<Prerequisite>) -> Self {
        Self { prerequisites }
    }

    pub fn prerequisites(&self) -> &[Prerequisite] {
        &self.prerequisites
    }

    /// Prerequisite remediated by `command`, if it is a remediation
    pub fn remediated_by(&self, command: Command) -> Option<&Prerequisite> {
        self.prerequisites.iter().find(|p| p.remediation == command)
    }

    /// Walk from the first entry. Reaching the target's own entry, or the
    /// end of the list, means the target may run.
    pub async fn evaluate(&self, target: Command, state: &dyn PrerequisiteState) -> Evaluation {
        for prerequisite in &self.prerequisites {
            if prerequisite.remediation == target {
                return Evaluation::Execute;
            }
            if !state.holds(prerequisite.check).await {
                tracing::debug!(
                    "{}: prerequisite '{}' not met",
                    target,
                    prerequisite.name
                );
                return Evaluation::Remediate {
                    command: prerequisite.remediation,
                    check: prerequisite.check,
                };
            }
        }
        Evaluation::Execute
    }
}

/// Result of running one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed,
    /// The user declined; the whole chain stops
    Canceled,
    /// Run the same step again after re-checking its prerequisites
    Retry,
}

/// How a dispatched chain ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Completed,
    Canceled,
}

/// Runs commands once their prerequisites hold
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Called once before the first evaluation of a dispatched invocation
    async fn begin(&self, _invocation: &CommandInvocation) -> Result<()> {
        Ok(())
    }

    async fn run(&self, invocation: &CommandInvocation) -> Result<ActionOutcome>;
}

/// Single entry point that threads continuations through remediation hops
#[derive(Debug, Clone, Default)]
pub struct CommandDispatcher {
    chain: PrerequisiteChain,
}

impl CommandDispatcher {
    pub fn new(chain: PrerequisiteChain) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &PrerequisiteChain {
        &self.chain
    }

    /// Run `invocation` and every continuation it carries
    pub async fn execute(
        &self,
        invocation: CommandInvocation,
        state: &dyn PrerequisiteState,
        handler: &dyn ActionHandler,
    ) -> Result<ChainOutcome> {
        handler.begin(&invocation).await?;

        let mut current = invocation;
        let mut just_completed: Option<Command> = None;
        let mut retries = 0;

        loop {
            if let Evaluation::Remediate { command, check } =
                self.chain.evaluate(current.command, state).await
            {
                debug_assert_ne!(command, current.command, "remediation is its own continuation");
                if just_completed == Some(command) {
                    return Err(CoreError::InvalidState(format!(
                        "{} completed but {:?} still does not hold",
                        command, check
                    )));
                }
                tracing::info!("{} needs {} first", current.command, command);
                current = CommandInvocation::with_continuation(command, current);
                just_completed = None;
                continue;
            }

            tracing::debug!("Running {}", current.command);
            match handler.run(&current).await? {
                ActionOutcome::Completed => {
                    retries = 0;
                    just_completed = Some(current.command);
                    match current.continuation.take() {
                        Some(next) => current = *next,
                        None => return Ok(ChainOutcome::Completed),
                    }
                }
                ActionOutcome::Canceled => {
                    tracing::info!("{} canceled", current.command);
                    return Ok(ChainOutcome::Canceled);
                }
                ActionOutcome::Retry => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(CoreError::InvalidState(format!(
                            "{} did not succeed after {} retries",
                            current.command, MAX_RETRIES
                        )));
                    }
                    tracing::debug!("Retrying {} ({})", current.command, retries);
                    just_completed = None;
                }
            }
        }
    }
}
