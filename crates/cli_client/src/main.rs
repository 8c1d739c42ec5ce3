//! impcloud command line client
//!
//! Runs one command through the prerequisite chain and, for `logs` and
//! `deploy --follow`, keeps streaming device logs until interrupted.

mod builder;
mod console;
mod http;
mod prompts;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use impcloud_core::{
    ChainOutcome, Command, CommandDispatcher, CommandInvocation, ConsoleSink, InvocationTag,
    ProjectActions, ProjectEntry, Scheduler, SchedulerConfig, Services, SessionConfig,
    SessionRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::builder::NodeBuilder;
use crate::console::StdoutConsole;
use crate::http::HttpGateway;
use crate::prompts::TerminalPrompter;

/// Device cloud client: deploy code and follow device logs
#[derive(Parser, Debug)]
#[command(name = "impcloud")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deploy code to device groups and stream their logs", long_about = None)]
struct Args {
    /// Project directory
    #[arg(short, long, default_value = ".")]
    project: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Do not restart idle log streams automatically
    #[arg(long, default_value = "false")]
    quiet: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Cmd {
    /// Stream device logs of the selected device group
    Logs,
    /// Build and deploy the project sources
    Deploy {
        /// Keep streaming logs after the deployment
        #[arg(long, default_value = "false")]
        follow: bool,
    },
    /// Log in to the cloud account
    Login,
    /// Choose the product
    SelectProduct,
    /// Choose the device group
    SelectGroup,
    /// Fetch the device group's current code
    Pull,
    /// Configure the preprocessor toolchain
    Builder,
    /// Convert legacy project settings
    Migrate,
    /// Print the agent URL of a device in the device group
    AgentUrl,
}

impl Cmd {
    fn command(self) -> Command {
        match self {
            Cmd::Logs => Command::ShowConsole,
            Cmd::Deploy { .. } => Command::Deploy,
            Cmd::Login => Command::EnterCredentials,
            Cmd::SelectProduct => Command::SelectProduct,
            Cmd::SelectGroup => Command::SelectDeviceGroup,
            Cmd::Pull => Command::PullCode,
            Cmd::Builder => Command::SetBuilderPath,
            Cmd::Migrate => Command::MigrateLegacyConfig,
            Cmd::AgentUrl => Command::GetAgentUrl,
        }
    }

    fn follows_logs(self) -> bool {
        matches!(self, Cmd::Logs | Cmd::Deploy { follow: true })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    let root = project_root(&args.project)?;
    info!("impcloud v{} in {}", env!("CARGO_PKG_VERSION"), root.display());

    let registry = Arc::new(SessionRegistry::new());
    let entry = ProjectEntry::open(&root, SessionConfig::default())
        .with_context(|| format!("Cannot open project at {}", root.display()))?;
    let entry = registry.insert(entry).await;

    let console: Arc<dyn ConsoleSink> = Arc::new(StdoutConsole);
    let gateway = Arc::new(HttpGateway::new(entry.store().clone())?);
    let services = Services {
        gateway: gateway.clone(),
        prompter: Arc::new(TerminalPrompter::new()),
        console: console.clone(),
        builder: Arc::new(NodeBuilder::new(entry.store().clone())),
    };
    let actions = ProjectActions::new(entry.clone(), services);
    let dispatcher = CommandDispatcher::default();

    let outcome = actions
        .dispatch(&dispatcher, CommandInvocation::new(args.command.command()))
        .await
        .with_context(|| format!("{} failed", args.command.command()))?;
    if outcome == ChainOutcome::Canceled {
        info!("{} canceled", args.command.command());
        return Ok(());
    }

    if !args.command.follows_logs() {
        return Ok(());
    }
    if args.command != Cmd::Logs {
        let outcome = actions
            .dispatch(&dispatcher, CommandInvocation::new(Command::ShowConsole))
            .await?;
        if outcome == ChainOutcome::Canceled {
            return Ok(());
        }
    }

    let scheduler = Scheduler::new(registry, gateway, console.clone(), SchedulerConfig::default());
    scheduler.set_quiet(args.quiet);

    follow_logs(&scheduler, &actions, &dispatcher).await?;

    let mut env = entry.env().lock().await;
    env.session.stop(console.as_ref(), false);
    Ok(())
}

/// Tick the scheduler until Ctrl+C or until the project goes away
async fn follow_logs(
    scheduler: &Scheduler,
    actions: &ProjectActions,
    dispatcher: &CommandDispatcher,
) -> Result<()> {
    loop {
        let report = scheduler.tick().await;

        for root in &report.auth_required {
            if root.as_path() != actions.entry().root() {
                continue;
            }
            let invocation = CommandInvocation::new(Command::ShowConsole).tagged(InvocationTag::Auth);
            match actions.dispatch(dispatcher, invocation).await {
                Ok(ChainOutcome::Completed) => {}
                Ok(ChainOutcome::Canceled) => return Ok(()),
                Err(e) => warn!("Re-authentication failed: {}", e),
            }
        }

        if scheduler.registry().is_empty().await {
            info!("Project settings removed, stopping");
            return Ok(());
        }

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            _ = tokio::time::sleep(scheduler.next_interval(&report)) => {}
        }
    }
}

/// Resolve the project directory, expanding a leading `~`
fn project_root(arg: &str) -> Result<PathBuf> {
    let path = match arg.strip_prefix('~') {
        Some(rest) => {
            let home = dirs::home_dir().context("Cannot determine home directory")?;
            home.join(rest.trim_start_matches(['/', '\\']))
        }
        None => PathBuf::from(arg),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("Cannot create project directory {}", path.display()))?;
    Ok(absolute(&path))
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Setup logging with tracing
fn setup_logging(level: &str) -> Result<()> {
    let log_level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
