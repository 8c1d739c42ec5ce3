//! Remediation steps and user actions of one project
//!
//! [`ProjectActions`] answers the prerequisite checks from the project's
//! settings and credentials and runs every [`Command`]. It is both the
//! [`PrerequisiteState`] and the [`ActionHandler`] handed to the dispatcher.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::AccessToken;
use crate::chain::{
    ActionHandler, ActionOutcome, ChainOutcome, Check, CommandDispatcher, PrerequisiteState,
};
use crate::deploy::{deploy_project, pull_code, Builder, DeployContext, DeployOutcome};
use crate::error::ApiError;
use crate::gateway::{agent_url, CloudGateway, ConsoleSink};
use crate::prompt::Prompter;
use crate::scheduler::ProjectEntry;
use crate::session::SessionState;
use crate::settings::{ProjectSettings, DEFAULT_CLOUD_URL};
use crate::types::{render_notice, Command, CommandInvocation, InvocationTag};
use crate::{CoreError, Result};

/// Everything a command needs besides the project itself
#[derive(Clone)]
pub struct Services {
    pub gateway: Arc<dyn CloudGateway>,
    pub prompter: Arc<dyn Prompter>,
    pub console: Arc<dyn ConsoleSink>,
    pub builder: Arc<dyn Builder>,
}

/// Command handlers bound to one registered project
pub struct ProjectActions {
    entry: Arc<ProjectEntry>,
    services: Services,
}

impl ProjectActions {
    pub fn new(entry: Arc<ProjectEntry>, services: Services) -> Self {
        Self { entry, services }
    }

    pub fn entry(&self) -> &Arc<ProjectEntry> {
        &self.entry
    }

    /// Run `invocation` through the chain while holding the project's busy flag
    ///
    /// # Errors
    /// `InvalidState` when another chain is already running on the project.
    pub async fn dispatch(
        &self,
        dispatcher: &CommandDispatcher,
        invocation: CommandInvocation,
    ) -> Result<ChainOutcome> {
        let _busy = self.entry.try_busy().ok_or_else(|| {
            CoreError::InvalidState(format!(
                "a command is already running for {}",
                self.entry.root().display()
            ))
        })?;
        dispatcher.execute(invocation, self, self).await
    }

    fn notice(&self, text: &str) {
        self.services.console.write_line(&render_notice(text));
    }

    fn settings(&self) -> ProjectSettings {
        self.entry.store().load().unwrap_or_else(|e| {
            tracing::warn!("Cannot read project settings: {}", e);
            ProjectSettings::default()
        })
    }

    /// Save a settings change and hand the result to the live session
    async fn update_settings<F>(&self, change: F) -> Result<ProjectSettings>
    where
        F: FnOnce(&mut ProjectSettings),
    {
        let settings = self.entry.store().update(change)?;
        let mut env = self.entry.env().lock().await;
        env.apply_settings(settings.clone(), self.services.console.as_ref());
        Ok(settings)
    }

    async fn install_token(&self, token: AccessToken) -> Result<()> {
        self.entry.store().save_token(&token)?;
        self.entry.credentials().replace(token).await;
        Ok(())
    }

    async fn forget_token(&self) -> Result<()> {
        self.entry.store().clear_token()?;
        self.entry.credentials().clear().await;
        Ok(())
    }

    /// Map a gateway failure to the outcome of the step that saw it
    async fn on_api_error(&self, command: Command, err: ApiError) -> Result<ActionOutcome> {
        match err {
            ApiError::InvalidCredentials => {
                tracing::info!("{} was refused, renewing credentials", command);
                self.entry.credentials().invalidate().await;
                Ok(ActionOutcome::Retry)
            }
            ApiError::WrongInput(message) => {
                self.notice(&format!("{} failed: {}", command, message));
                Ok(self.retry_or_cancel().await)
            }
            other => Err(other.into()),
        }
    }

    async fn retry_or_cancel(&self) -> ActionOutcome {
        if self.services.prompter.confirm("Try again?").await {
            ActionOutcome::Retry
        } else {
            ActionOutcome::Canceled
        }
    }

    async fn migrate_legacy(&self) -> Result<ActionOutcome> {
        let question = "This project uses the old settings format. Convert it now?";
        if !self.services.prompter.confirm(question).await {
            return Ok(ActionOutcome::Canceled);
        }
        let settings = self.entry.store().migrate_legacy()?;
        let mut env = self.entry.env().lock().await;
        env.apply_settings(settings, self.services.console.as_ref());
        drop(env);
        self.notice("Project settings converted; select a product and device group");
        Ok(ActionOutcome::Completed)
    }

    async fn set_builder_path(&self) -> Result<ActionOutcome> {
        let current = self.settings().builder;
        let prompter = &self.services.prompter;

        let node_default = current.node_path.as_ref().map(|p| p.display().to_string());
        let Some(node) = prompter
            .input("Path to the Node.js executable", node_default.as_deref())
            .await
            .filter(|s| !s.trim().is_empty())
        else {
            return Ok(ActionOutcome::Canceled);
        };

        let cli_default = current.cli_path.as_ref().map(|p| p.display().to_string());
        let Some(cli) = prompter
            .input("Path to the Builder cli.js", cli_default.as_deref())
            .await
            .filter(|s| !s.trim().is_empty())
        else {
            return Ok(ActionOutcome::Canceled);
        };

        let node = PathBuf::from(node.trim());
        let cli = PathBuf::from(cli.trim());
        // A bare `node` is resolved through PATH when the builder runs
        let node_ok = node.components().count() == 1 || node.is_file();
        if !node_ok || !cli.is_file() {
            let missing = if node_ok { &cli } else { &node };
            self.notice(&format!("File not found: {}", missing.display()));
            return Ok(ActionOutcome::Retry);
        }

        self.update_settings(|s| {
            s.builder.node_path = Some(node);
            s.builder.cli_path = Some(cli);
        })
        .await?;
        Ok(ActionOutcome::Completed)
    }

    async fn set_cloud_endpoint(&self) -> Result<ActionOutcome> {
        let current = self.settings();
        let Some(url) = self
            .services
            .prompter
            .input("Cloud API endpoint", Some(current.cloud_url()))
            .await
        else {
            return Ok(ActionOutcome::Canceled);
        };

        let mut url = url.trim().to_string();
        if url.is_empty() {
            url = DEFAULT_CLOUD_URL.to_string();
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            self.notice(&format!("Not an http(s) URL: {}", url));
            return Ok(ActionOutcome::Retry);
        }
        if !url.ends_with('/') {
            url.push('/');
        }

        self.update_settings(|s| s.cloud_url = Some(url)).await?;
        Ok(ActionOutcome::Completed)
    }

    async fn enter_credentials(&self) -> Result<ActionOutcome> {
        let prompter = &self.services.prompter;
        let Some(id) = prompter.input("Account email or username", None).await else {
            return Ok(ActionOutcome::Canceled);
        };
        let Some(password) = prompter.secret("Password").await else {
            return Ok(ActionOutcome::Canceled);
        };

        match self.services.gateway.login(id.trim(), &password).await {
            Ok(token) => {
                self.install_token(token).await?;
                tracing::info!("Logged in");
                Ok(ActionOutcome::Completed)
            }
            Err(ApiError::InvalidCredentials) => {
                self.notice("Login failed: invalid email/username or password");
                Ok(self.retry_or_cancel().await)
            }
            Err(err) => self.on_api_error(Command::EnterCredentials, err).await,
        }
    }

    // A refresh that cannot succeed drops the token so that the chain asks
    // for credentials next.
    async fn refresh_credentials(&self) -> Result<ActionOutcome> {
        let refresh = self
            .entry
            .credentials()
            .current()
            .await
            .and_then(|t| t.refresh_token);
        let Some(refresh) = refresh else {
            tracing::debug!("No refresh token, login required");
            self.forget_token().await?;
            return Ok(ActionOutcome::Completed);
        };

        match self.services.gateway.refresh_access_token(&refresh).await {
            Ok(mut token) => {
                if token.refresh_token.is_none() {
                    token.refresh_token = Some(refresh);
                }
                self.install_token(token).await?;
                tracing::info!("Access token refreshed");
                Ok(ActionOutcome::Completed)
            }
            Err(err) if err.is_auth() => {
                tracing::info!("Refresh token rejected, login required");
                self.forget_token().await?;
                Ok(ActionOutcome::Completed)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn select_product(&self, token: &str) -> Result<ActionOutcome> {
        let products = match self.services.gateway.list_products(token).await {
            Ok(products) => products,
            Err(err) => return self.on_api_error(Command::SelectProduct, err).await,
        };
        if products.is_empty() {
            self.notice("The account has no products. Create one in the cloud IDE first");
            return Ok(ActionOutcome::Canceled);
        }

        let names: Vec<String> = products.iter().map(|p| p.name.clone()).collect();
        let Some(index) = self.services.prompter.pick("Select a product", &names).await else {
            return Ok(ActionOutcome::Canceled);
        };
        let Some(product) = products.get(index) else {
            return Ok(ActionOutcome::Retry);
        };

        let id = product.id.clone();
        self.update_settings(|s| {
            if s.product_id.as_deref() != Some(id.as_str()) {
                s.device_group_id = None;
                s.code_pulled = false;
            }
            s.product_id = Some(id);
        })
        .await?;
        tracing::info!("Selected product {}", product.name);
        Ok(ActionOutcome::Completed)
    }

    async fn select_device_group(&self, token: &str) -> Result<ActionOutcome> {
        let Some(product_id) = self.settings().product_id else {
            return Ok(ActionOutcome::Retry);
        };
        let groups = match self.services.gateway.list_device_groups(token, &product_id).await {
            Ok(groups) => groups,
            Err(err) => return self.on_api_error(Command::SelectDeviceGroup, err).await,
        };
        if groups.is_empty() {
            self.notice("The product has no device groups. Create one in the cloud IDE first");
            return Ok(ActionOutcome::Canceled);
        }

        let names: Vec<String> = groups.iter().map(|g| g.name.clone()).collect();
        let Some(index) = self.services.prompter.pick("Select a device group", &names).await else {
            return Ok(ActionOutcome::Canceled);
        };
        let Some(group) = groups.get(index) else {
            return Ok(ActionOutcome::Retry);
        };

        let id = group.id.clone();
        self.update_settings(|s| {
            if s.device_group_id.as_deref() != Some(id.as_str()) {
                s.code_pulled = false;
            }
            s.device_group_id = Some(id);
        })
        .await?;
        tracing::info!("Selected device group {}", group.name);
        Ok(ActionOutcome::Completed)
    }

    async fn pull(&self, token: &str) -> Result<ActionOutcome> {
        let settings = self.settings();
        let store = self.entry.store();
        let has_local_code = [crate::SourceKind::Agent, crate::SourceKind::Device]
            .iter()
            .any(|kind| {
                std::fs::metadata(store.source_path(&settings, *kind))
                    .map(|m| m.len() > 0)
                    .unwrap_or(false)
            });

        if has_local_code {
            let question = "Replace the local sources with the device group's current code?";
            if !self.services.prompter.confirm(question).await {
                tracing::info!("Keeping local sources");
                self.update_settings(|s| s.code_pulled = true).await?;
                return Ok(ActionOutcome::Completed);
            }
        }

        match pull_code(self.services.gateway.as_ref(), store, token).await {
            Ok(Some(deployment)) => {
                self.notice(&format!("Pulled code of deployment {}", deployment.id));
            }
            Ok(None) => self.notice("The device group has no code yet"),
            Err(CoreError::Api(err)) => return self.on_api_error(Command::PullCode, err).await,
            Err(err) => return Err(err),
        }
        self.update_settings(|_| {}).await?;
        Ok(ActionOutcome::Completed)
    }

    async fn show_console(&self) -> Result<ActionOutcome> {
        let mut env = self.entry.env().lock().await;
        let console = self.services.console.as_ref();
        match env.session.state() {
            SessionState::Idle => {
                env.session.start(console);
            }
            SessionState::Fail => {
                env.session.reset(console, true);
                env.session.start(console);
            }
            SessionState::Init | SessionState::Poll => {
                tracing::debug!("Log stream already running");
            }
        }
        Ok(ActionOutcome::Completed)
    }

    async fn show_agent_url(&self, token: &str) -> Result<ActionOutcome> {
        let Some(group_id) = self.settings().device_group_id else {
            return Ok(ActionOutcome::Retry);
        };
        let devices = match self.services.gateway.list_devices(token, None, Some(&group_id)).await {
            Ok(devices) => devices,
            Err(err) => return self.on_api_error(Command::GetAgentUrl, err).await,
        };

        let device = match devices.len() {
            0 => {
                self.notice("No devices in the device group. Assign a device first");
                return Ok(ActionOutcome::Canceled);
            }
            1 => &devices[0],
            _ => {
                let names: Vec<String> = devices
                    .iter()
                    .map(|d| d.name.clone().unwrap_or_else(|| d.id.clone()))
                    .collect();
                let Some(index) = self.services.prompter.pick("Select a device", &names).await else {
                    return Ok(ActionOutcome::Canceled);
                };
                let Some(device) = devices.get(index) else {
                    return Ok(ActionOutcome::Retry);
                };
                device
            }
        };

        match self.services.gateway.device_agent_id(token, &device.id).await {
            Ok(Some(agent_id)) => {
                self.notice(&format!("Agent URL of device {}: {}", device.id, agent_url(&agent_id)));
            }
            Ok(None) => self.notice(&format!("Device {} has no agent yet", device.id)),
            Err(err) => return self.on_api_error(Command::GetAgentUrl, err).await,
        }
        Ok(ActionOutcome::Completed)
    }

    async fn deploy(&self, token: &str) -> Result<ActionOutcome> {
        let settings = self.settings();
        let store = self.entry.store();
        let ctx = DeployContext {
            builder: self.services.builder.as_ref(),
            gateway: self.services.gateway.as_ref(),
            console: self.services.console.as_ref(),
            store,
            token,
        };

        let mut env = self.entry.env().lock().await;
        let result = deploy_project(&ctx, &settings, &mut env.mapper).await;
        drop(env);

        match result {
            Ok(DeployOutcome::Deployed(_)) | Ok(DeployOutcome::CompileFailed(_)) => {
                self.update_settings(|_| {}).await?;
                Ok(ActionOutcome::Completed)
            }
            Ok(DeployOutcome::RestartFailed(_, err)) => {
                if err.is_auth() {
                    // Renewed before the next command instead of redeploying now
                    self.entry.credentials().invalidate().await;
                }
                self.update_settings(|_| {}).await?;
                Ok(ActionOutcome::Completed)
            }
            Err(CoreError::Api(err)) => self.on_api_error(Command::Deploy, err).await,
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl PrerequisiteState for ProjectActions {
    async fn holds(&self, check: Check) -> bool {
        let credentials = self.entry.credentials();
        match check {
            Check::NoLegacyConfig => !self.entry.store().has_legacy_config(),
            Check::BuilderPathSet => self.settings().builder.is_set(),
            Check::CloudEndpoint => self.settings().cloud_url.is_some(),
            Check::CredentialsPresent => credentials.current().await.is_some(),
            Check::CredentialsFresh => credentials
                .current()
                .await
                .map(|t| t.is_fresh())
                .unwrap_or(false),
            Check::ProductSelected => self.settings().product_id.is_some(),
            Check::DeviceGroupSelected => self.settings().device_group_id.is_some(),
            Check::CodePulled => self.settings().code_pulled,
        }
    }
}

#[async_trait]
impl ActionHandler for ProjectActions {
    async fn begin(&self, invocation: &CommandInvocation) -> Result<()> {
        if invocation.tag == Some(InvocationTag::Auth) {
            tracing::info!("Log stream credentials rejected, renewing");
            self.entry.credentials().invalidate().await;
        }
        Ok(())
    }

    async fn run(&self, invocation: &CommandInvocation) -> Result<ActionOutcome> {
        let command = invocation.command;
        match command {
            Command::MigrateLegacyConfig => return self.migrate_legacy().await,
            Command::SetBuilderPath => return self.set_builder_path().await,
            Command::SetCloudEndpoint => return self.set_cloud_endpoint().await,
            Command::EnterCredentials => return self.enter_credentials().await,
            Command::RefreshCredentials => return self.refresh_credentials().await,
            Command::ShowConsole => return self.show_console().await,
            _ => {}
        }

        // Every remaining command talks to the cloud
        let Some(token) = self.entry.credentials().bearer().await else {
            return Ok(ActionOutcome::Retry);
        };
        match command {
            Command::SelectProduct => self.select_product(&token).await,
            Command::SelectDeviceGroup => self.select_device_group(&token).await,
            Command::PullCode => self.pull(&token).await,
            Command::Deploy => self.deploy(&token).await,
            Command::GetAgentUrl => self.show_agent_url(&token).await,
            _ => Err(CoreError::InvalidState(format!("no handler for {}", command))),
        }
    }
}
