//! Build, deploy and pull of project sources
//!
//! A deploy preprocesses both sources, installs the resulting line table,
//! uploads the code as a new deployment and then restarts the devices
//! that are not running it. Compile errors come back as row/column pairs
//! in the preprocessed code and are reported against the original files.

use async_trait::async_trait;
use std::fs;
use std::path::Path;

use crate::error::{ApiError, CompileDiagnostic};
use crate::gateway::{CloudGateway, ConsoleSink, Deployment};
use crate::linemap::{ErrorLocationMapper, LineTable, SourceKind};
use crate::settings::{ProjectSettings, SettingsStore};
use crate::types::render_notice;
use crate::{CoreError, Result};

/// Prefix of the preprocessed files written to `build/`
pub const PREPROCESSED_PREFIX: &str = "preprocessed.";

/// Preprocessed sources, `#line` directives included
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    pub agent_code: String,
    pub device_code: String,
}

impl BuildOutput {
    pub fn code(&self, kind: SourceKind) -> &str {
        match kind {
            SourceKind::Agent => &self.agent_code,
            SourceKind::Device => &self.device_code,
        }
    }
}

/// Source preprocessor
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, agent_source: &Path, device_source: &Path) -> Result<BuildOutput>;
}

/// How a deploy ended when the cloud answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed(Deployment),
    /// The deployment exists but its devices were not restarted
    RestartFailed(Deployment, ApiError),
    /// Rejected by the compiler; the report was written to the console
    CompileFailed(Vec<CompileDiagnostic>),
}

/// Collaborators of one deploy
pub struct DeployContext<'a> {
    pub builder: &'a dyn Builder,
    pub gateway: &'a dyn CloudGateway,
    pub console: &'a dyn ConsoleSink,
    pub store: &'a SettingsStore,
    pub token: &'a str,
}

/// Build and deploy the project; installs the new line table in `mapper`
///
/// # Errors
/// `MissingSetting` without a device group, `Build` when preprocessing
/// fails, and `Api` for every gateway error other than a compile failure.
pub async fn deploy_project(
    ctx: &DeployContext<'_>,
    settings: &ProjectSettings,
    mapper: &mut ErrorLocationMapper,
) -> Result<DeployOutcome> {
    let group_id = settings
        .device_group_id
        .as_deref()
        .ok_or(CoreError::MissingSetting("device_group_id"))?;

    let agent_source = ctx.store.source_path(settings, SourceKind::Agent);
    let device_source = ctx.store.source_path(settings, SourceKind::Device);
    for source in [&agent_source, &device_source] {
        if !source.is_file() {
            return Err(CoreError::Build(format!("source file {} not found", source.display())));
        }
    }

    let output = ctx.builder.build(&agent_source, &device_source).await?;
    write_preprocessed(ctx.store, &output)?;
    mapper.install(LineTable::from_preprocessed(&output.agent_code, &output.device_code));

    let result = ctx
        .gateway
        .create_deployment(ctx.token, group_id, &output.agent_code, &output.device_code)
        .await;

    let deployment = match result {
        Ok(deployment) => deployment,
        Err(ApiError::CompileFailure(diagnostics)) => {
            tracing::info!("Deployment rejected with {} compile error(s)", diagnostics.len());
            for line in compile_report(&diagnostics, mapper) {
                ctx.console.write_line(&line);
            }
            return Ok(DeployOutcome::CompileFailed(diagnostics));
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Deployment {} created for group {}", deployment.id, group_id);
    ctx.console
        .write_line(&render_notice(&format!("Deployment created: {}", deployment.id)));
    ctx.store.update(|s| s.deployment_id = Some(deployment.id.clone()))?;

    // The deployment is already in place; a failed restart must not redeploy
    if let Err(err) = ctx.gateway.conditional_restart(ctx.token, group_id).await {
        tracing::warn!("Restart of group {} failed: {}", group_id, err);
        ctx.console.write_line(&render_notice(&format!(
            "Deployment {} created, but devices were not restarted: {}",
            deployment.id, err
        )));
        return Ok(DeployOutcome::RestartFailed(deployment, err));
    }
    ctx.console.write_line(&render_notice("Devices restarted"));

    Ok(DeployOutcome::Deployed(deployment))
}

fn write_preprocessed(store: &SettingsStore, output: &BuildOutput) -> Result<()> {
    let dir = store.build_dir();
    fs::create_dir_all(&dir)?;
    for kind in [SourceKind::Agent, SourceKind::Device] {
        let name = format!("{}{}", PREPROCESSED_PREFIX, kind.default_file_name());
        fs::write(dir.join(name), output.code(kind))?;
    }
    Ok(())
}

/// Console lines describing a compile failure, grouped by source kind
pub fn compile_report(diagnostics: &[CompileDiagnostic], mapper: &ErrorLocationMapper) -> Vec<String> {
    let mut lines = vec![render_notice("Deploy failed because of compilation errors:")];

    for kind in [SourceKind::Agent, SourceKind::Device] {
        let mut errors = diagnostics.iter().filter(|d| d.source == kind).peekable();
        if errors.peek().is_none() {
            continue;
        }
        lines.push(format!("  {} code:", kind));
        for error in errors {
            let location = error
                .row
                .checked_sub(1)
                .and_then(|row| mapper.lookup(kind, row))
                .map(|loc| loc.to_string())
                .unwrap_or_else(|| format!("line {}", error.row));
            lines.push(format!(
                "    {}, column {}: {}",
                location, error.column, error.message
            ));
        }
    }
    lines
}

/// Fetch the device group's current code into the project sources
///
/// Without a deployment the source files are created empty. Either way the
/// project is marked as pulled.
pub async fn pull_code(
    gateway: &dyn CloudGateway,
    store: &SettingsStore,
    token: &str,
) -> Result<Option<Deployment>> {
    let settings = store.load()?;
    let group_id = settings
        .device_group_id
        .as_deref()
        .ok_or(CoreError::MissingSetting("device_group_id"))?;

    let latest = gateway.latest_deployment(token, group_id).await?;
    for kind in [SourceKind::Agent, SourceKind::Device] {
        let path = store.source_path(&settings, kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match &latest {
            Some(deployment) => {
                let code = match kind {
                    SourceKind::Agent => &deployment.agent_code,
                    SourceKind::Device => &deployment.device_code,
                };
                fs::write(&path, code)?;
            }
            None if !path.exists() => fs::write(&path, "")?,
            None => {}
        }
    }

    store.update(|s| {
        s.code_pulled = true;
        if let Some(deployment) = &latest {
            s.deployment_id = Some(deployment.id.clone());
        }
    })?;
    match &latest {
        Some(deployment) => tracing::info!("Pulled deployment {}", deployment.id),
        None => tracing::info!("Device group has no deployment, created empty sources"),
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryConsole;
    use crate::linemap::SourceLocation;
    use crate::settings::tests::temp_project;
    use crate::testing::FakeGateway;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Prepends a `#line` directive like the real preprocessor
    #[derive(Default)]
    struct EchoBuilder {
        built: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    #[async_trait]
    impl Builder for EchoBuilder {
        async fn build(&self, agent: &Path, device: &Path) -> Result<BuildOutput> {
            self.built
                .lock()
                .unwrap()
                .push((agent.to_path_buf(), device.to_path_buf()));
            let wrap = |path: &Path| -> Result<String> {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                Ok(format!("#line 1 \"{}\"\n{}", name, fs::read_to_string(path)?))
            };
            Ok(BuildOutput {
                agent_code: wrap(agent)?,
                device_code: wrap(device)?,
            })
        }
    }

    fn project_with_sources() -> SettingsStore {
        let store = SettingsStore::new(temp_project("deploy"));
        let settings = store
            .update(|s| s.device_group_id = Some("g1".into()))
            .unwrap();
        fs::create_dir_all(store.root().join("src")).unwrap();
        fs::write(store.source_path(&settings, SourceKind::Agent), "server.log(1);\n").unwrap();
        fs::write(store.source_path(&settings, SourceKind::Device), "a\nb\nc\n").unwrap();
        store
    }

    #[tokio::test]
    async fn test_deploy_creates_deployment_and_restarts() {
        let store = project_with_sources();
        let gateway = FakeGateway::default();
        let console = MemoryConsole::new();
        let builder = EchoBuilder::default();
        let mut mapper = ErrorLocationMapper::new();
        let ctx = DeployContext {
            builder: &builder,
            gateway: &gateway,
            console: &console,
            store: &store,
            token: "t",
        };

        let outcome = deploy_project(&ctx, &store.load().unwrap(), &mut mapper)
            .await
            .unwrap();

        assert!(matches!(outcome, DeployOutcome::Deployed(ref d) if d.id == "dep-1"));
        assert_eq!(gateway.get(|s| s.restarts), 1);
        let (group, agent, _) = gateway.get(|s| s.deployments[0].clone());
        assert_eq!(group, "g1");
        assert!(agent.starts_with("#line 1 \"agent.nut\""));
        assert_eq!(store.load().unwrap().deployment_id.as_deref(), Some("dep-1"));
        assert_eq!(
            mapper.lookup(SourceKind::Device, 2),
            Some(SourceLocation::new("device.nut", 2))
        );
        assert!(store.build_dir().join("preprocessed.device.nut").is_file());
        assert_eq!(console.count_containing("Deployment created: dep-1"), 1);
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_single_deployment() {
        let store = project_with_sources();
        let gateway = FakeGateway::default();
        gateway.set(|s| s.restart_error = Some(ApiError::InvalidCredentials));
        let console = MemoryConsole::new();
        let builder = EchoBuilder::default();
        let mut mapper = ErrorLocationMapper::new();
        let ctx = DeployContext {
            builder: &builder,
            gateway: &gateway,
            console: &console,
            store: &store,
            token: "t",
        };

        let outcome = deploy_project(&ctx, &store.load().unwrap(), &mut mapper)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            DeployOutcome::RestartFailed(ref d, ApiError::InvalidCredentials) if d.id == "dep-1"
        ));
        assert_eq!(gateway.get(|s| s.deployments.len()), 1);
        assert_eq!(gateway.get(|s| s.restarts), 0);
        assert_eq!(store.load().unwrap().deployment_id.as_deref(), Some("dep-1"));
        assert_eq!(console.count_containing("devices were not restarted"), 1);
        assert_eq!(console.count_containing("Devices restarted"), 0);
    }

    #[tokio::test]
    async fn test_compile_failure_is_reported_with_original_lines() {
        let store = project_with_sources();
        let gateway = FakeGateway::default();
        gateway.set(|s| {
            s.deployment_results.push_back(Err(ApiError::CompileFailure(vec![CompileDiagnostic {
                source: SourceKind::Device,
                row: 3,
                column: 24,
                message: "expression expected".into(),
            }])))
        });
        let console = MemoryConsole::new();
        let builder = EchoBuilder::default();
        let mut mapper = ErrorLocationMapper::new();
        let ctx = DeployContext {
            builder: &builder,
            gateway: &gateway,
            console: &console,
            store: &store,
            token: "t",
        };

        let outcome = deploy_project(&ctx, &store.load().unwrap(), &mut mapper)
            .await
            .unwrap();

        assert!(matches!(outcome, DeployOutcome::CompileFailed(ref d) if d.len() == 1));
        assert_eq!(gateway.get(|s| s.restarts), 0);
        // Row 3 of the preprocessed device code is line 2 of device.nut
        assert_eq!(
            console.count_containing("device.nut:2, column 24: expression expected"),
            1
        );
        assert_eq!(console.count_containing("Agent code:"), 0);
    }

    #[tokio::test]
    async fn test_deploy_without_group_is_rejected() {
        let store = SettingsStore::new(temp_project("nogroup"));
        let gateway = FakeGateway::default();
        let console = MemoryConsole::new();
        let builder = EchoBuilder::default();
        let ctx = DeployContext {
            builder: &builder,
            gateway: &gateway,
            console: &console,
            store: &store,
            token: "t",
        };

        let result = deploy_project(&ctx, &ProjectSettings::default(), &mut ErrorLocationMapper::new()).await;
        assert!(matches!(result, Err(CoreError::MissingSetting("device_group_id"))));
        assert!(builder.built.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auth_error_propagates() {
        let store = project_with_sources();
        let gateway = FakeGateway::default();
        gateway.set(|s| s.valid_tokens = vec!["good".into()]);
        let console = MemoryConsole::new();
        let builder = EchoBuilder::default();
        let ctx = DeployContext {
            builder: &builder,
            gateway: &gateway,
            console: &console,
            store: &store,
            token: "stale",
        };

        let result = deploy_project(&ctx, &store.load().unwrap(), &mut ErrorLocationMapper::new()).await;
        assert!(matches!(result, Err(CoreError::Api(ApiError::InvalidCredentials))));
    }

    #[test]
    fn test_unmapped_compile_error_keeps_row() {
        let lines = compile_report(
            &[CompileDiagnostic {
                source: SourceKind::Agent,
                row: 7,
                column: 1,
                message: "boom".into(),
            }],
            &ErrorLocationMapper::new(),
        );
        assert_eq!(lines[1], "  Agent code:");
        assert_eq!(lines[2], "    line 7, column 1: boom");
    }

    #[tokio::test]
    async fn test_pull_writes_sources() {
        let store = SettingsStore::new(temp_project("pull"));
        store.update(|s| s.device_group_id = Some("g1".into())).unwrap();
        let gateway = FakeGateway::default();
        gateway.set(|s| {
            s.latest = Some(Deployment {
                id: "dep-9".into(),
                agent_code: "agent();".into(),
                device_code: "device();".into(),
            })
        });

        let pulled = pull_code(&gateway, &store, "t").await.unwrap();

        assert_eq!(pulled.map(|d| d.id), Some("dep-9".to_string()));
        let settings = store.load().unwrap();
        assert!(settings.code_pulled);
        assert_eq!(
            fs::read_to_string(store.source_path(&settings, SourceKind::Device)).unwrap(),
            "device();"
        );
    }

    #[tokio::test]
    async fn test_pull_without_deployment_creates_empty_sources() {
        let store = SettingsStore::new(temp_project("pull-empty"));
        store.update(|s| s.device_group_id = Some("g1".into())).unwrap();

        pull_code(&FakeGateway::default(), &store, "t").await.unwrap();

        let settings = store.load().unwrap();
        assert!(settings.code_pulled);
        assert!(store.source_path(&settings, SourceKind::Agent).is_file());
    }
}
