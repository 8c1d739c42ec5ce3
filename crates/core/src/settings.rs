//! Project settings storage
//!
//! # SettingsStore
//!
//! Every project keeps its settings next to its sources:
//!
//! ```text
//! <project>/
//!   settings/impcloud.json   project settings
//!   settings/auth.json       access token (permissions 0600 on Unix)
//!   src/agent.nut            sources named by the settings
//!   build/                   preprocessed output
//! ```
//!
//! Projects created by the older build-API tooling carry
//! `settings/electric-imp.settings` and `settings/build-api.key` instead.
//! [`SettingsStore::migrate_legacy`] converts them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::auth::AccessToken;
use crate::linemap::SourceKind;
use crate::Result;

/// Cloud API endpoint used when the project does not name one
pub const DEFAULT_CLOUD_URL: &str = "https://api.electricimp.com/v5/";

pub const SETTINGS_DIR: &str = "settings";
pub const SETTINGS_FILE: &str = "impcloud.json";
pub const AUTH_FILE: &str = "auth.json";
pub const LEGACY_SETTINGS_FILE: &str = "electric-imp.settings";
pub const LEGACY_KEY_FILE: &str = "build-api.key";
pub const SOURCE_DIR: &str = "src";
pub const BUILD_DIR: &str = "build";

/// Suffix given to legacy files once migrated
const MIGRATED_SUFFIX: &str = ".migrated";

/// Location of the preprocessor toolchain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    /// Node.js executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_path: Option<PathBuf>,
    /// Builder entry script (`cli.js`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<PathBuf>,
}

impl BuilderSettings {
    pub fn is_set(&self) -> bool {
        self.node_path.is_some() && self.cli_path.is_some()
    }
}

/// Contents of `settings/impcloud.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_group_id: Option<String>,
    /// Last deployment created from this project
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    /// Agent source, relative to `src/`
    pub agent_file: String,
    /// Device source, relative to `src/`
    pub device_file: String,
    pub builder: BuilderSettings,
    /// The group's current sources were fetched (or there were none to fetch)
    pub code_pulled: bool,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            cloud_url: None,
            product_id: None,
            device_group_id: None,
            deployment_id: None,
            agent_file: SourceKind::Agent.default_file_name().to_string(),
            device_file: SourceKind::Device.default_file_name().to_string(),
            builder: BuilderSettings::default(),
            code_pulled: false,
        }
    }
}

impl ProjectSettings {
    /// Configured endpoint or [`DEFAULT_CLOUD_URL`]
    pub fn cloud_url(&self) -> &str {
        self.cloud_url.as_deref().unwrap_or(DEFAULT_CLOUD_URL)
    }

    pub fn source_file(&self, kind: SourceKind) -> &str {
        match kind {
            SourceKind::Agent => &self.agent_file,
            SourceKind::Device => &self.device_file,
        }
    }
}

/// `electric-imp.settings` as written by the build-API tooling
#[derive(Debug, Default, Deserialize)]
struct LegacySettings {
    #[serde(rename = "model-id")]
    model_id: Option<String>,
    #[serde(rename = "agent-file")]
    agent_file: Option<String>,
    #[serde(rename = "device-file")]
    device_file: Option<String>,
    #[serde(rename = "device-id")]
    device_id: Option<String>,
}

/// Reads and writes the settings of one project
#[derive(Debug, Clone)]
pub struct SettingsStore {
    root: PathBuf,
}

impl SettingsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.root.join(SETTINGS_DIR)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_dir().join(SETTINGS_FILE)
    }

    fn auth_path(&self) -> PathBuf {
        self.settings_dir().join(AUTH_FILE)
    }

    fn legacy_path(&self, name: &str) -> PathBuf {
        self.settings_dir().join(name)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join(BUILD_DIR)
    }

    /// Absolute path of one of the project sources
    pub fn source_path(&self, settings: &ProjectSettings, kind: SourceKind) -> PathBuf {
        self.root.join(SOURCE_DIR).join(settings.source_file(kind))
    }

    /// True when the project settings file is on disk
    pub fn exists(&self) -> bool {
        self.settings_path().is_file()
    }

    /// Load project settings; a missing file yields the defaults
    pub fn load(&self) -> Result<ProjectSettings> {
        let path = self.settings_path();
        if !path.exists() {
            return Ok(ProjectSettings::default());
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, settings: &ProjectSettings) -> Result<()> {
        fs::create_dir_all(self.settings_dir())?;
        let text = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(), text)?;
        tracing::debug!("Saved project settings to {}", self.settings_path().display());
        Ok(())
    }

    /// Load, change and save in one step
    pub fn update<F>(&self, change: F) -> Result<ProjectSettings>
    where
        F: FnOnce(&mut ProjectSettings),
    {
        let mut settings = self.load()?;
        change(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }

    /// Stored access token, if any
    pub fn load_token(&self) -> Result<Option<AccessToken>> {
        let path = self.auth_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Persist the access token, readable by the owner only
    pub fn save_token(&self, token: &AccessToken) -> Result<()> {
        fs::create_dir_all(self.settings_dir())?;
        let path = self.auth_path();
        fs::write(&path, serde_json::to_string_pretty(token)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perm = fs::metadata(&path)?.permissions();
            perm.set_mode(0o600); // rw-------
            fs::set_permissions(&path, perm)?;
        }

        Ok(())
    }

    pub fn clear_token(&self) -> Result<()> {
        match fs::remove_file(self.auth_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// True while a pre-migration settings file is present
    pub fn has_legacy_config(&self) -> bool {
        self.legacy_path(LEGACY_SETTINGS_FILE).is_file() || self.legacy_path(LEGACY_KEY_FILE).is_file()
    }

    /// Convert legacy settings into `impcloud.json`
    ///
    /// Source file names carry over. Model and device ids have no
    /// counterpart in the current API, and the build-API key cannot be
    /// exchanged for a token, so product, group and credentials are chosen
    /// again by the prerequisite chain. Legacy files are renamed with a
    /// `.migrated` suffix rather than deleted.
    pub fn migrate_legacy(&self) -> Result<ProjectSettings> {
        let legacy_file = self.legacy_path(LEGACY_SETTINGS_FILE);
        let legacy: LegacySettings = if legacy_file.is_file() {
            serde_json::from_str(&fs::read_to_string(&legacy_file)?)?
        } else {
            LegacySettings::default()
        };

        if let Some(model) = &legacy.model_id {
            tracing::info!("Legacy model {} must be re-selected as a device group", model);
        }
        if let Some(device) = &legacy.device_id {
            tracing::debug!("Dropping legacy device id {}", device);
        }

        let settings = self.update(|settings| {
            if let Some(agent) = legacy.agent_file {
                settings.agent_file = agent;
            }
            if let Some(device) = legacy.device_file {
                settings.device_file = device;
            }
        })?;

        for name in [LEGACY_SETTINGS_FILE, LEGACY_KEY_FILE] {
            let path = self.legacy_path(name);
            if path.is_file() {
                let target = self.legacy_path(&format!("{name}{MIGRATED_SUFFIX}"));
                fs::rename(&path, &target)?;
            }
        }

        tracing::info!("Migrated legacy settings in {}", self.root.display());
        Ok(settings)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fresh, empty project directory under the system temp dir
    pub(crate) fn temp_project(tag: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "impcloud-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let store = SettingsStore::new(temp_project("defaults"));
        assert!(!store.exists());
        let settings = store.load().unwrap();
        assert_eq!(settings, ProjectSettings::default());
        assert_eq!(settings.cloud_url(), DEFAULT_CLOUD_URL);
        assert_eq!(settings.agent_file, "agent.nut");
    }

    #[test]
    fn test_save_and_load() {
        let store = SettingsStore::new(temp_project("save"));
        let saved = store
            .update(|s| {
                s.product_id = Some("p1".into());
                s.builder.node_path = Some("/usr/bin/node".into());
            })
            .unwrap();

        assert!(store.exists());
        assert_eq!(store.load().unwrap(), saved);
        assert!(!saved.builder.is_set());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let store = SettingsStore::new(temp_project("partial"));
        fs::create_dir_all(store.settings_dir()).unwrap();
        fs::write(store.settings_path(), r#"{"device_group_id":"g1"}"#).unwrap();

        let settings = store.load().unwrap();
        assert_eq!(settings.device_group_id.as_deref(), Some("g1"));
        assert_eq!(settings.device_file, "device.nut");
        assert!(!settings.code_pulled);
    }

    #[test]
    fn test_token_storage() {
        let store = SettingsStore::new(temp_project("token"));
        assert!(store.load_token().unwrap().is_none());

        let token = AccessToken::new("abc", Utc::now() + Duration::hours(1)).with_refresh_token("r");
        store.save_token(&token).unwrap();
        assert_eq!(store.load_token().unwrap(), Some(token));

        let raw = fs::read_to_string(store.settings_dir().join(AUTH_FILE)).unwrap();
        assert!(raw.contains("\"access_token\""));

        store.clear_token().unwrap();
        store.clear_token().unwrap();
        assert!(store.load_token().unwrap().is_none());
    }

    #[test]
    fn test_legacy_migration() {
        let store = SettingsStore::new(temp_project("legacy"));
        fs::create_dir_all(store.settings_dir()).unwrap();
        fs::write(
            store.settings_dir().join(LEGACY_SETTINGS_FILE),
            r#"{"model-id":"m1","agent-file":"main.agent.nut","device-file":"main.device.nut","device-id":"d1"}"#,
        )
        .unwrap();
        fs::write(store.settings_dir().join(LEGACY_KEY_FILE), r#"{"build-api-key":"k"}"#).unwrap();
        assert!(store.has_legacy_config());

        let settings = store.migrate_legacy().unwrap();

        assert!(!store.has_legacy_config());
        assert_eq!(settings.agent_file, "main.agent.nut");
        assert_eq!(settings.device_file, "main.device.nut");
        assert!(settings.device_group_id.is_none());
        assert!(store.exists());
        assert!(store
            .settings_dir()
            .join(format!("{LEGACY_KEY_FILE}{MIGRATED_SUFFIX}"))
            .is_file());
    }

    #[test]
    fn test_source_paths() {
        let store = SettingsStore::new("/work/proj");
        let settings = ProjectSettings::default();
        assert_eq!(
            store.source_path(&settings, SourceKind::Device),
            PathBuf::from("/work/proj/src/device.nut")
        );
    }
}
