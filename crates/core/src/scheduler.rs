//! Project registry and the periodic log scheduler
//!
//! Every open project owns one [`ProjectEntry`]. The scheduler visits all
//! entries on each tick and advances their log sessions. An entry that is
//! busy (a command chain is running on it) or whose environment is locked is
//! skipped for that tick, so no session is ever driven from two places.

use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::auth::CredentialCache;
use crate::gateway::{CloudGateway, ConsoleSink};
use crate::linemap::ErrorLocationMapper;
use crate::session::{LogSession, QueryOutcome, SessionConfig, SessionContext, SessionState, StreamTarget};
use crate::settings::{ProjectSettings, SettingsStore};
use crate::Result;

/// Tick intervals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Used right after a tick that showed logs
    pub fast_interval: Duration,
    /// Used when nothing happened
    pub slow_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_millis(300),
            slow_interval: Duration::from_secs(2),
        }
    }
}

/// Mutable state of one project, guarded by the entry mutex
pub struct ProjectEnv {
    pub settings: ProjectSettings,
    pub session: LogSession,
    pub mapper: ErrorLocationMapper,
}

impl ProjectEnv {
    /// Install new settings; a different device group restarts the stream
    pub fn apply_settings(&mut self, settings: ProjectSettings, console: &dyn ConsoleSink) {
        let target = StreamTarget {
            device_group_id: settings.device_group_id.clone(),
            owner_id: None,
        };
        let changed = *self.session.target() != target;
        self.session.set_target(target);
        if changed && matches!(self.session.state(), SessionState::Init | SessionState::Poll) {
            self.session.reset(console, true);
        }
        self.settings = settings;
    }
}

/// Clears the busy flag when dropped
pub struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    /// `None` when the flag is already set
    pub fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// One registered project
pub struct ProjectEntry {
    store: SettingsStore,
    credentials: CredentialCache,
    busy: AtomicBool,
    env: Mutex<ProjectEnv>,
}

impl ProjectEntry {
    /// Load settings and the stored token of the project at `root`
    pub fn open(root: impl Into<PathBuf>, config: SessionConfig) -> Result<Self> {
        let store = SettingsStore::new(root);
        let settings = store.load()?;
        let credentials = match store.load_token()? {
            Some(token) => CredentialCache::with_token(token),
            None => CredentialCache::new(),
        };
        let target = StreamTarget {
            device_group_id: settings.device_group_id.clone(),
            owner_id: None,
        };
        Ok(Self {
            store,
            credentials,
            busy: AtomicBool::new(false),
            env: Mutex::new(ProjectEnv {
                settings,
                session: LogSession::new(target, config),
                mapper: ErrorLocationMapper::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    pub fn env(&self) -> &Mutex<ProjectEnv> {
        &self.env
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn try_busy(&self) -> Option<BusyGuard<'_>> {
        BusyGuard::try_acquire(&self.busy)
    }
}

/// Open projects keyed by root directory
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<PathBuf, Arc<ProjectEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a project, replacing any entry with the same root
    pub async fn insert(&self, entry: ProjectEntry) -> Arc<ProjectEntry> {
        let entry = Arc::new(entry);
        let mut entries = self.entries.lock().await;
        entries.insert(entry.root().to_path_buf(), entry.clone());
        tracing::info!("Registered project {}", entry.root().display());
        entry
    }

    pub async fn get(&self, root: &Path) -> Option<Arc<ProjectEntry>> {
        self.entries.lock().await.get(root).cloned()
    }

    pub async fn remove(&self, root: &Path) -> Option<Arc<ProjectEntry>> {
        let removed = self.entries.lock().await.remove(root);
        if removed.is_some() {
            tracing::info!("Unregistered project {}", root.display());
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn snapshot(&self) -> Vec<Arc<ProjectEntry>> {
        self.entries.lock().await.values().cloned().collect()
    }
}

/// What one tick observed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Projects whose credentials were rejected with the current token
    pub auth_required: Vec<PathBuf>,
    /// Some session opened a stream or showed logs
    pub active: bool,
}

enum EntryTick {
    Skipped,
    Quiet,
    AuthRequired(PathBuf),
    Active,
}

/// Drives every registered log session
pub struct Scheduler {
    registry: Arc<SessionRegistry>,
    gateway: Arc<dyn CloudGateway>,
    console: Arc<dyn ConsoleSink>,
    config: SchedulerConfig,
    quiet: AtomicBool,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gateway: Arc<dyn CloudGateway>,
        console: Arc<dyn ConsoleSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            console,
            config,
            quiet: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// In quiet mode idle sessions are not restarted automatically
    pub fn set_quiet(&self, quiet: bool) {
        self.quiet.store(quiet, Ordering::Relaxed);
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet.load(Ordering::Relaxed)
    }

    /// Delay before the next tick
    pub fn next_interval(&self, report: &TickReport) -> Duration {
        if report.active {
            self.config.fast_interval
        } else {
            self.config.slow_interval
        }
    }

    /// Advance every session once
    pub async fn tick(&self) -> TickReport {
        let mut live = Vec::new();
        for entry in self.registry.snapshot().await {
            if entry.store().exists() {
                live.push(entry);
            } else {
                tracing::info!(
                    "Settings of {} are gone, closing its log session",
                    entry.root().display()
                );
                self.registry.remove(entry.root()).await;
                match entry.env().try_lock() {
                    Ok(mut env) => env.session.stop(self.console.as_ref(), false),
                    Err(_) => {
                        // Whoever holds the env may still be reading; stop once it lets go
                        let (entry, console) = (entry.clone(), self.console.clone());
                        tokio::spawn(async move {
                            let mut env = entry.env().lock().await;
                            env.session.stop(console.as_ref(), false);
                        });
                    }
                }
            }
        }

        let results = join_all(live.iter().map(|entry| self.tick_entry(entry))).await;

        let mut report = TickReport::default();
        for result in results {
            match result {
                EntryTick::AuthRequired(root) => report.auth_required.push(root),
                EntryTick::Active => report.active = true,
                EntryTick::Skipped | EntryTick::Quiet => {}
            }
        }
        report
    }

    async fn tick_entry(&self, entry: &ProjectEntry) -> EntryTick {
        let Some(_busy) = entry.try_busy() else {
            tracing::trace!("{} is busy, skipping", entry.root().display());
            return EntryTick::Skipped;
        };
        let Ok(mut env) = entry.env().try_lock() else {
            return EntryTick::Skipped;
        };
        let env = &mut *env;
        let console = self.console.as_ref();

        match env.session.state() {
            SessionState::Idle if env.session.wants_start() => {
                if self.is_quiet() {
                    return EntryTick::Quiet;
                }
                env.session.start(console);
                return EntryTick::Active;
            }
            SessionState::Idle | SessionState::Fail => return EntryTick::Skipped,
            SessionState::Init | SessionState::Poll => {}
        }

        let token = entry.credentials().bearer().await;
        let ctx = SessionContext {
            gateway: self.gateway.as_ref(),
            console,
            mapper: &env.mapper,
            token: token.as_deref(),
        };

        match env.session.query_logs(&ctx).await {
            QueryOutcome::Started => EntryTick::Active,
            QueryOutcome::Streaming { emitted } if emitted > 0 => EntryTick::Active,
            QueryOutcome::AuthRequired { token } => {
                if let Some(rejected) = token {
                    if entry.credentials().is_stale(&rejected).await {
                        tracing::debug!("Rejected token was already replaced, restarting log stream");
                        env.session.start(console);
                        return EntryTick::Skipped;
                    }
                }
                EntryTick::AuthRequired(entry.root().to_path_buf())
            }
            _ => EntryTick::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryConsole;
    use crate::session::notice;
    use crate::settings::tests::temp_project;
    use crate::testing::{fresh_token, FakeGateway};
    use std::fs;

    struct Harness {
        scheduler: Scheduler,
        gateway: Arc<FakeGateway>,
        console: Arc<MemoryConsole>,
    }

    fn harness(gateway: FakeGateway) -> Harness {
        let gateway = Arc::new(gateway);
        let console = Arc::new(MemoryConsole::new());
        let scheduler = Scheduler::new(
            Arc::new(SessionRegistry::new()),
            gateway.clone(),
            console.clone(),
            SchedulerConfig::default(),
        );
        Harness {
            scheduler,
            gateway,
            console,
        }
    }

    async fn project(h: &Harness, tag: &str, token: &str) -> Arc<ProjectEntry> {
        let store = SettingsStore::new(temp_project(tag));
        store.update(|s| s.device_group_id = Some("g1".into())).unwrap();
        store.save_token(&fresh_token(token)).unwrap();
        let entry = ProjectEntry::open(store.root(), SessionConfig::default()).unwrap();
        h.scheduler.registry().insert(entry).await
    }

    async fn start(h: &Harness, entry: &ProjectEntry) {
        let mut env = entry.env().lock().await;
        env.session.start(h.console.as_ref());
    }

    #[tokio::test]
    async fn test_tick_opens_and_reads_stream() {
        let h = harness(FakeGateway::with_devices(&["dev1"]));
        let entry = project(&h, "sched-open", "t").await;
        start(&h, &entry).await;

        let report = h.scheduler.tick().await;
        assert!(report.active);
        assert_eq!(h.scheduler.next_interval(&report), Duration::from_millis(300));

        h.gateway
            .feed("event: message\ndata: dev1 2024-01-01T00:00:00Z agent.log hi\n\n");
        assert!(h.scheduler.tick().await.active);
        assert_eq!(h.console.count_containing("[Agent] hi"), 1);

        let report = h.scheduler.tick().await;
        assert!(!report.active);
        assert_eq!(h.scheduler.next_interval(&report), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_busy_entry_is_skipped() {
        let h = harness(FakeGateway::with_devices(&["dev1"]));
        let entry = project(&h, "sched-busy", "t").await;
        start(&h, &entry).await;

        {
            let _guard = entry.try_busy().unwrap();
            assert!(entry.try_busy().is_none());
            h.scheduler.tick().await;
            assert_eq!(h.gateway.get(|s| s.created_streams), 0);
        }

        assert!(!entry.is_busy());
        h.scheduler.tick().await;
        assert_eq!(h.gateway.get(|s| s.created_streams), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_is_reported() {
        let gateway = FakeGateway::with_devices(&["dev1"]);
        gateway.set(|s| s.valid_tokens = vec!["other".into()]);
        let h = harness(gateway);
        let entry = project(&h, "sched-auth", "t").await;
        start(&h, &entry).await;

        let report = h.scheduler.tick().await;

        assert_eq!(report.auth_required, vec![entry.root().to_path_buf()]);
        assert_eq!(entry.env().lock().await.session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_replaced_token_resumes_stream() {
        let gateway = FakeGateway::with_devices(&["dev1"]);
        gateway.set(|s| s.valid_tokens = vec!["new".into()]);
        let h = harness(gateway);
        let entry = project(&h, "sched-stale", "old").await;
        start(&h, &entry).await;

        // Rejected with "old"; the chain installs "new" before the next tick
        let report = {
            let mut env = entry.env().lock().await;
            let ctx = SessionContext {
                gateway: h.gateway.as_ref(),
                console: h.console.as_ref(),
                mapper: &ErrorLocationMapper::new(),
                token: Some("old"),
            };
            let outcome = env.session.query_logs(&ctx).await;
            assert!(matches!(outcome, QueryOutcome::AuthRequired { .. }));
            entry.credentials().replace(fresh_token("new")).await;
            assert!(entry.credentials().is_stale("old").await);
            env.session.start(h.console.as_ref());
            drop(env);
            h.scheduler.tick().await
        };

        assert!(report.auth_required.is_empty());
        assert!(report.active);
        assert_eq!(entry.env().lock().await.session.state(), SessionState::Poll);
    }

    #[tokio::test]
    async fn test_quiet_mode_blocks_auto_start() {
        let h = harness(FakeGateway::with_devices(&["dev1"]));
        let entry = project(&h, "sched-quiet", "t").await;
        {
            let mut env = entry.env().lock().await;
            env.session.stop(h.console.as_ref(), true);
        }

        h.scheduler.set_quiet(true);
        h.scheduler.tick().await;
        assert_eq!(entry.env().lock().await.session.state(), SessionState::Idle);

        h.scheduler.set_quiet(false);
        h.scheduler.tick().await;
        assert_eq!(entry.env().lock().await.session.state(), SessionState::Init);
        assert_eq!(h.console.count_containing(notice::STREAM_REQUESTED), 1);
    }

    #[tokio::test]
    async fn test_vanished_project_is_dropped() {
        let h = harness(FakeGateway::with_devices(&["dev1"]));
        let entry = project(&h, "sched-gone", "t").await;
        fs::remove_dir_all(entry.root()).unwrap();

        h.scheduler.tick().await;

        assert!(h.scheduler.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_vanished_project_stops_after_env_is_released() {
        let h = harness(FakeGateway::with_devices(&["dev1"]));
        let entry = project(&h, "sched-gone-locked", "t").await;
        start(&h, &entry).await;
        h.scheduler.tick().await;

        let held = entry.env().lock().await;
        fs::remove_dir_all(entry.root()).unwrap();
        h.scheduler.tick().await;
        assert!(h.scheduler.registry().is_empty().await);
        assert_eq!(h.console.count_containing(notice::STREAM_STOPPED), 0);

        // Let the deferred stop queue up on the lock before releasing it
        tokio::task::yield_now().await;
        drop(held);

        let env = entry.env().lock().await;
        assert_eq!(env.session.state(), SessionState::Idle);
        assert!(!env.session.wants_start());
        assert_eq!(h.console.count_containing(notice::STREAM_STOPPED), 1);
    }

    #[tokio::test]
    async fn test_group_change_restarts_stream() {
        let h = harness(FakeGateway::with_devices(&["dev1"]));
        let entry = project(&h, "sched-group", "t").await;
        start(&h, &entry).await;
        h.scheduler.tick().await;

        let mut env = entry.env().lock().await;
        assert_eq!(env.session.state(), SessionState::Poll);
        let mut settings = env.settings.clone();
        settings.device_group_id = Some("g2".into());
        env.apply_settings(settings, h.console.as_ref());

        assert_eq!(env.session.state(), SessionState::Idle);
        assert!(env.session.wants_start());
        assert_eq!(env.session.target().device_group_id.as_deref(), Some("g2"));
    }
}
