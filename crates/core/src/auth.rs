//! Access token handling
//!
//! The token is an opaque bearer value handed out by the cloud. The client
//! only tracks its expiry and the refresh token that renews it.
//!
//! [`CredentialCache`] is shared by the prerequisite chain (which writes it)
//! and every log session (which reads it). Each replacement bumps a
//! generation counter so a failure observed with an older token can be told
//! apart from one observed with the current token.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Tokens this close to expiry are refreshed before use
pub const EXPIRY_MARGIN_SECS: i64 = 60;

/// Bearer token plus its renewal data
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    #[serde(rename = "access_token")]
    pub value: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

// Keep token values out of debug logs
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
            refresh_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Usable for at least [`EXPIRY_MARGIN_SECS`] more at `now`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) < self.expires_at
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }
}

/// Shared, generation-counted holder of the current access token
#[derive(Clone, Default)]
pub struct CredentialCache {
    token: Arc<RwLock<Option<AccessToken>>>,
    generation: Arc<AtomicU64>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: AccessToken) -> Self {
        Self {
            token: Arc::new(RwLock::new(Some(token))),
            generation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn current(&self) -> Option<AccessToken> {
        self.token.read().await.clone()
    }

    /// Current token value, if any
    pub async fn bearer(&self) -> Option<String> {
        self.token.read().await.as_ref().map(|t| t.value.clone())
    }

    /// Install a new token and bump the generation
    pub async fn replace(&self, token: AccessToken) {
        *self.token.write().await = Some(token);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop the cached token (it was rejected by the server)
    ///
    /// Keeps the refresh token so the chain can try a silent renewal first.
    pub async fn invalidate(&self) {
        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_mut() {
            token.expires_at = DateTime::<Utc>::MIN_UTC;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Forget everything, refresh token included
    pub async fn clear(&self) {
        *self.token.write().await = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// True when `value` is no longer the token in use
    pub async fn is_stale(&self, value: &str) -> bool {
        match self.token.read().await.as_ref() {
            Some(current) => current.value != value && current.is_fresh(),
            None => false,
        }
    }
}
