use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::storage::TokenPair;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Access token lease on the session path, in minutes.
/// Every refresh or login restarts the lease from the current time.
pub const ACCESS_TOKEN_LEASE_MINUTES: i64 = 5;

/// Marker left on a session whose renewal failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionErrorKind {
    RefreshAccessTokenError,
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionErrorKind::RefreshAccessTokenError => f.write_str("RefreshAccessTokenError"),
        }
    }
}

/// Lease-based session token used by the session provider path.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub access_token: String,
    pub refresh_token: String,
    pub id: String,
    pub access_token_expires: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SessionErrorKind>,
}

impl SessionToken {
    /// Issue a fresh session whose lease starts at `now`
    pub fn issue(tokens: TokenPair, id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            id: id.into(),
            access_token_expires: lease_end(now),
            error: None,
        }
    }

    /// The lease is over once `now` reaches the expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.access_token_expires
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the last renewal failed. Such a session must not be
    /// trusted; the caller sends the user back to the login entry.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn time_until_expiry_at(&self, now: DateTime<Utc>) -> Duration {
        self.access_token_expires - now
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry_at(Utc::now()).num_minutes().max(0)
    }

    pub fn tokens(&self) -> TokenPair {
        TokenPair::new(self.access_token.clone(), self.refresh_token.clone())
    }

    /// Session after a successful renewal at `now`
    pub(crate) fn renewed(&self, tokens: TokenPair, now: DateTime<Utc>) -> Self {
        Self::issue(tokens, self.id.clone(), now)
    }

    /// The same session, stale token included, flagged as failed
    pub(crate) fn with_refresh_error(&self) -> Self {
        Self {
            error: Some(SessionErrorKind::RefreshAccessTokenError),
            ..self.clone()
        }
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("id", &self.id)
            .field("access_token_expires", &self.access_token_expires)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

fn lease_end(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::minutes(ACCESS_TOKEN_LEASE_MINUTES)
}

/// Persists the current [`SessionToken`] between runs.
pub struct SessionStore {
    cache_dir: PathBuf,
    pub data: Option<SessionToken>,
}

impl SessionStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            data: None,
        }
    }

    /// Load session from disk. Returns whether a session was found.
    /// A file that does not parse counts as no session.
    pub fn load(&mut self) -> Result<bool> {
        let path = self.session_path();
        if path.exists() {
            let contents =
                std::fs::read_to_string(&path).context("Failed to read session file")?;
            match serde_json::from_str::<SessionToken>(&contents) {
                Ok(data) => {
                    self.data = Some(data);
                    return Ok(true);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable session file");
                    self.data = None;
                }
            }
        }
        Ok(false)
    }

    /// Save session to disk
    pub fn save(&self) -> Result<()> {
        if let Some(ref data) = self.data {
            let path = self.session_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let contents = serde_json::to_string_pretty(data)?;
            std::fs::write(path, contents).context("Failed to write session file")?;
        }
        Ok(())
    }

    /// Clear session data
    pub fn clear(&mut self) -> Result<()> {
        self.data = None;
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Update session with new data
    pub fn update(&mut self, data: SessionToken) {
        self.data = Some(data);
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}
