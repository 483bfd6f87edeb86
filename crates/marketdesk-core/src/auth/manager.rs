//! Credential lifecycle: login, logout, and token renewal.
//!
//! Renewal has two triggers that share one refresh routine:
//! - [`CredentialManager::on_unauthorized`] after a request came back 401
//! - [`CredentialManager::on_lease_expired`] when a session lease ran out

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::credentials::CredentialStore;
use super::error::AuthError;
use super::session::SessionToken;
use super::storage::TokenPair;
use crate::api::error::truncate_body;

/// Login endpoint, relative to the API base URL
pub const LOGIN_PATH: &str = "/auth/login";

/// Refresh endpoint, relative to the API base URL
pub const REFRESH_PATH: &str = "/auth/refresh-token";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
    user: AdminUser,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Dashboard account returned by the login endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUser {
    #[serde(alias = "_id", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Backends disagree on whether ids are strings or numbers
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: AdminUser,
    pub tokens: TokenPair,
}

impl LoginOutcome {
    /// Start a session lease for this login at `now`
    pub fn session_at(&self, now: DateTime<Utc>) -> SessionToken {
        SessionToken::issue(self.tokens.clone(), self.user.id.clone(), now)
    }

    pub fn session(&self) -> SessionToken {
        self.session_at(Utc::now())
    }
}

/// Owns the [`CredentialStore`] and every operation that changes it.
///
/// Share one instance (behind an `Arc`) between everything that issues
/// requests; the refresh gate only collapses refreshes that go through the
/// same manager.
pub struct CredentialManager {
    http: Client,
    base_url: String,
    store: CredentialStore,
    refresh_gate: Mutex<()>,
}

impl CredentialManager {
    pub fn new(http: Client, base_url: impl Into<String>, store: CredentialStore) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Authenticate with email and password and persist the issued tokens.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        let response = self
            .http
            .post(self.endpoint(LOGIN_PATH))
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Login rejected");
            return Err(AuthError::LoginFailed {
                status: status.as_u16(),
                detail: truncate_body(&body),
            });
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;

        self.store.set_tokens(&login.access_token, &login.refresh_token);
        info!(user_id = %login.user.id, "Login successful");

        Ok(LoginOutcome {
            user: login.user,
            tokens: TokenPair::new(login.access_token, login.refresh_token),
        })
    }

    /// Drop all stored credentials.
    pub fn logout(&self) {
        self.store.clear_tokens();
        info!("Logged out");
    }

    /// Exchange a refresh token for a new pair. A response without a new
    /// refresh token keeps the one that was sent.
    async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        debug!("Refreshing access token");

        let response = self
            .http
            .post(self.endpoint(REFRESH_PATH))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::RefreshRejected {
                status: status.as_u16(),
            });
        }

        let refreshed: RefreshResponse = response.json().await.map_err(|e| {
            AuthError::InvalidResponse(format!("Failed to parse refresh response: {}", e))
        })?;

        let refresh_token = refreshed
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(TokenPair::new(refreshed.access_token, refresh_token))
    }

    /// Renew credentials after a request failed with 401.
    ///
    /// `stale_access_token` is the token that request carried. Callers are
    /// serialized; a caller that arrives after another one already rotated
    /// the token gets the current token without a second refresh call.
    ///
    /// Any failure clears the store. Redirecting to login is left to the
    /// caller.
    pub async fn on_unauthorized(
        &self,
        stale_access_token: Option<&str>,
    ) -> Result<String, AuthError> {
        let _gate = self.refresh_gate.lock().await;

        if let Some(current) = self.store.get_access_token() {
            if stale_access_token != Some(current.as_str()) {
                debug!("Access token already rotated, reusing it");
                return Ok(current);
            }
        }

        let Some(refresh_token) = self.store.get_refresh_token() else {
            warn!("No refresh token stored");
            self.store.clear_tokens();
            return Err(AuthError::NoRefreshToken);
        };

        match self.refresh_grant(&refresh_token).await {
            Ok(tokens) => {
                self.store
                    .set_tokens(&tokens.access_token, &tokens.refresh_token);
                info!("Token refresh completed successfully");
                Ok(tokens.access_token)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed, clearing credentials");
                self.store.clear_tokens();
                Err(e)
            }
        }
    }

    /// Renew an expired session lease.
    ///
    /// The store is authoritative: if it already holds a different access
    /// token (another caller refreshed since this session was issued), the
    /// session adopts the stored pair without a network call. Otherwise the
    /// refresh uses the stored refresh token, or the session's own when the
    /// store is empty.
    ///
    /// On success the renewed tokens also replace the stored pair. On
    /// failure the previous session comes back flagged with
    /// [`SessionErrorKind::RefreshAccessTokenError`](super::SessionErrorKind)
    /// and its stale access token.
    pub async fn on_lease_expired(&self, session: &SessionToken, now: DateTime<Utc>) -> SessionToken {
        let _gate = self.refresh_gate.lock().await;

        let refresh_token = match self.store.tokens() {
            Some(current) if current.access_token != session.access_token => {
                debug!(session_id = %session.id, "Tokens already rotated, adopting stored pair");
                return session.renewed(current, now);
            }
            Some(current) => current.refresh_token,
            None => session.refresh_token.clone(),
        };

        match self.refresh_grant(&refresh_token).await {
            Ok(tokens) => {
                self.store
                    .set_tokens(&tokens.access_token, &tokens.refresh_token);
                info!(session_id = %session.id, "Session lease renewed");
                session.renewed(tokens, now)
            }
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Session renewal failed");
                session.with_refresh_error()
            }
        }
    }

    /// Session lookup: inside the lease the session comes back unchanged
    /// without a network call, otherwise it is renewed.
    pub async fn session_at(&self, session: &SessionToken, now: DateTime<Utc>) -> SessionToken {
        if !session.is_expired_at(now) {
            return session.clone();
        }
        self.on_lease_expired(session, now).await
    }

    pub async fn session(&self, session: &SessionToken) -> SessionToken {
        self.session_at(session, Utc::now()).await
    }
}
