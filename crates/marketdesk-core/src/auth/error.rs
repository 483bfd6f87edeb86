use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No refresh token stored")]
    NoRefreshToken,

    #[error("Refresh token rejected (status {status})")]
    RefreshRejected { status: u16 },

    #[error("Login failed (status {status}): {detail}")]
    LoginFailed { status: u16, detail: String },

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Whether the error by itself means the stored credentials are gone.
    ///
    /// Transport and parse failures can come from a sign-in attempt, which
    /// leaves the store alone, so they don't count. A refresh that fails
    /// that way does clear the store; check
    /// [`CredentialStore::has_tokens`](super::CredentialStore::has_tokens)
    /// after calling the manager directly.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::NoRefreshToken | AuthError::RefreshRejected { .. }
        )
    }
}
