//! Durable backends for the access/refresh token pair.
//!
//! Every backend keeps the two values under the fixed keys
//! [`ACCESS_TOKEN_KEY`] and [`REFRESH_TOKEN_KEY`]. A missing, corrupt, or
//! half-written pair loads as "no tokens".

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Key under which the access token is persisted
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Key under which the refresh token is persisted
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Keychain service name for the keyring backend
const SERVICE_NAME: &str = "marketdesk";

/// Token file name in the cache directory
const TOKEN_FILE: &str = "tokens.json";

/// An access token together with the refresh token that renews it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken")]
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Build a pair from two independently stored values. Both must be
    /// present and non-empty.
    fn from_parts(access: Option<String>, refresh: Option<String>) -> Option<Self> {
        match (access, refresh) {
            (Some(a), Some(r)) if !a.is_empty() && !r.is_empty() => Some(Self::new(a, r)),
            (None, None) => None,
            _ => {
                warn!("Stored credentials are incomplete, ignoring them");
                None
            }
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Durable storage behind the [`CredentialStore`](super::CredentialStore).
pub trait TokenStorage: Send + Sync {
    /// Short backend name for logs and status output
    fn name(&self) -> &'static str;

    fn load(&self) -> Result<Option<TokenPair>>;

    /// Replace the stored pair.
    fn save(&self, tokens: &TokenPair) -> Result<()>;

    /// Remove both values. Clearing an empty storage succeeds.
    fn clear(&self) -> Result<()>;
}

// ============================================================================
// File
// ============================================================================

/// On-disk shape of the token file. Fields are optional so a document
/// missing one key still parses and is then rejected as incomplete.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenDocument {
    #[serde(rename = "accessToken", default)]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", default)]
    refresh_token: Option<String>,
}

/// Stores the pair as one JSON document, replaced through a temp file and a
/// rename so both keys change together on disk.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Token file inside the given cache directory
    pub fn in_dir(cache_dir: &Path) -> Self {
        Self::new(cache_dir.join(TOKEN_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }
}

impl TokenStorage for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load(&self) -> Result<Option<TokenPair>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read token file {}", self.path.display()))?;

        match serde_json::from_str::<TokenDocument>(&contents) {
            Ok(doc) => Ok(TokenPair::from_parts(doc.access_token, doc.refresh_token)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Token file is corrupt, ignoring it");
                Ok(None)
            }
        }
    }

    fn save(&self, tokens: &TokenPair) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let doc = TokenDocument {
            access_token: Some(tokens.access_token.clone()),
            refresh_token: Some(tokens.refresh_token.clone()),
        };
        let contents = serde_json::to_string_pretty(&doc)?;

        let temp = self.temp_path();
        std::fs::write(&temp, contents).context("Failed to write token file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600))
                .context("Failed to restrict token file permissions")?;
        }
        std::fs::rename(&temp, &self.path).context("Failed to replace token file")?;

        debug!(path = %self.path.display(), "Tokens written");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove token file"),
        }
    }
}

// ============================================================================
// Keyring
// ============================================================================

/// Stores each token as its own OS keychain entry.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {} from keychain", key)),
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {} from keychain", key)),
        }
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStorage for KeyringStorage {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn load(&self) -> Result<Option<TokenPair>> {
        let access = self.read(ACCESS_TOKEN_KEY)?;
        let refresh = self.read(REFRESH_TOKEN_KEY)?;
        Ok(TokenPair::from_parts(access, refresh))
    }

    fn save(&self, tokens: &TokenPair) -> Result<()> {
        self.entry(ACCESS_TOKEN_KEY)?
            .set_password(&tokens.access_token)
            .context("Failed to store access token in keychain")?;
        self.entry(REFRESH_TOKEN_KEY)?
            .set_password(&tokens.refresh_token)
            .context("Failed to store refresh token in keychain")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.remove(ACCESS_TOKEN_KEY)?;
        self.remove(REFRESH_TOKEN_KEY)
    }
}

// ============================================================================
// Memory / unavailable
// ============================================================================

/// Process-local storage. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    tokens: Mutex<Option<TokenPair>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(tokens: TokenPair) -> Self {
        Self {
            tokens: Mutex::new(Some(tokens)),
        }
    }
}

impl TokenStorage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, tokens: &TokenPair) -> Result<()> {
        *self.tokens.lock().unwrap_or_else(PoisonError::into_inner) = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.tokens.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Backend for non-interactive contexts: loads nothing, drops writes.
pub struct UnavailableStorage;

impl TokenStorage for UnavailableStorage {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn load(&self) -> Result<Option<TokenPair>> {
        Ok(None)
    }

    fn save(&self, _tokens: &TokenPair) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }
}
