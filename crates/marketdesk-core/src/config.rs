//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! backend base URL, the login entry path, where tokens are kept, and the
//! request timeout.
//!
//! Configuration is stored at `~/.config/marketdesk/config.json`. A few
//! fields can be overridden from the environment (see [`Config::apply_env`]).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_LOGIN_PATH;
use crate::auth::{FileStorage, KeyringStorage, MemoryStorage, TokenStorage, UnavailableStorage};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "marketdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing is configured
const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_API_URL: &str = "MARKETDESK_API_URL";
pub const ENV_STORAGE: &str = "MARKETDESK_STORAGE";
pub const ENV_EMAIL: &str = "MARKETDESK_EMAIL";

/// Where the credential store keeps tokens between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Keyring,
    Memory,
    Unavailable,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageBackend::File),
            "keyring" | "keychain" => Ok(StorageBackend::Keyring),
            "memory" => Ok(StorageBackend::Memory),
            "unavailable" | "none" => Ok(StorageBackend::Unavailable),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub login_path: String,
    pub storage: StorageBackend,
    pub request_timeout_secs: u64,
    pub last_email: Option<String>,
    pub log_to_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            storage: StorageBackend::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            last_email: None,
            log_to_file: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var(ENV_API_URL).filter(|v| !v.is_empty()) {
            self.api_base_url = url;
        }
        if let Some(storage) = var(ENV_STORAGE).filter(|v| !v.is_empty()) {
            self.storage = storage
                .parse()
                .with_context(|| format!("Invalid {}", ENV_STORAGE))?;
        }
        if let Some(email) = var(ENV_EMAIL).filter(|v| !v.is_empty()) {
            self.last_email = Some(email);
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Shared HTTP client with the configured timeout
    pub fn http_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")
    }

    /// Open the configured durable token backend
    pub fn open_storage(&self) -> Result<Box<dyn TokenStorage>> {
        Ok(match self.storage {
            StorageBackend::File => Box::new(FileStorage::in_dir(&self.cache_dir()?)),
            StorageBackend::Keyring => Box::new(KeyringStorage::new()),
            StorageBackend::Memory => Box::new(MemoryStorage::new()),
            StorageBackend::Unavailable => Box::new(UnavailableStorage),
        })
    }
}
