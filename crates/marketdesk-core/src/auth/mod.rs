//! Authentication module for managing credentials and sessions.
//!
//! This module provides:
//! - `CredentialStore`: the single source of truth for the token pair
//! - `TokenStorage` backends: file, OS keyring, memory, unavailable
//! - `CredentialManager`: login, logout, and the one refresh routine behind
//!   both the 401 trigger and the lease-expiry trigger
//! - `SessionToken`: the lease-based session used by the session provider
//!
//! Access tokens are leased for 5 minutes on the session path.

pub mod credentials;
pub mod error;
pub mod manager;
pub mod session;
pub mod storage;

pub use credentials::CredentialStore;
pub use error::AuthError;
pub use manager::{AdminUser, CredentialManager, LoginOutcome};
pub use session::{SessionErrorKind, SessionStore, SessionToken, ACCESS_TOKEN_LEASE_MINUTES};
pub use storage::{
    FileStorage, KeyringStorage, MemoryStorage, TokenPair, TokenStorage, UnavailableStorage,
};
