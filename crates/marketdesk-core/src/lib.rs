//! Core library for marketdesk.
//!
//! Holds the authenticated-session lifecycle shared by every marketdesk
//! front end: the credential store and its durable backends, the
//! authenticated request pipeline with its single retry on 401, and the
//! lease-based session refresh used by the session provider path.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiError, AuthenticatedClient, LoginRedirect, RequestEnvelope};
pub use auth::{
    AdminUser, AuthError, CredentialManager, CredentialStore, SessionErrorKind, SessionStore,
    SessionToken, TokenPair, TokenStorage,
};
pub use config::{Config, StorageBackend};
