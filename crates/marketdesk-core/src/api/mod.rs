//! REST client module for the marketplace admin backend.
//!
//! This module provides the `AuthenticatedClient`, which wraps every call
//! to the backend: it attaches the current bearer token, and on a 401
//! refreshes the credentials once and replays the request.
//!
//! Response bodies of domain endpoints are opaque here; only the status
//! code decides what the pipeline does.

pub mod client;
pub mod envelope;
pub mod error;

pub use client::{AuthenticatedClient, LogRedirect, LoginRedirect, DEFAULT_LOGIN_PATH};
pub use envelope::RequestEnvelope;
pub use error::ApiError;
