use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use super::storage::{TokenPair, TokenStorage};

/// Single source of truth for the current access/refresh token pair.
///
/// The pair lives in memory behind one lock and is mirrored to a durable
/// [`TokenStorage`] backend. Both values are always read and replaced
/// together, so a reader never sees a new access token next to a stale
/// refresh token.
///
/// Durable writes happen outside the in-memory lock, so readers are never
/// held up by file or keyring I/O. Every change gets a generation number
/// and storage only accepts a write newer than the last one it took.
pub struct CredentialStore {
    storage: Box<dyn TokenStorage>,
    tokens: RwLock<Versioned>,
    persisted: Mutex<u64>,
}

#[derive(Default)]
struct Versioned {
    generation: u64,
    pair: Option<TokenPair>,
}

impl CredentialStore {
    /// Create an empty store over the given backend without reading it
    pub fn new(storage: Box<dyn TokenStorage>) -> Self {
        Self {
            storage,
            tokens: RwLock::new(Versioned::default()),
            persisted: Mutex::new(0),
        }
    }

    /// Create a store and hydrate it from durable storage.
    /// An unreadable backend starts the store empty.
    pub fn hydrate(storage: Box<dyn TokenStorage>) -> Self {
        let tokens = match storage.load() {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!(backend = storage.name(), error = %e, "Failed to load stored credentials");
                None
            }
        };
        debug!(
            backend = storage.name(),
            has_tokens = tokens.is_some(),
            "Credential store hydrated"
        );

        Self {
            storage,
            tokens: RwLock::new(Versioned {
                generation: 0,
                pair: tokens,
            }),
            persisted: Mutex::new(0),
        }
    }

    /// Name of the durable backend
    pub fn backend(&self) -> &'static str {
        self.storage.name()
    }

    pub fn get_access_token(&self) -> Option<String> {
        self.read().pair.as_ref().map(|t| t.access_token.clone())
    }

    pub fn get_refresh_token(&self) -> Option<String> {
        self.read().pair.as_ref().map(|t| t.refresh_token.clone())
    }

    /// Snapshot of both tokens taken under one read
    pub fn tokens(&self) -> Option<TokenPair> {
        self.read().pair.clone()
    }

    pub fn has_tokens(&self) -> bool {
        self.read().pair.is_some()
    }

    /// Replace both tokens.
    pub fn set_tokens(&self, access: &str, refresh: &str) {
        let pair = TokenPair::new(access, refresh);
        let generation = {
            let mut guard = self.write();
            guard.generation += 1;
            guard.pair = Some(pair.clone());
            guard.generation
        };
        debug!("Credentials updated");
        self.persist(generation, Some(&pair));
    }

    /// Remove both tokens. Clearing an empty store is a no-op.
    pub fn clear_tokens(&self) {
        let (generation, had_tokens) = {
            let mut guard = self.write();
            guard.generation += 1;
            (guard.generation, guard.pair.take().is_some())
        };
        if had_tokens {
            info!("Credentials cleared");
        }
        self.persist(generation, None);
    }

    /// Mirror one change to durable storage unless a newer change already
    /// got there first.
    fn persist(&self, generation: u64, pair: Option<&TokenPair>) {
        let mut persisted = self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        if *persisted > generation {
            debug!(generation, "Skipping superseded credential write");
            return;
        }
        let result = match pair {
            Some(pair) => self.storage.save(pair),
            None => self.storage.clear(),
        };
        if let Err(e) = result {
            warn!(backend = self.storage.name(), error = %e, "Failed to persist credentials");
        }
        *persisted = generation;
    }

    fn read(&self) -> RwLockReadGuard<'_, Versioned> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Versioned> {
        self.tokens.write().unwrap_or_else(PoisonError::into_inner)
    }
}
