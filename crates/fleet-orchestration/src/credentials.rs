//! Sudo password storage
//!
//! Passwords are stored per username in the OS keyring under
//! [`KEYRING_SERVICE`] and cached in memory for the length of a run.

use keyring::Entry;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

/// Keyring service every password is filed under
pub const KEYRING_SERVICE: &str = "nebula-network-distributor";

/// A per-username secret store
pub trait CredentialStore: Send + Sync {
    /// The stored password, if any
    fn get(&self, username: &str) -> Result<Option<String>>;

    /// Store a password, replacing any previous one
    fn set(&self, username: &str, password: &str) -> Result<()>;
}

/// The OS keyring
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    /// Store under a custom service name
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, username: &str) -> Result<Entry> {
        Entry::new(&self.service, username).map_err(|e| Error::Credentials(e.to_string()))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, username: &str) -> Result<Option<String>> {
        match self.entry(username)?.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::Credentials(e.to_string())),
        }
    }

    fn set(&self, username: &str, password: &str) -> Result<()> {
        self.entry(username)?
            .set_password(password)
            .map_err(|e| Error::Credentials(e.to_string()))
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore(Mutex<HashMap<String, String>>);

impl CredentialStore for MemoryStore {
    fn get(&self, username: &str) -> Result<Option<String>> {
        let passwords = self
            .0
            .lock()
            .map_err(|_| Error::Credentials("store poisoned".to_string()))?;
        Ok(passwords.get(username).cloned())
    }

    fn set(&self, username: &str, password: &str) -> Result<()> {
        self.0
            .lock()
            .map_err(|_| Error::Credentials("store poisoned".to_string()))?
            .insert(username.to_string(), password.to_string());
        Ok(())
    }
}

/// Passwords resolved for this run, keyed by username
#[derive(Default, Clone)]
pub struct CredentialCache(HashMap<String, String>);

impl CredentialCache {
    /// An empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// The password for `username`
    pub fn get(&self, username: &str) -> Option<&str> {
        self.0.get(username).map(String::as_str)
    }

    /// Remember a password
    pub fn insert(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.0.insert(username.into(), password.into());
    }

    /// Number of usernames cached
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Resolve a password for every distinct username.
///
/// Stored passwords are used as they are unless `overwrite` is set; missing
/// ones (and all of them when overwriting) come from `prompt` and are saved.
pub fn gather_passwords<'a, F>(
    store: &dyn CredentialStore,
    usernames: impl IntoIterator<Item = &'a str>,
    overwrite: bool,
    mut prompt: F,
) -> Result<CredentialCache>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut cache = CredentialCache::new();
    for username in usernames {
        if cache.get(username).is_some() {
            continue;
        }
        let stored = if overwrite { None } else { store.get(username)? };
        let password = match stored {
            Some(password) => {
                info!(%username, "retrieved sudo password");
                password
            }
            None => {
                info!(%username, "sudo password not saved");
                let password = prompt(username)?;
                store.set(username, &password)?;
                debug!(%username, "sudo password stored");
                password
            }
        };
        cache.insert(username, password);
    }
    Ok(cache)
}
