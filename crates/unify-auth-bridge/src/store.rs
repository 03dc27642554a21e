use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, info, warn};

use crate::{AuthError, Credential, OrganisationId, Platform};

/// Holds the current OAuth credential per (organisation, platform).
///
/// Storing a credential for a platform that is already connected replaces it.
/// Freshness is never checked here: an expired token shows up as a failure
/// from whichever source adapter uses it.
pub trait CredentialStore: Send + Sync {
    fn store(&self, org: &OrganisationId, credential: Credential) -> Result<(), AuthError>;

    fn get(&self, org: &OrganisationId, platform: Platform) -> Result<Option<Credential>, AuthError>;

    fn clear(&self, org: &OrganisationId, platform: Platform) -> Result<(), AuthError>;

    fn is_connected(&self, org: &OrganisationId, platform: Platform) -> bool {
        match self.get(org, platform) {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!(%org, %platform, "credential lookup failed: {}", err);
                false
            }
        }
    }
}

/// Process-local store. Used by tests and by deployments that re-connect on start.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<(OrganisationId, Platform), Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> AuthError {
    AuthError::Store("credential map lock poisoned".to_string())
}

impl CredentialStore for MemoryCredentialStore {
    fn store(&self, org: &OrganisationId, credential: Credential) -> Result<(), AuthError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert((org.clone(), credential.platform), credential);
        Ok(())
    }

    fn get(&self, org: &OrganisationId, platform: Platform) -> Result<Option<Credential>, AuthError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(&(org.clone(), platform)).cloned())
    }

    fn clear(&self, org: &OrganisationId, platform: Platform) -> Result<(), AuthError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.remove(&(org.clone(), platform));
        Ok(())
    }
}

/// OS keychain backed store. One JSON entry per (organisation, platform)
/// under a single keychain service.
#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    const DEFAULT_SERVICE: &'static str = "unify";

    pub fn new() -> Self {
        Self::with_service(Self::DEFAULT_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn account(org: &OrganisationId, platform: Platform) -> String {
        format!("{}:{}", org.as_str(), platform.as_str())
    }

    fn entry(&self, org: &OrganisationId, platform: Platform) -> Result<keyring::Entry, AuthError> {
        keyring::Entry::new(&self.service, &Self::account(org, platform))
            .map_err(|e| AuthError::Store(format!("keychain entry: {}", e)))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn store(&self, org: &OrganisationId, credential: Credential) -> Result<(), AuthError> {
        let platform = credential.platform;
        let payload = serde_json::to_string(&credential)?;
        self.entry(org, platform)?
            .set_password(&payload)
            .map_err(|e| AuthError::Store(format!("keychain write: {}", e)))?;
        info!(%org, %platform, "stored credential in keychain");
        Ok(())
    }

    fn get(&self, org: &OrganisationId, platform: Platform) -> Result<Option<Credential>, AuthError> {
        match self.entry(org, platform)?.get_password() {
            Ok(payload) if payload.trim().is_empty() => Ok(None),
            Ok(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            Err(keyring::Error::NoEntry) => {
                debug!(%org, %platform, "no keychain entry");
                Ok(None)
            }
            Err(e) => Err(AuthError::Store(format!("keychain read: {}", e))),
        }
    }

    fn clear(&self, org: &OrganisationId, platform: Platform) -> Result<(), AuthError> {
        match self.entry(org, platform)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                info!(%org, %platform, "cleared credential");
                Ok(())
            }
            Err(e) => Err(AuthError::Store(format!("keychain delete: {}", e))),
        }
    }
}
