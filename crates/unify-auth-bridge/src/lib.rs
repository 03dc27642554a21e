//! Credential lifecycle for connected platforms.
//!
//! - `Credential` is the OAuth material for one platform account.
//! - `CredentialStore` keeps exactly one credential per (organisation, platform).
//! - `AuthBridge` talks to the OAuth token endpoint (code exchange, refresh).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod oauth;
mod store;

pub use oauth::{AuthBridge, OAuthConfig, OAuthRefresher, TokenRefresher, GOOGLE_SCOPES};
pub use store::{CredentialStore, KeyringCredentialStore, MemoryCredentialStore};

/// Platforms an organisation can connect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Google,
    Slack,
    Microsoft,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Google => "google",
            Platform::Slack => "slack",
            Platform::Microsoft => "microsoft",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" | "google_workspace" | "gmail" => Some(Platform::Google),
            "slack" => Some(Platform::Slack),
            "microsoft" | "outlook" => Some(Platform::Microsoft),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Google => "Google Workspace",
            Platform::Slack => "Slack",
            Platform::Microsoft => "Microsoft 365",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque organisation identifier handed over by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct OrganisationId(String);

impl OrganisationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrganisationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrganisationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// OAuth material for one connected platform account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub platform: Platform,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub token_type: Option<String>,
}

impl Credential {
    pub fn bearer(platform: Platform, access_token: impl Into<String>) -> Self {
        Self {
            platform,
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
            token_type: Some("Bearer".to_string()),
        }
    }

    /// True when an expiry is known and already in the past.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid OAuth configuration: {0}")]
    InvalidConfig(String),

    #[error("token endpoint request failed: {0}")]
    TokenEndpoint(String),

    #[error("credential for {0} has no refresh token")]
    NoRefreshToken(Platform),

    #[error("credential store error: {0}")]
    Store(String),

    #[error("credential encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
