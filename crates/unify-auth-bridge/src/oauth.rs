use std::borrow::Cow;

use async_trait::async_trait;
use chrono::Utc;
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenType,
    TokenUrl,
};
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::{info, warn};

use crate::{AuthError, Credential, Platform};

/// Read-only Gmail and Drive access, which is all the sync pipeline needs.
pub const GOOGLE_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/drive.readonly",
];

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: Option<String>,
}

impl OAuthConfig {
    pub fn google(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: Option<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            redirect_uri,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthBridge {
    http_client: Client,
}

impl Default for AuthBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthBridge {
    pub fn new() -> Self {
        // Token endpoint responses must not be followed across redirects.
        let http_client = Client::builder()
            .redirect(Policy::none())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { http_client }
    }

    /// Authorization URL asking for offline access so a refresh token is issued.
    pub fn authorize_url(
        &self,
        config: &OAuthConfig,
        scopes: &[&str],
    ) -> Result<(String, CsrfToken), AuthError> {
        let client = build_client(config)?;
        let mut req = client
            .authorize_url(CsrfToken::new_random)
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent");
        for scope in scopes {
            req = req.add_scope(Scope::new(scope.to_string()));
        }
        let (url, csrf) = req.url();
        Ok((url.to_string(), csrf))
    }

    pub async fn exchange_code(
        &self,
        platform: Platform,
        code: &str,
        config: &OAuthConfig,
    ) -> Result<Credential, AuthError> {
        let client = build_client(config)?;
        let mut req = client.exchange_code(AuthorizationCode::new(code.to_string()));
        if let Some(redirect_uri) = &config.redirect_uri {
            let redirect = RedirectUrl::new(redirect_uri.to_string())
                .map_err(|e| AuthError::InvalidConfig(format!("redirect_uri: {}", e)))?;
            req = req.set_redirect_uri(Cow::Owned(redirect));
        }
        let token = req
            .request_async(&self.http_client)
            .await
            .map_err(|e| AuthError::TokenEndpoint(e.to_string()))?;

        info!("exchanged OAuth code for {} token", platform.as_str());
        Ok(credential_from_response(platform, &token))
    }

    /// Refresh an access token. The returned credential keeps the old refresh
    /// token when the endpoint does not rotate it.
    pub async fn refresh(
        &self,
        credential: &Credential,
        config: &OAuthConfig,
    ) -> Result<Credential, AuthError> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::NoRefreshToken(credential.platform))?;

        let client = build_client(config)?;
        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http_client)
            .await
            .map_err(|e| AuthError::TokenEndpoint(e.to_string()))?;

        let mut refreshed = credential_from_response(credential.platform, &token);
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = credential.refresh_token.clone();
        }
        if refreshed.scopes.is_empty() {
            refreshed.scopes = credential.scopes.clone();
        }
        info!("refreshed {} access token", credential.platform.as_str());
        Ok(refreshed)
    }
}

fn credential_from_response<T: TokenResponse>(platform: Platform, token: &T) -> Credential {
    let access_token = token.access_token().secret().to_string();
    let refresh_token = token.refresh_token().map(|t| t.secret().to_string());
    let expires_at = token
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| Utc::now() + d);
    let scopes = token
        .scopes()
        .map(|scopes| scopes.iter().map(|s| s.as_str().to_string()).collect())
        .unwrap_or_default();
    let token_type = token_type_label(token.token_type());

    Credential {
        platform,
        access_token,
        refresh_token,
        expires_at,
        scopes,
        token_type,
    }
}

/// The token endpoint's `token_type` as the wire string, e.g. "bearer".
fn token_type_label<TT: TokenType>(token_type: &TT) -> Option<String> {
    match serde_json::to_value(token_type).ok()? {
        serde_json::Value::String(label) => Some(label),
        _ => None,
    }
}

type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

fn build_client(config: &OAuthConfig) -> Result<ConfiguredClient, AuthError> {
    let auth_url = AuthUrl::new(config.auth_url.clone())
        .map_err(|_| AuthError::InvalidConfig("invalid auth_url".to_string()))?;
    let token_url = TokenUrl::new(config.token_url.clone())
        .map_err(|_| AuthError::InvalidConfig("invalid token_url".to_string()))?;
    let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
        .set_client_secret(ClientSecret::new(config.client_secret.clone()))
        .set_auth_uri(auth_url)
        .set_token_uri(token_url);
    if let Some(redirect_uri) = &config.redirect_uri {
        let redirect = RedirectUrl::new(redirect_uri.clone())
            .map_err(|e| AuthError::InvalidConfig(format!("redirect_uri: {}", e)))?;
        client = client.set_redirect_uri(redirect);
    }
    Ok(client)
}

/// Something that can turn an expired credential into a fresh one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError>;
}

/// `TokenRefresher` backed by the platform's OAuth token endpoint.
#[derive(Debug, Clone)]
pub struct OAuthRefresher {
    bridge: AuthBridge,
    config: OAuthConfig,
}

impl OAuthRefresher {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            bridge: AuthBridge::new(),
            config,
        }
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
        if self.config.client_id.is_empty() {
            warn!("OAuth client id not configured; cannot refresh");
            return Err(AuthError::InvalidConfig("missing client_id".to_string()));
        }
        self.bridge.refresh(credential, &self.config).await
    }
}
