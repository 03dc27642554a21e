//! Engine configuration.
//!
//! Read from `unify.toml` in the data directory, then overridden by
//! environment variables. A missing file means defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use unify_auth_bridge::OAuthConfig;

use crate::extractor::{
    ExtractorConfig, DEFAULT_EXTRACT_DELAY, DEFAULT_LLM_TIMEOUT, DEFAULT_MAX_PROMPT_CHARS,
};
use crate::orchestrator::{OrchestratorConfig, DEFAULT_MAX_RESULTS};

pub const DEFAULT_REDIRECT_PORT: u16 = 8847;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UnifyConfig {
    pub gmail: GmailConfig,
    pub drive: DriveConfig,
    pub extractor: ExtractorSection,
    pub llm: LlmConfig,
    pub google: GoogleConfig,
    pub filter: FilterConfig,
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    /// Messages listed per sync.
    pub max_results: usize,
    /// Optional Gmail search query (e.g. "newer_than:30d").
    pub query: Option<String>,
    /// Pause between body fetches, in milliseconds.
    pub body_fetch_delay_ms: u64,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            query: None,
            body_fetch_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub enabled: bool,
    pub max_results: usize,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractorSection {
    pub delay_ms: u64,
    pub timeout_secs: u64,
    pub max_prompt_chars: usize,
}

impl Default for ExtractorSection {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_EXTRACT_DELAY.as_millis() as u64,
            timeout_secs: DEFAULT_LLM_TIMEOUT.as_secs(),
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Gemini,
    Anthropic,
}

impl LlmProvider {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Some(LlmProvider::Gemini),
            "anthropic" | "claude" => Some(LlmProvider::Anthropic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: Option<String>,
    /// Usually supplied via GEMINI_API_KEY / ANTHROPIC_API_KEY instead.
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Loopback port for the OAuth redirect.
    pub redirect_port: u16,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_port: DEFAULT_REDIRECT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Added to the built-in trusted sender domains.
    pub trusted_domains: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    Keyring,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub backend: CredentialBackend,
}

impl UnifyConfig {
    /// Load from `path` and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!("ignoring {}={:?}: not a number", key, raw);
                    None
                }
            }
        };

        if let Some(n) = number("UNIFY_GMAIL_MAX_RESULTS") {
            self.gmail.max_results = n as usize;
        }
        if let Some(n) = number("UNIFY_EXTRACT_DELAY_MS") {
            self.extractor.delay_ms = n;
        }
        if let Some(n) = number("UNIFY_LLM_TIMEOUT_SECS") {
            self.extractor.timeout_secs = n;
        }
        if let Some(raw) = lookup("UNIFY_LLM_PROVIDER") {
            match LlmProvider::parse(&raw) {
                Some(provider) => self.llm.provider = provider,
                None => warn!("ignoring UNIFY_LLM_PROVIDER={:?}", raw),
            }
        }
        if let Some(model) = lookup("UNIFY_LLM_MODEL").filter(|m| !m.trim().is_empty()) {
            self.llm.model = Some(model);
        }
        let key_var = match self.llm.provider {
            LlmProvider::Gemini => "GEMINI_API_KEY",
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
        };
        if let Some(key) = lookup(key_var).filter(|k| !k.trim().is_empty()) {
            self.llm.api_key = Some(key);
        }
        if let Some(id) = lookup("GOOGLE_CLIENT_ID").filter(|v| !v.is_empty()) {
            self.google.client_id = Some(id);
        }
        if let Some(secret) = lookup("GOOGLE_CLIENT_SECRET").filter(|v| !v.is_empty()) {
            self.google.client_secret = Some(secret);
        }
        if let Some(raw) = lookup("UNIFY_CREDENTIAL_BACKEND") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "keyring" => self.credentials.backend = CredentialBackend::Keyring,
                "memory" => self.credentials.backend = CredentialBackend::Memory,
                _ => warn!("ignoring UNIFY_CREDENTIAL_BACKEND={:?}", raw),
            }
        }
    }

    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            max_prompt_chars: self.extractor.max_prompt_chars.max(1),
            llm_timeout: Duration::from_secs(self.extractor.timeout_secs.max(1)),
            extract_delay: Duration::from_millis(self.extractor.delay_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_results: self.gmail.max_results,
            secondary_max_results: self.drive.max_results,
            body_fetch_delay: Duration::from_millis(self.gmail.body_fetch_delay_ms),
        }
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.google.redirect_port)
    }

    /// Google OAuth settings, if a client is configured.
    pub fn google_oauth(&self) -> Option<OAuthConfig> {
        let client_id = self.google.client_id.clone()?;
        let client_secret = self.google.client_secret.clone().unwrap_or_default();
        Some(OAuthConfig::google(
            client_id,
            client_secret,
            Some(self.redirect_uri()),
        ))
    }
}
