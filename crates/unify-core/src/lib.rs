//! Unify sync engine.
//!
//! Pulls recent mail and documents for an organisation, keeps what looks
//! relevant, asks a language model for events, contacts and insights, and
//! publishes the result as one snapshot per organisation.

pub mod config;
pub mod extractor;
pub mod filter;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod sink;
pub mod sources;

pub use config::{CredentialBackend, LlmProvider, UnifyConfig};
pub use extractor::{
    ExtractionInput, ExtractionResult, Extractor, ExtractorConfig, LanguageModel, LlmError,
};
pub use filter::{classify, FilterVerdict, RelevanceFilter};
pub use model::{
    CandidateDocument, CandidateHeader, ContactType, DocumentCategory, EventType, ExtractedContact,
    ExtractedEvent, RelevantDocument, SnapshotCounts, SyncSnapshot,
};
pub use orchestrator::{
    BestEffortOutcome, OrchestratorConfig, SyncFailure, SyncOrchestrator, SyncState,
    SyncStatusReport, TriggerAck, TriggerError,
};
pub use progress::{SyncPhase, SyncProgress};
pub use sink::{JsonFileSnapshotSink, NoopSink, SinkError, SnapshotSink};
pub use sources::{DriveSource, GmailSource, MessageSource, SourceError};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use unify_auth_bridge::{
    CredentialStore, KeyringCredentialStore, MemoryCredentialStore, OAuthRefresher,
};

use crate::extractor::{AnthropicModel, DisabledModel, GeminiModel};

#[derive(Debug, Clone)]
pub struct UnifyPaths {
    pub base_dir: PathBuf,
    pub config_path: PathBuf,
    pub admin_socket_path: PathBuf,
    pub snapshots_dir: PathBuf,
}

impl UnifyPaths {
    pub fn from_env() -> Self {
        if let Some(dir) = std::env::var_os("UNIFY_DATA_DIR") {
            return Self::from_base(PathBuf::from(dir));
        }
        if let Some(dirs) = directories::ProjectDirs::from("org", "unify", "unify") {
            return Self::from_base(dirs.data_dir().to_path_buf());
        }
        Self::from_base(PathBuf::from(".unify"))
    }

    pub fn from_base(base_dir: PathBuf) -> Self {
        let config_path = base_dir.join("unify.toml");
        let admin_socket_path = base_dir.join("admin.sock");
        let snapshots_dir = base_dir.join("snapshots");
        Self {
            base_dir,
            config_path,
            admin_socket_path,
            snapshots_dir,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("Failed to create {}", self.base_dir.display()))?;
        Ok(())
    }
}

/// Everything the daemon needs, wired from configuration.
#[derive(Clone)]
pub struct Engine {
    pub config: UnifyConfig,
    pub orchestrator: SyncOrchestrator,
    sink: Arc<JsonFileSnapshotSink>,
}

impl Engine {
    pub fn init(paths: &UnifyPaths) -> Result<Self> {
        info!("Initializing Unify engine in {}", paths.base_dir.display());
        paths.ensure_dirs()?;
        let config = UnifyConfig::load(&paths.config_path)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;

        let credentials: Arc<dyn CredentialStore> = match config.credentials.backend {
            CredentialBackend::Keyring => Arc::new(KeyringCredentialStore::new()),
            CredentialBackend::Memory => {
                warn!("using in-memory credential store; connections are lost on restart");
                Arc::new(MemoryCredentialStore::new())
            }
        };

        let model = build_model(&config, http.clone());
        info!(model = model.id(), "language model ready");
        let extractor = Extractor::new(model, config.extractor_config());

        let gmail = GmailSource::new(http.clone()).with_query(config.gmail.query.clone());
        let sink = Arc::new(JsonFileSnapshotSink::new(paths.snapshots_dir.clone()));

        let mut builder = SyncOrchestrator::builder(credentials, Arc::new(gmail), extractor)
            .filter(RelevanceFilter::with_trusted_domains(&config.filter.trusted_domains))
            .sink(sink.clone())
            .config(config.orchestrator_config());
        if config.drive.enabled {
            builder = builder.secondary(Arc::new(DriveSource::new(http.clone())));
        }
        match config.google_oauth() {
            Some(oauth) => builder = builder.refresher(Arc::new(OAuthRefresher::new(oauth))),
            None => warn!("GOOGLE_CLIENT_ID not set; expired tokens will not be refreshed"),
        }

        Ok(Self {
            config,
            orchestrator: builder.build(),
            sink,
        })
    }

    /// Load every stored snapshot so reads work before the first sync.
    pub async fn restore_snapshots(&self) -> Result<usize> {
        let mut restored = 0;
        for org in self.sink.stored_organisations()? {
            match self.orchestrator.restore(&org).await {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => warn!(%org, "could not restore snapshot: {}", e),
            }
        }
        Ok(restored)
    }
}

fn build_model(config: &UnifyConfig, http: reqwest::Client) -> Arc<dyn LanguageModel> {
    let Some(api_key) = config.llm.api_key.clone() else {
        let var = match config.llm.provider {
            LlmProvider::Gemini => "GEMINI_API_KEY",
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
        };
        warn!("{} not set; extraction will fail until it is configured", var);
        return Arc::new(DisabledModel::new(format!("{} not set", var)));
    };
    match config.llm.provider {
        LlmProvider::Gemini => Arc::new(GeminiModel::new(api_key, config.llm.model.clone(), http)),
        LlmProvider::Anthropic => {
            Arc::new(AnthropicModel::new(api_key, config.llm.model.clone(), http))
        }
    }
}
