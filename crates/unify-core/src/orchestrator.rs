//! Per-organisation sync state machine.
//!
//! `idle -> syncing -> {completed, error}`. A run walks five phases (fetch,
//! filter, extract, drive check, finalize) on a background task and publishes
//! one snapshot at the end. Readers always see the last committed snapshot; a
//! failed run leaves it untouched.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use unify_auth_bridge::{
    AuthError, Credential, CredentialStore, OrganisationId, Platform, TokenRefresher,
};

use crate::extractor::{ExtractionInput, Extractor};
use crate::filter::RelevanceFilter;
use crate::model::{
    dedup_contacts, dedup_insights, CandidateDocument, RelevantDocument, SnapshotCounts,
    SyncSnapshot,
};
use crate::progress::{SyncPhase, SyncProgress};
use crate::sink::{NoopSink, SinkError, SnapshotSink};
use crate::sources::MessageSource;

pub const DEFAULT_MAX_RESULTS: usize = 50;

/// Tuning for a sync run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Messages listed from the primary source per run.
    pub max_results: usize,

    /// Files listed by the secondary (drive) check.
    pub secondary_max_results: usize,

    /// Pause between body fetches during the filter phase.
    pub body_fetch_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            secondary_max_results: DEFAULT_MAX_RESULTS,
            body_fetch_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Completed,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Completed => "completed",
            SyncState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncFailure {
    pub phase: SyncPhase,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Result of the secondary phase, which never fails the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BestEffortOutcome {
    Completed { listed: usize, relevant: usize },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatusReport {
    pub status: SyncState,
    pub progress: SyncProgress,
    /// Time of the last successful run, not the current one.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub counts: SnapshotCounts,
    pub failure: Option<SyncFailure>,
    pub drive_check: Option<BestEffortOutcome>,
    pub started_at: Option<DateTime<Utc>>,
}

impl SyncStatusReport {
    pub fn idle() -> Self {
        Self {
            status: SyncState::Idle,
            progress: SyncProgress::idle(),
            last_sync_at: None,
            counts: SnapshotCounts::default(),
            failure: None,
            drive_check: None,
            started_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SyncState::Completed | SyncState::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerAck {
    pub org: OrganisationId,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TriggerError {
    #[error("a sync is already running for {0}")]
    AlreadySyncing(OrganisationId),
    #[error("{} is not connected", .0.display_name())]
    Disconnected(Platform),
}

#[derive(Debug, Error)]
#[error("{} failed: {message}", .phase.label())]
struct PhaseError {
    phase: SyncPhase,
    message: String,
}

impl PhaseError {
    fn new(phase: SyncPhase, err: impl std::fmt::Display) -> Self {
        Self {
            phase,
            message: err.to_string(),
        }
    }
}

struct RunSummary {
    counts: SnapshotCounts,
    finished_at: DateTime<Utc>,
}

/// Observable state for one organisation.
struct Workspace {
    status: watch::Sender<SyncStatusReport>,
    snapshot: watch::Sender<Arc<SyncSnapshot>>,
}

impl Workspace {
    fn new() -> Self {
        let (status, _) = watch::channel(SyncStatusReport::idle());
        let (snapshot, _) = watch::channel(Arc::new(SyncSnapshot::default()));
        Self { status, snapshot }
    }

    fn advance(&self, phase: SyncPhase, position: u8, message: impl Into<String>) {
        self.status
            .send_modify(|report| report.progress.advance(phase, position, message));
    }

    fn current_phase(&self) -> SyncPhase {
        self.status.borrow().progress.phase
    }
}

struct Inner {
    credentials: Arc<dyn CredentialStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    primary: Arc<dyn MessageSource>,
    secondary: Option<Arc<dyn MessageSource>>,
    extractor: Extractor,
    filter: RelevanceFilter,
    sink: Arc<dyn SnapshotSink>,
    config: OrchestratorConfig,
    workspaces: DashMap<OrganisationId, Arc<Workspace>>,
}

pub struct OrchestratorBuilder {
    credentials: Arc<dyn CredentialStore>,
    primary: Arc<dyn MessageSource>,
    extractor: Extractor,
    refresher: Option<Arc<dyn TokenRefresher>>,
    secondary: Option<Arc<dyn MessageSource>>,
    filter: RelevanceFilter,
    sink: Arc<dyn SnapshotSink>,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    pub fn secondary(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.secondary = Some(source);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn filter(mut self, filter: RelevanceFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> SyncOrchestrator {
        SyncOrchestrator {
            inner: Arc::new(Inner {
                credentials: self.credentials,
                refresher: self.refresher,
                primary: self.primary,
                secondary: self.secondary,
                extractor: self.extractor,
                filter: self.filter,
                sink: self.sink,
                config: self.config,
                workspaces: DashMap::new(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn builder(
        credentials: Arc<dyn CredentialStore>,
        primary: Arc<dyn MessageSource>,
        extractor: Extractor,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            credentials,
            primary,
            extractor,
            refresher: None,
            secondary: None,
            filter: RelevanceFilter::default(),
            sink: Arc::new(NoopSink),
            config: OrchestratorConfig::default(),
        }
    }

    /// Start a run in the background. Must be called inside a Tokio runtime.
    pub async fn trigger(&self, org: &OrganisationId) -> Result<TriggerAck, TriggerError> {
        let platform = self.inner.primary.platform();
        if !self.is_connected(org, platform).await {
            return Err(TriggerError::Disconnected(platform));
        }

        let workspace = self.inner.workspace(org);
        let started_at = Utc::now();
        let claimed = workspace.status.send_if_modified(|report| {
            if report.status == SyncState::Syncing {
                return false;
            }
            report.status = SyncState::Syncing;
            report.progress = SyncProgress::starting();
            report.failure = None;
            report.drive_check = None;
            report.started_at = Some(started_at);
            true
        });
        if !claimed {
            debug!(%org, "sync already running");
            return Err(TriggerError::AlreadySyncing(org.clone()));
        }

        info!(%org, "sync started");
        let inner = self.inner.clone();
        let run_org = org.clone();
        tokio::spawn(async move { inner.supervise(run_org, workspace).await });

        Ok(TriggerAck {
            org: org.clone(),
            started_at,
        })
    }

    pub fn status(&self, org: &OrganisationId) -> SyncStatusReport {
        self.inner
            .workspaces
            .get(org)
            .map(|ws| ws.status.borrow().clone())
            .unwrap_or_else(SyncStatusReport::idle)
    }

    pub fn snapshot(&self, org: &OrganisationId) -> Arc<SyncSnapshot> {
        self.inner
            .workspaces
            .get(org)
            .map(|ws| ws.snapshot.borrow().clone())
            .unwrap_or_default()
    }

    /// Live status updates for `org`.
    pub fn subscribe(&self, org: &OrganisationId) -> watch::Receiver<SyncStatusReport> {
        self.inner.workspace(org).status.subscribe()
    }

    pub fn organisations(&self) -> Vec<OrganisationId> {
        self.inner
            .workspaces
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub async fn is_connected(&self, org: &OrganisationId, platform: Platform) -> bool {
        let lookup = org.clone();
        match with_store(&self.inner.credentials, move |store| {
            Ok(store.is_connected(&lookup, platform))
        })
        .await
        {
            Ok(connected) => connected,
            Err(e) => {
                warn!(%org, %platform, "credential lookup failed: {}", e);
                false
            }
        }
    }

    pub async fn store_credential(
        &self,
        org: &OrganisationId,
        credential: Credential,
    ) -> Result<(), AuthError> {
        let org = org.clone();
        with_store(&self.inner.credentials, move |store| store.store(&org, credential)).await
    }

    pub async fn clear_credential(
        &self,
        org: &OrganisationId,
        platform: Platform,
    ) -> Result<(), AuthError> {
        let org = org.clone();
        with_store(&self.inner.credentials, move |store| store.clear(&org, platform)).await
    }

    /// Seed an organisation's snapshot from the sink. Returns false when
    /// nothing was stored or a run is in progress.
    pub async fn restore(&self, org: &OrganisationId) -> Result<bool, SinkError> {
        let Some(snapshot) = self.inner.sink.load(org).await? else {
            return Ok(false);
        };
        let workspace = self.inner.workspace(org);
        let counts = snapshot.counts();
        let last_sync_at = snapshot.last_sync_at;

        let seeded = workspace.status.send_if_modified(|report| {
            if report.status == SyncState::Syncing {
                return false;
            }
            report.counts = counts;
            report.last_sync_at = last_sync_at;
            true
        });
        if seeded {
            workspace.snapshot.send_replace(Arc::new(snapshot));
            info!(%org, events = counts.events, contacts = counts.contacts, "restored snapshot");
        }
        Ok(seeded)
    }
}

impl Inner {
    fn workspace(&self, org: &OrganisationId) -> Arc<Workspace> {
        self.workspaces
            .entry(org.clone())
            .or_insert_with(|| Arc::new(Workspace::new()))
            .clone()
    }

    /// Runs the pipeline on its own task so a panic is recorded instead of
    /// leaving the organisation stuck in `syncing`.
    async fn supervise(self: Arc<Self>, org: OrganisationId, workspace: Arc<Workspace>) {
        let runner = self.clone();
        let run_org = org.clone();
        let run_ws = workspace.clone();
        let handle = tokio::spawn(async move { runner.run(&run_org, &run_ws).await });

        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    format!("sync task panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    "sync task was cancelled".to_string()
                };
                Err(PhaseError::new(workspace.current_phase(), reason))
            }
        };

        match result {
            Ok(summary) => {
                workspace.status.send_modify(|report| {
                    report.status = SyncState::Completed;
                    report.progress.advance(SyncPhase::Done, 100, "sync complete");
                    report.last_sync_at = Some(summary.finished_at);
                    report.counts = summary.counts;
                    report.failure = None;
                });
                info!(
                    %org,
                    events = summary.counts.events,
                    contacts = summary.counts.contacts,
                    insights = summary.counts.insights,
                    documents = summary.counts.documents,
                    "sync completed"
                );
            }
            Err(err) => {
                error!(%org, phase = err.phase.label(), "sync failed: {}", err.message);
                workspace.status.send_modify(|report| {
                    report.status = SyncState::Error;
                    report.progress.phase = err.phase;
                    report.progress.message = format!("failed while {}", err.phase.label());
                    report.failure = Some(SyncFailure {
                        phase: err.phase,
                        message: err.message,
                        at: Utc::now(),
                    });
                });
            }
        }
    }

    async fn run(&self, org: &OrganisationId, ws: &Workspace) -> Result<RunSummary, PhaseError> {
        // Fetch
        ws.advance(SyncPhase::Fetch, 0, SyncPhase::Fetch.label());
        let credential = self
            .credential_for(org)
            .await
            .map_err(|e| PhaseError::new(SyncPhase::Fetch, e))?;
        let headers = self
            .primary
            .list_recent(&credential, self.config.max_results)
            .await
            .map_err(|e| PhaseError::new(SyncPhase::Fetch, e))?;
        info!(%org, source = self.primary.name(), "fetched {} candidates", headers.len());
        ws.advance(
            SyncPhase::Fetch,
            SyncPhase::Fetch.range().1,
            format!("fetched {} messages", headers.len()),
        );

        // Filter
        let total = headers.len();
        let mut retained: Vec<CandidateDocument> = Vec::new();
        ws.advance(SyncPhase::Filter, SyncPhase::Filter.position(0, total), SyncPhase::Filter.label());
        for (idx, header) in headers.into_iter().enumerate() {
            let verdict = self.filter.classify(&header.prefilter_text(), &header.sender);
            if verdict.is_relevant {
                if !retained.is_empty() && !self.config.body_fetch_delay.is_zero() {
                    sleep(self.config.body_fetch_delay).await;
                }
                let fetched = self.primary.fetch_body(&credential, &header.id).await;
                match fetched {
                    Ok(body) => retained.push(CandidateDocument { header, body }),
                    Err(e) => {
                        warn!(%org, phase = "filter", document_id = %header.id, "dropping document: {}", e);
                    }
                }
            } else {
                debug!(
                    %org,
                    document_id = %header.id,
                    score = verdict.relevance_score,
                    "not relevant"
                );
            }
            ws.advance(
                SyncPhase::Filter,
                SyncPhase::Filter.position(idx + 1, total),
                format!("filtered {}/{}", idx + 1, total),
            );
        }
        info!(%org, "{} of {} candidates retained", retained.len(), total);

        // Extract
        let inputs: Vec<ExtractionInput> = retained.into_iter().map(ExtractionInput::from).collect();
        let of = inputs.len();
        ws.advance(
            SyncPhase::Extract,
            SyncPhase::Extract.position(0, of),
            format!("extracting from {} documents", of),
        );
        let batch = self
            .extractor
            .extract_batch(&inputs, |done, of| {
                ws.advance(
                    SyncPhase::Extract,
                    SyncPhase::Extract.position(done, of),
                    format!("extracted {}/{}", done, of),
                )
            })
            .await
            .map_err(|e| PhaseError::new(SyncPhase::Extract, e))?;
        if batch.documents_empty > 0 {
            debug!(%org, "{} documents yielded nothing", batch.documents_empty);
        }

        // Drive check
        ws.advance(
            SyncPhase::DriveCheck,
            SyncPhase::DriveCheck.range().0,
            SyncPhase::DriveCheck.label(),
        );
        let (outcome, documents) = self.drive_check(org, &credential).await;
        ws.status.send_modify(|report| {
            report.drive_check = Some(outcome);
            report
                .progress
                .advance(SyncPhase::DriveCheck, SyncPhase::DriveCheck.range().1, "drive checked");
        });

        // Finalize
        ws.advance(
            SyncPhase::Finalize,
            SyncPhase::Finalize.range().0,
            SyncPhase::Finalize.label(),
        );
        let finished_at = Utc::now();
        let snapshot = SyncSnapshot {
            events: batch.events,
            contacts: dedup_contacts(batch.contacts),
            insights: dedup_insights(batch.insights),
            documents,
            last_sync_at: Some(finished_at),
        };
        self.sink
            .persist(org, &snapshot)
            .await
            .map_err(|e| PhaseError::new(SyncPhase::Finalize, e))?;
        let counts = snapshot.counts();
        ws.snapshot.send_replace(Arc::new(snapshot));

        Ok(RunSummary {
            counts,
            finished_at,
        })
    }

    /// Stored credential, refreshed first when it has expired and can be.
    async fn credential_for(&self, org: &OrganisationId) -> Result<Credential, String> {
        let platform = self.primary.platform();
        let lookup = org.clone();
        let credential = with_store(&self.credentials, move |store| store.get(&lookup, platform))
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("{} is not connected", platform.display_name()))?;

        let Some(refresher) = self.refresher.as_ref() else {
            return Ok(credential);
        };
        if !credential.is_expired() || !credential.can_refresh() {
            return Ok(credential);
        }

        match refresher.refresh(&credential).await {
            Ok(fresh) => {
                let (owner, stored) = (org.clone(), fresh.clone());
                if let Err(e) =
                    with_store(&self.credentials, move |store| store.store(&owner, stored)).await
                {
                    warn!(%org, %platform, "could not store refreshed credential: {}", e);
                }
                info!(%org, %platform, "refreshed expired credential");
                Ok(fresh)
            }
            Err(e) => {
                warn!(%org, %platform, "token refresh failed, using stored token: {}", e);
                Ok(credential)
            }
        }
    }

    async fn drive_check(
        &self,
        org: &OrganisationId,
        credential: &Credential,
    ) -> (BestEffortOutcome, Vec<RelevantDocument>) {
        let Some(source) = self.secondary.as_ref() else {
            return (
                BestEffortOutcome::Skipped {
                    reason: "no secondary source configured".to_string(),
                },
                Vec::new(),
            );
        };
        if source.platform() != credential.platform {
            return (
                BestEffortOutcome::Skipped {
                    reason: format!("{} needs a {} credential", source.name(), source.platform()),
                },
                Vec::new(),
            );
        }

        match source
            .list_recent(credential, self.config.secondary_max_results)
            .await
        {
            Ok(headers) => {
                let listed = headers.len();
                let documents: Vec<RelevantDocument> = headers
                    .into_iter()
                    .filter_map(|header| {
                        let verdict = self.filter.classify(&header.prefilter_text(), &header.sender);
                        verdict.is_relevant.then(|| RelevantDocument {
                            id: header.id,
                            title: header.subject,
                            link: header.link,
                            modified_at: header.received_at,
                            category: verdict.category,
                            relevance_score: verdict.relevance_score,
                        })
                    })
                    .collect();
                info!(%org, source = source.name(), "{} of {} files relevant", documents.len(), listed);
                (
                    BestEffortOutcome::Completed {
                        listed,
                        relevant: documents.len(),
                    },
                    documents,
                )
            }
            Err(e) => {
                warn!(%org, phase = "drive_check", source = source.name(), "skipped: {}", e);
                (
                    BestEffortOutcome::Skipped {
                        reason: e.to_string(),
                    },
                    Vec::new(),
                )
            }
        }
    }
}

/// Keychain-backed stores block on the OS, so store calls go to the blocking pool.
async fn with_store<T, F>(store: &Arc<dyn CredentialStore>, op: F) -> Result<T, AuthError>
where
    T: Send + 'static,
    F: FnOnce(&dyn CredentialStore) -> Result<T, AuthError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| AuthError::Store(format!("credential task failed: {}", e)))?
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use unify_auth_bridge::{AuthError, MemoryCredentialStore};

    use super::*;
    use crate::extractor::testing::ScriptedModel;
    use crate::extractor::{ExtractorConfig, LlmError};
    use crate::model::CandidateHeader;
    use crate::sources::SourceError;

    const IFTAR_JSON: &str = r#"{"category": "event",
        "events": [{"title": "Charity Iftar", "start_date": "2025-03-14", "event_type": "charity", "confidence": 0.9}],
        "contacts": [{"name": "Halal Bites", "contact_type": "vendor", "email": "orders@halalbites.ie", "confidence": 0.4}],
        "insights": ["Iftars draw the biggest crowds"]}"#;

    const CATERER_JSON: &str = r#"{"category": "contact",
        "events": [],
        "contacts": [{"name": "Halal Bites Ltd", "contact_type": "vendor", "email": "ORDERS@halalbites.ie", "confidence": 0.9}],
        "insights": ["Iftars draw the biggest crowds"]}"#;

    #[derive(Default)]
    struct FakeSource {
        headers: Vec<CandidateHeader>,
        bodies: HashMap<String, String>,
        list_calls: AtomicU32,
        tokens_seen: Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
        fail_list: bool,
        panic_on_list: bool,
    }

    impl FakeSource {
        fn with_message(mut self, id: &str, subject: &str, sender: &str, body: &str) -> Self {
            let secs = 1_700_000_000 - self.headers.len() as i64;
            self.headers.push(CandidateHeader {
                id: id.to_string(),
                platform: Platform::Google,
                sender: sender.to_string(),
                received_at: Utc.timestamp_opt(secs, 0).unwrap(),
                subject: subject.to_string(),
                snippet: String::new(),
                link: Some(format!("https://example.com/{}", id)),
            });
            self.bodies.insert(id.to_string(), body.to_string());
            self
        }

        fn list_calls(&self) -> u32 {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        fn platform(&self) -> Platform {
            Platform::Google
        }

        fn name(&self) -> &'static str {
            "fake"
        }

        async fn list_recent(
            &self,
            credential: &Credential,
            max_results: usize,
        ) -> Result<Vec<CandidateHeader>, SourceError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.tokens_seen
                .lock()
                .unwrap()
                .push(credential.access_token.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.panic_on_list {
                panic!("source exploded");
            }
            if self.fail_list {
                return Err(SourceError::unavailable("fake", "offline"));
            }
            Ok(self.headers.iter().take(max_results).cloned().collect())
        }

        async fn fetch_body(&self, _credential: &Credential, id: &str) -> Result<String, SourceError> {
            self.bodies
                .get(id)
                .cloned()
                .ok_or_else(|| SourceError::unavailable("fake", "body gone"))
        }
    }

    struct FailingSink;

    #[async_trait]
    impl SnapshotSink for FailingSink {
        async fn persist(&self, _org: &OrganisationId, _snapshot: &SyncSnapshot) -> Result<(), SinkError> {
            Err(SinkError::Rejected("disk full".to_string()))
        }
    }

    struct FakeRefresher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut fresh = credential.clone();
            fresh.access_token = "fresh-token".to_string();
            fresh.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
            Ok(fresh)
        }
    }

    fn org() -> OrganisationId {
        OrganisationId::new("tcd-isoc")
    }

    fn connected_store() -> Arc<MemoryCredentialStore> {
        let store = Arc::new(MemoryCredentialStore::new());
        store
            .store(&org(), Credential::bearer(Platform::Google, "token"))
            .unwrap();
        store
    }

    fn iftar_source() -> FakeSource {
        FakeSource::default()
            .with_message(
                "m1",
                "Charity iftar fundraiser event",
                "isoc@tcd.ie",
                "Iftar on 14 March, catering by Halal Bites",
            )
            .with_message("m2", "Your parcel has shipped", "shop@example.com", "tracking")
    }

    fn extractor(model: Arc<ScriptedModel>) -> Extractor {
        Extractor::new(
            model,
            ExtractorConfig {
                extract_delay: Duration::ZERO,
                ..ExtractorConfig::default()
            },
        )
    }

    fn orchestrator(
        store: Arc<MemoryCredentialStore>,
        source: Arc<FakeSource>,
        model: Arc<ScriptedModel>,
    ) -> OrchestratorBuilder {
        SyncOrchestrator::builder(store, source, extractor(model))
    }

    async fn wait_terminal(orch: &SyncOrchestrator, org: &OrganisationId) -> SyncStatusReport {
        let mut rx = orch.subscribe(org);
        let report = timeout(Duration::from_secs(5), rx.wait_for(|r| r.is_terminal()))
            .await
            .expect("sync did not finish")
            .expect("status channel closed");
        report.clone()
    }

    #[tokio::test]
    async fn test_successful_run_publishes_snapshot() {
        let source = Arc::new(iftar_source());
        let model = Arc::new(ScriptedModel::new(IFTAR_JSON));
        let orch = orchestrator(connected_store(), source.clone(), model.clone()).build();

        assert_eq!(orch.status(&org()).status, SyncState::Idle);
        let ack = orch.trigger(&org()).await.unwrap();
        assert_eq!(ack.org, org());

        let report = wait_terminal(&orch, &org()).await;
        assert_eq!(report.status, SyncState::Completed);
        assert_eq!(report.progress.current, 100);
        assert_eq!(report.progress.phase, SyncPhase::Done);
        assert_eq!(report.counts.events, 1);
        assert!(report.failure.is_none());
        assert!(matches!(
            report.drive_check,
            Some(BestEffortOutcome::Skipped { .. })
        ));

        // Only the relevant message reaches the model.
        assert_eq!(model.call_count(), 1);
        let snapshot = orch.snapshot(&org());
        assert_eq!(snapshot.events[0].title, "Charity Iftar");
        assert_eq!(snapshot.events[0].source_document_id.as_deref(), Some("m1"));
        assert_eq!(snapshot.last_sync_at, report.last_sync_at);
    }

    #[tokio::test]
    async fn test_failed_body_fetch_drops_only_that_document() {
        let mut source = FakeSource::default()
            .with_message(
                "m1",
                "Charity iftar fundraiser event",
                "isoc@tcd.ie",
                "Iftar on 14 March, catering by Halal Bites",
            )
            .with_message(
                "m2",
                "Eid dinner fundraiser event",
                "isoc@tcd.ie",
                "unused",
            );
        source.bodies.remove("m2");
        let source = Arc::new(source);
        let model = Arc::new(ScriptedModel::new(IFTAR_JSON));
        let orch = orchestrator(connected_store(), source, model.clone()).build();

        orch.trigger(&org()).await.unwrap();
        let report = wait_terminal(&orch, &org()).await;
        assert_eq!(report.status, SyncState::Completed);
        assert!(report.failure.is_none());
        assert_eq!(model.call_count(), 1);

        let snapshot = orch.snapshot(&org());
        assert_eq!(snapshot.events.len(), 1);
        assert_eq!(snapshot.events[0].source_document_id.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_trigger_while_syncing_is_rejected() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(FakeSource {
            gate: Some(gate.clone()),
            ..iftar_source()
        });
        let orch = orchestrator(
            connected_store(),
            source.clone(),
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .build();

        orch.trigger(&org()).await.unwrap();
        assert_eq!(orch.status(&org()).status, SyncState::Syncing);
        assert_eq!(
            orch.trigger(&org()).await,
            Err(TriggerError::AlreadySyncing(org()))
        );

        gate.notify_one();
        let report = wait_terminal(&orch, &org()).await;
        assert_eq!(report.status, SyncState::Completed);
        assert_eq!(source.list_calls(), 1);

        // Terminal states may be re-entered.
        gate.notify_one();
        orch.trigger(&org()).await.unwrap();
        wait_terminal(&orch, &org()).await;
        assert_eq!(source.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_extract_failure_preserves_snapshot() {
        let source = Arc::new(iftar_source());
        let model = Arc::new(
            ScriptedModel::new("unused")
                .then(Ok(IFTAR_JSON.to_string()))
                .then(Err(LlmError::Unauthorized(401))),
        );
        let orch = orchestrator(connected_store(), source, model).build();

        orch.trigger(&org()).await.unwrap();
        let first = wait_terminal(&orch, &org()).await;
        assert_eq!(first.status, SyncState::Completed);
        let before = orch.snapshot(&org());
        assert_eq!(before.events.len(), 1);

        orch.trigger(&org()).await.unwrap();
        let second = wait_terminal(&orch, &org()).await;
        assert_eq!(second.status, SyncState::Error);
        let failure = second.failure.expect("failure recorded");
        assert_eq!(failure.phase, SyncPhase::Extract);
        assert!(failure.message.contains("401"));

        let after = orch.snapshot(&org());
        assert_eq!(*after, *before);
        assert_eq!(second.last_sync_at, first.last_sync_at);
        assert_eq!(second.counts, first.counts);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_error_in_fetch() {
        let source = Arc::new(FakeSource {
            fail_list: true,
            ..FakeSource::default()
        });
        let orch = orchestrator(
            connected_store(),
            source,
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .build();

        orch.trigger(&org()).await.unwrap();
        let report = wait_terminal(&orch, &org()).await;
        assert_eq!(report.status, SyncState::Error);
        assert_eq!(report.failure.unwrap().phase, SyncPhase::Fetch);
        assert!(orch.snapshot(&org()).events.is_empty());
    }

    /// Records which threads touched the store.
    #[derive(Default)]
    struct ThreadRecordingStore {
        inner: MemoryCredentialStore,
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ThreadRecordingStore {
        fn record(&self) {
            self.threads.lock().unwrap().push(std::thread::current().id());
        }
    }

    impl CredentialStore for ThreadRecordingStore {
        fn store(&self, org: &OrganisationId, credential: Credential) -> Result<(), AuthError> {
            self.record();
            self.inner.store(org, credential)
        }

        fn get(&self, org: &OrganisationId, platform: Platform) -> Result<Option<Credential>, AuthError> {
            self.record();
            self.inner.get(org, platform)
        }

        fn clear(&self, org: &OrganisationId, platform: Platform) -> Result<(), AuthError> {
            self.record();
            self.inner.clear(org, platform)
        }
    }

    #[tokio::test]
    async fn test_credential_calls_leave_the_runtime_thread() {
        let store = Arc::new(ThreadRecordingStore::default());
        let model = Arc::new(ScriptedModel::new(IFTAR_JSON));
        let orch = SyncOrchestrator::builder(
            store.clone(),
            Arc::new(iftar_source()),
            extractor(model),
        )
        .build();

        orch.store_credential(&org(), Credential::bearer(Platform::Google, "token"))
            .await
            .unwrap();
        assert!(orch.is_connected(&org(), Platform::Google).await);
        orch.trigger(&org()).await.unwrap();
        assert_eq!(wait_terminal(&orch, &org()).await.status, SyncState::Completed);
        orch.clear_credential(&org(), Platform::Google).await.unwrap();
        assert!(!orch.is_connected(&org(), Platform::Google).await);

        let runtime_thread = std::thread::current().id();
        let threads = store.threads.lock().unwrap();
        assert!(threads.len() >= 5);
        assert!(threads.iter().all(|id| *id != runtime_thread));
    }

    #[tokio::test]
    async fn test_disconnected_org_cannot_trigger() {
        let source = Arc::new(iftar_source());
        let orch = orchestrator(
            Arc::new(MemoryCredentialStore::new()),
            source.clone(),
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .build();

        assert_eq!(
            orch.trigger(&org()).await,
            Err(TriggerError::Disconnected(Platform::Google))
        );
        assert_eq!(orch.status(&org()).status, SyncState::Idle);
        assert_eq!(source.list_calls(), 0);
    }

    #[tokio::test]
    async fn test_contacts_deduplicated_across_documents() {
        let source = Arc::new(
            iftar_source().with_message(
                "m3",
                "Catering quote for the iftar dinner",
                "orders@halalbites.ie",
                "Quote attached",
            ),
        );
        let model = Arc::new(
            ScriptedModel::new("{}")
                .then(Ok(IFTAR_JSON.to_string()))
                .then(Ok(CATERER_JSON.to_string())),
        );
        let orch = orchestrator(connected_store(), source, model).build();

        orch.trigger(&org()).await.unwrap();
        let report = wait_terminal(&orch, &org()).await;
        assert_eq!(report.status, SyncState::Completed);

        let snapshot = orch.snapshot(&org());
        assert_eq!(snapshot.contacts.len(), 1);
        assert_eq!(snapshot.contacts[0].confidence, 0.9);
        assert_eq!(snapshot.contacts[0].name, "Halal Bites Ltd");
        assert_eq!(snapshot.insights.len(), 1);
    }

    #[tokio::test]
    async fn test_drive_failure_does_not_fail_run() {
        let drive = Arc::new(FakeSource {
            fail_list: true,
            ..FakeSource::default()
        });
        let orch = orchestrator(
            connected_store(),
            Arc::new(iftar_source()),
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .secondary(drive)
        .build();

        orch.trigger(&org()).await.unwrap();
        let report = wait_terminal(&orch, &org()).await;
        assert_eq!(report.status, SyncState::Completed);
        match report.drive_check {
            Some(BestEffortOutcome::Skipped { reason }) => assert!(reason.contains("offline")),
            other => panic!("unexpected drive outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relevant_drive_documents_published() {
        let drive = Arc::new(
            FakeSource::default()
                .with_message("d1", "Iftar budget and catering quote", "treasurer@tcd.ie", "")
                .with_message("d2", "Holiday photos", "me@example.com", ""),
        );
        let orch = orchestrator(
            connected_store(),
            Arc::new(iftar_source()),
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .secondary(drive)
        .build();

        orch.trigger(&org()).await.unwrap();
        let report = wait_terminal(&orch, &org()).await;
        assert_eq!(
            report.drive_check,
            Some(BestEffortOutcome::Completed {
                listed: 2,
                relevant: 1
            })
        );
        let snapshot = orch.snapshot(&org());
        assert_eq!(snapshot.documents.len(), 1);
        assert_eq!(snapshot.documents[0].id, "d1");
        assert_eq!(report.counts.documents, 1);
    }

    #[tokio::test]
    async fn test_sink_failure_is_error_in_finalize() {
        let orch = orchestrator(
            connected_store(),
            Arc::new(iftar_source()),
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .sink(Arc::new(FailingSink))
        .build();

        orch.trigger(&org()).await.unwrap();
        let report = wait_terminal(&orch, &org()).await;
        assert_eq!(report.status, SyncState::Error);
        assert_eq!(report.failure.unwrap().phase, SyncPhase::Finalize);
        assert!(orch.snapshot(&org()).events.is_empty());
        assert_eq!(report.last_sync_at, None);
    }

    #[tokio::test]
    async fn test_panic_is_recorded_as_error() {
        let source = Arc::new(FakeSource {
            panic_on_list: true,
            ..FakeSource::default()
        });
        let orch = orchestrator(
            connected_store(),
            source,
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .build();

        orch.trigger(&org()).await.unwrap();
        let report = wait_terminal(&orch, &org()).await;
        assert_eq!(report.status, SyncState::Error);
        let failure = report.failure.unwrap();
        assert_eq!(failure.phase, SyncPhase::Fetch);
        assert!(failure.message.contains("source exploded"));

        // The organisation is not stuck.
        assert!(orch.trigger(&org()).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_credential_refreshed_before_fetch() {
        let store = Arc::new(MemoryCredentialStore::new());
        let mut stale = Credential::bearer(Platform::Google, "stale-token");
        stale.refresh_token = Some("refresh".to_string());
        stale.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));
        store.store(&org(), stale).unwrap();

        let source = Arc::new(iftar_source());
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicU32::new(0),
        });
        let orch = orchestrator(store.clone(), source.clone(), Arc::new(ScriptedModel::new(IFTAR_JSON)))
            .refresher(refresher.clone())
            .build();

        orch.trigger(&org()).await.unwrap();
        wait_terminal(&orch, &org()).await;

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.tokens_seen.lock().unwrap().as_slice(), ["fresh-token"]);
        let stored = store.get(&org(), Platform::Google).unwrap().unwrap();
        assert_eq!(stored.access_token, "fresh-token");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh"));
    }

    #[tokio::test]
    async fn test_restore_seeds_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(crate::sink::JsonFileSnapshotSink::new(dir.path()));
        let orch = orchestrator(
            connected_store(),
            Arc::new(iftar_source()),
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .sink(sink.clone())
        .build();

        orch.trigger(&org()).await.unwrap();
        wait_terminal(&orch, &org()).await;

        let fresh = orchestrator(
            connected_store(),
            Arc::new(iftar_source()),
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .sink(sink)
        .build();
        assert!(fresh.restore(&org()).await.unwrap());
        assert_eq!(*fresh.snapshot(&org()), *orch.snapshot(&org()));
        let status = fresh.status(&org());
        assert_eq!(status.status, SyncState::Idle);
        assert_eq!(status.counts.events, 1);
        assert!(!fresh.restore(&OrganisationId::new("other")).await.unwrap());
    }

    #[tokio::test]
    async fn test_organisations_are_isolated() {
        let store = connected_store();
        let other = OrganisationId::new("ucd-isoc");
        store
            .store(&other, Credential::bearer(Platform::Google, "t2"))
            .unwrap();
        let orch = orchestrator(
            store,
            Arc::new(iftar_source()),
            Arc::new(ScriptedModel::new(IFTAR_JSON)),
        )
        .build();

        orch.trigger(&org()).await.unwrap();
        // A run for one organisation does not block another.
        orch.trigger(&other).await.unwrap();
        assert_eq!(orch.status(&other).status, SyncState::Syncing);
        wait_terminal(&orch, &org()).await;
        wait_terminal(&orch, &other).await;
        assert_eq!(orch.organisations().len(), 2);
    }
}
