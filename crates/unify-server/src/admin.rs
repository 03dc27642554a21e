//! Admin socket protocol: one JSON request per line, one or more JSON
//! responses per request. `watch_sync` streams `event` responses before its
//! final one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use unify_auth_bridge::{Credential, OrganisationId, Platform};
use unify_core::{Engine, SyncState, SyncStatusReport, TriggerError, UnifyPaths};

pub struct ServerState {
    engine: RwLock<Option<Engine>>,
    pub paths: UnifyPaths,
    started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(paths: UnifyPaths) -> Self {
        Self {
            engine: RwLock::new(None),
            paths,
            started_at: Utc::now(),
        }
    }

    pub async fn set_engine(&self, engine: Engine) {
        *self.engine.write().await = Some(engine);
    }

    async fn is_ready(&self) -> bool {
        self.engine.read().await.is_some()
    }

    async fn engine(&self) -> Option<Engine> {
        self.engine.read().await.clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminRequest {
    pub id: Option<String>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct AdminResponse {
    pub id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable failure kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<SyncStatusReport>,
}

impl AdminResponse {
    fn ok(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
            code: None,
            event: None,
        }
    }

    fn err(id: Option<String>, code: &'static str, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
            code: Some(code),
            event: None,
        }
    }

    fn progress(id: Option<String>, report: SyncStatusReport) -> Self {
        Self {
            id,
            ok: true,
            result: None,
            error: None,
            code: None,
            event: Some(report),
        }
    }
}

#[derive(Clone)]
pub struct AdminHandler {
    state: Arc<ServerState>,
}

impl AdminHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    /// Handle one request. Intermediate events go to `events`; the returned
    /// response is always the last one for this request id.
    pub async fn handle(
        &self,
        request: AdminRequest,
        events: &mpsc::UnboundedSender<AdminResponse>,
    ) -> AdminResponse {
        let id = request.id.clone();

        // Available before the engine is ready.
        match request.method.as_deref() {
            Some("ping") => return AdminResponse::ok(id, json!({"pong": true})),
            Some("get_status") if request.params.get("org").is_none() => {
                let ready = self.state.is_ready().await;
                return AdminResponse::ok(id, self.daemon_status(ready).await);
            }
            None => return AdminResponse::err(id, "invalid_request", "missing method"),
            _ => {}
        }

        let Some(engine) = self.state.engine().await else {
            return AdminResponse::err(id, "not_ready", "Engine still initializing, please wait...");
        };

        match self.dispatch(&engine, &request, events).await {
            Ok(result) => AdminResponse::ok(id, result),
            Err((code, message)) => AdminResponse::err(id, code, message),
        }
    }

    async fn daemon_status(&self, ready: bool) -> Value {
        let organisations: Vec<String> = match self.state.engine().await {
            Some(engine) => engine
                .orchestrator
                .organisations()
                .into_iter()
                .map(|org| org.as_str().to_string())
                .collect(),
            None => Vec::new(),
        };
        json!({
            "running": true,
            "ready": ready,
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": self.state.started_at,
            "organisations": organisations,
        })
    }

    async fn dispatch(
        &self,
        engine: &Engine,
        request: &AdminRequest,
        events: &mpsc::UnboundedSender<AdminResponse>,
    ) -> Result<Value, (&'static str, String)> {
        let params = &request.params;
        let orchestrator = &engine.orchestrator;

        match request.method.as_deref().unwrap_or_default() {
            "get_status" => {
                let org = org_param(params)?;
                let mut status = self.daemon_status(true).await;
                status["sync"] = to_value(&orchestrator.status(&org))?;
                Ok(status)
            }
            "trigger_sync" => {
                let org = org_param(params)?;
                match orchestrator.trigger(&org).await {
                    Ok(ack) => to_value(&ack),
                    Err(err @ TriggerError::AlreadySyncing(_)) => {
                        Err(("already_syncing", err.to_string()))
                    }
                    Err(err @ TriggerError::Disconnected(_)) => {
                        Err(("disconnected", err.to_string()))
                    }
                }
            }
            "get_snapshot" => {
                let org = org_param(params)?;
                to_value(&*orchestrator.snapshot(&org))
            }
            "watch_sync" => {
                let org = org_param(params)?;
                let mut rx = orchestrator.subscribe(&org);
                loop {
                    let report = rx.borrow_and_update().clone();
                    if report.status != SyncState::Syncing {
                        return to_value(&report);
                    }
                    if events
                        .send(AdminResponse::progress(request.id.clone(), report))
                        .is_err()
                    {
                        debug!(%org, "watcher went away");
                        return Err(("closed", "client disconnected".to_string()));
                    }
                    if rx.changed().await.is_err() {
                        return Err(("closed", "status channel closed".to_string()));
                    }
                }
            }
            "is_connected" => {
                let org = org_param(params)?;
                let platform = platform_param(params)?;
                let connected = orchestrator.is_connected(&org, platform).await;
                Ok(json!({"platform": platform.as_str(), "connected": connected}))
            }
            "store_credential" => {
                let org = org_param(params)?;
                let credential: Credential = params
                    .get("credential")
                    .cloned()
                    .ok_or_else(|| ("invalid_params", "missing credential".to_string()))
                    .and_then(|value| {
                        serde_json::from_value(value)
                            .map_err(|e| ("invalid_params", format!("credential: {}", e)))
                    })?;
                let platform = credential.platform;
                orchestrator
                    .store_credential(&org, credential)
                    .await
                    .map_err(|e| ("store_failed", e.to_string()))?;
                info!(%org, %platform, "credential stored");
                Ok(json!({"platform": platform.as_str(), "connected": true}))
            }
            "clear_credential" => {
                let org = org_param(params)?;
                let platform = platform_param(params)?;
                orchestrator
                    .clear_credential(&org, platform)
                    .await
                    .map_err(|e| ("store_failed", e.to_string()))?;
                info!(%org, %platform, "credential cleared");
                Ok(json!({"platform": platform.as_str(), "connected": false}))
            }
            other => {
                warn!("unknown admin method: {}", other);
                Err(("unknown_method", format!("unknown admin method: {}", other)))
            }
        }
    }
}

fn org_param(params: &Value) -> Result<OrganisationId, (&'static str, String)> {
    params
        .get("org")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(OrganisationId::new)
        .ok_or_else(|| ("invalid_params", "missing org".to_string()))
}

/// Defaults to Google, the only platform with a source today.
fn platform_param(params: &Value) -> Result<Platform, (&'static str, String)> {
    match params.get("platform").and_then(|v| v.as_str()) {
        None => Ok(Platform::Google),
        Some(raw) => Platform::parse(raw)
            .ok_or_else(|| ("invalid_params", format!("unknown platform: {}", raw))),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, (&'static str, String)> {
    serde_json::to_value(value).map_err(|e| ("internal", e.to_string()))
}

pub async fn handle_admin_client(stream: UnixStream, handler: Arc<AdminHandler>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let (tx, mut rx) = mpsc::unbounded_channel::<AdminResponse>();

    let write_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let payload = match serde_json::to_string(&response) {
                Ok(p) => p,
                Err(err) => {
                    error!("Failed to serialize admin response: {}", err);
                    continue;
                }
            };
            if let Err(err) = writer.write_all(payload.as_bytes()).await {
                error!("Failed to write admin response: {}", err);
                break;
            }
            if let Err(err) = writer.write_all(b"\n").await {
                error!("Failed to write newline: {}", err);
                break;
            }
        }
    });

    // Requests run concurrently so a long watch does not block pings.
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<AdminRequest>(trimmed) {
            Ok(request) => {
                debug!(id = ?request.id, method = ?request.method, "admin request");
                let handler = handler.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = handler.handle(request, &tx).await;
                    let _ = tx.send(response);
                });
            }
            Err(err) => {
                info!("Failed to parse admin request: {}", err);
                let _ = tx.send(AdminResponse::err(
                    None,
                    "invalid_request",
                    format!("invalid request: {}", err),
                ));
            }
        }
    }

    drop(tx);
    let _ = write_task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ready_handler() -> (AdminHandler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let paths = UnifyPaths::from_base(dir.path().to_path_buf());
        std::fs::write(
            &paths.config_path,
            "[credentials]\nbackend = \"memory\"\n[drive]\nenabled = false\n",
        )
        .unwrap();
        let engine = Engine::init(&paths).unwrap();
        let state = Arc::new(ServerState::new(paths));
        state.set_engine(engine).await;
        (AdminHandler::new(state), dir)
    }

    fn request(method: &str, params: Value) -> AdminRequest {
        AdminRequest {
            id: Some("t".to_string()),
            method: Some(method.to_string()),
            params,
        }
    }

    #[tokio::test]
    async fn test_ping_before_engine_ready() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(ServerState::new(UnifyPaths::from_base(dir.path().to_path_buf())));
        let handler = AdminHandler::new(state);
        let (tx, _rx) = mpsc::unbounded_channel();

        let pong = handler.handle(request("ping", Value::Null), &tx).await;
        assert!(pong.ok);

        let status = handler.handle(request("get_status", Value::Null), &tx).await;
        assert_eq!(status.result.unwrap()["ready"], json!(false));

        let snap = handler
            .handle(request("get_snapshot", json!({"org": "isoc"})), &tx)
            .await;
        assert!(!snap.ok);
        assert_eq!(snap.code, Some("not_ready"));
    }

    #[tokio::test]
    async fn test_trigger_without_credential_is_rejected() {
        let (handler, _dir) = ready_handler().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let resp = handler
            .handle(request("trigger_sync", json!({"org": "isoc"})), &tx)
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.code, Some("disconnected"));
    }

    #[tokio::test]
    async fn test_credential_round_trip() {
        let (handler, _dir) = ready_handler().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let credential = Credential::bearer(Platform::Google, "ya29.token");

        let stored = handler
            .handle(
                request("store_credential", json!({"org": "isoc", "credential": credential})),
                &tx,
            )
            .await;
        assert!(stored.ok, "{:?}", stored.error);

        let connected = handler
            .handle(request("is_connected", json!({"org": "isoc"})), &tx)
            .await;
        assert_eq!(connected.result.unwrap()["connected"], json!(true));

        handler
            .handle(request("clear_credential", json!({"org": "isoc", "platform": "google"})), &tx)
            .await;
        let connected = handler
            .handle(request("is_connected", json!({"org": "isoc"})), &tx)
            .await;
        assert_eq!(connected.result.unwrap()["connected"], json!(false));
    }

    #[tokio::test]
    async fn test_idle_org_reads() {
        let (handler, _dir) = ready_handler().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let status = handler
            .handle(request("get_status", json!({"org": "isoc"})), &tx)
            .await;
        assert_eq!(status.result.unwrap()["sync"]["status"], json!("idle"));

        let snap = handler
            .handle(request("get_snapshot", json!({"org": "isoc"})), &tx)
            .await;
        assert_eq!(snap.result.unwrap()["events"], json!([]));

        let watched = handler
            .handle(request("watch_sync", json!({"org": "isoc"})), &tx)
            .await;
        assert!(watched.ok);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_params() {
        let (handler, _dir) = ready_handler().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let resp = handler.handle(request("get_snapshot", json!({})), &tx).await;
        assert_eq!(resp.code, Some("invalid_params"));

        let resp = handler
            .handle(request("is_connected", json!({"org": "isoc", "platform": "myspace"})), &tx)
            .await;
        assert_eq!(resp.code, Some("invalid_params"));

        let resp = handler.handle(request("reindex", Value::Null), &tx).await;
        assert_eq!(resp.code, Some("unknown_method"));
    }
}
