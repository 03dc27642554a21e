use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;

use unify_auth_bridge::{Credential, OrganisationId, Platform};
use unify_core::{SyncSnapshot, SyncStatusReport, TriggerAck, UnifyPaths};

#[derive(Debug, Serialize)]
pub struct AdminRequest {
    pub id: Option<String>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct AdminResponse {
    pub ok: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub code: Option<String>,
    pub event: Option<SyncStatusReport>,
}

impl AdminResponse {
    fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        if !self.ok {
            return Err(anyhow!(self
                .error
                .unwrap_or_else(|| "Unknown error".to_string())));
        }
        let result = self.result.ok_or_else(|| anyhow!("No result"))?;
        Ok(serde_json::from_value(result)?)
    }
}

pub struct AdminClient {
    socket_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub ready: bool,
    pub version: String,
    #[serde(default)]
    pub organisations: Vec<String>,
    pub sync: Option<SyncStatusReport>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
}

pub enum TriggerOutcome {
    Started(TriggerAck),
    AlreadyRunning,
}

impl AdminClient {
    pub fn new() -> Self {
        Self {
            socket_path: UnifyPaths::from_env().admin_socket_path,
        }
    }

    pub fn is_daemon_running(&self) -> bool {
        self.socket_path.exists()
    }

    async fn open(&self, request: &AdminRequest) -> Result<Lines<BufReader<OwnedReadHalf>>> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            anyhow!(
                "Cannot connect to daemon at {}: {}",
                self.socket_path.display(),
                e
            )
        })?;
        let (reader, mut writer) = stream.into_split();

        let payload = serde_json::to_string(request)?;
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;

        Ok(BufReader::new(reader).lines())
    }

    async fn send(&self, method: &str, params: Option<serde_json::Value>) -> Result<AdminResponse> {
        let request = AdminRequest {
            id: Some(method.to_string()),
            method: method.to_string(),
            params,
        };
        let mut lines = self.open(&request).await?;
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("Daemon closed the connection"))?;
        Ok(serde_json::from_str(&line)?)
    }

    pub async fn get_status(&self, org: Option<&OrganisationId>) -> Result<DaemonStatus> {
        let params = org.map(|org| serde_json::json!({ "org": org }));
        self.send("get_status", params).await?.into_result()
    }

    pub async fn trigger_sync(&self, org: &OrganisationId) -> Result<TriggerOutcome> {
        let response = self
            .send("trigger_sync", Some(serde_json::json!({ "org": org })))
            .await?;
        if response.code.as_deref() == Some("already_syncing") {
            return Ok(TriggerOutcome::AlreadyRunning);
        }
        Ok(TriggerOutcome::Started(response.into_result()?))
    }

    /// Follow a running sync. `on_progress` sees every intermediate report;
    /// the terminal report is returned.
    pub async fn watch_sync<F>(&self, org: &OrganisationId, mut on_progress: F) -> Result<SyncStatusReport>
    where
        F: FnMut(&SyncStatusReport),
    {
        let request = AdminRequest {
            id: Some(format!("watch_{}", org)),
            method: "watch_sync".to_string(),
            params: Some(serde_json::json!({ "org": org })),
        };
        let mut lines = self.open(&request).await?;

        loop {
            let line = lines
                .next_line()
                .await?
                .ok_or_else(|| anyhow!("Connection closed before sync completed"))?;
            let response: AdminResponse = serde_json::from_str(&line)?;

            if response.ok {
                if let Some(report) = &response.event {
                    on_progress(report);
                    continue;
                }
            }
            return response.into_result();
        }
    }

    pub async fn get_snapshot(&self, org: &OrganisationId) -> Result<SyncSnapshot> {
        self.send("get_snapshot", Some(serde_json::json!({ "org": org })))
            .await?
            .into_result()
    }

    pub async fn is_connected(&self, org: &OrganisationId, platform: Platform) -> Result<bool> {
        let status: ConnectionStatus = self
            .send(
                "is_connected",
                Some(serde_json::json!({ "org": org, "platform": platform.as_str() })),
            )
            .await?
            .into_result()?;
        Ok(status.connected)
    }

    pub async fn store_credential(&self, org: &OrganisationId, credential: &Credential) -> Result<()> {
        let _: ConnectionStatus = self
            .send(
                "store_credential",
                Some(serde_json::json!({ "org": org, "credential": credential })),
            )
            .await?
            .into_result()?;
        Ok(())
    }

    pub async fn clear_credential(&self, org: &OrganisationId, platform: Platform) -> Result<()> {
        let _: ConnectionStatus = self
            .send(
                "clear_credential",
                Some(serde_json::json!({ "org": org, "platform": platform.as_str() })),
            )
            .await?
            .into_result()?;
        Ok(())
    }
}
